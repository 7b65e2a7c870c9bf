//! Periodic timers and the shutdown signal used by the scheduler loops.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::{Interval, MissedTickBehavior};

/// Source of "start the next cycle now" events.
#[async_trait]
pub trait Ticker: Send {
    /// Wait for the next tick. Returns `false` once the ticker can never
    /// fire again.
    async fn tick(&mut self) -> bool;
}

/// Ticks on a fixed period. The first tick fires immediately; a tick missed
/// because the loop was busy is delayed, not bursted.
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    /// Must be called from within a tokio runtime.
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    pub fn period(&self) -> Duration {
        self.interval.period()
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) -> bool {
        self.interval.tick().await;
        true
    }
}

/// Ticks only when told to through its [`ManualTickerHandle`].
pub struct ManualTicker {
    rx: mpsc::UnboundedReceiver<()>,
}

#[derive(Clone)]
pub struct ManualTickerHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl ManualTickerHandle {
    /// Fire one tick. Returns `false` if the ticker has been dropped.
    pub fn tick(&self) -> bool {
        self.tx.send(()).is_ok()
    }
}

pub fn manual_ticker() -> (ManualTickerHandle, ManualTicker) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ManualTickerHandle { tx }, ManualTicker { rx })
}

#[async_trait]
impl Ticker for ManualTicker {
    async fn tick(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}

/// Resolve once shutdown has been requested, or once every sender is gone
/// and shutdown can no longer be requested.
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_interval_ticker_first_tick_is_immediate() {
        let mut ticker = IntervalTicker::new(Duration::from_secs(5));
        let start = tokio::time::Instant::now();
        assert!(ticker.tick().await);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(ticker.tick().await);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert_eq!(ticker.period(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_manual_ticker() {
        let (handle, mut ticker) = manual_ticker();
        assert!(handle.tick());
        assert!(handle.tick());
        assert!(ticker.tick().await);
        assert!(ticker.tick().await);
        drop(handle);
        assert!(!ticker.tick().await);
    }

    #[tokio::test]
    async fn test_shutdown_requested() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { shutdown_requested(&mut rx).await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        tx.send(true).unwrap();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_requested_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        shutdown_requested(&mut rx).await;
    }
}
