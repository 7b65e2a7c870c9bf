use std::path::PathBuf;

/// Errors raised while loading, validating, or acting on configuration.
///
/// All of these are start-up errors: they indicate a misconfiguration that
/// would recur on every fetch cycle, so the affected subsystem is not started.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML or does not match the schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration could not be rendered back to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of range or inconsistent with another value.
    #[error("invalid config: {0}")]
    Invalid(String),

    /// The configured fetcher plugin is not registered.
    #[error("unknown fetcher plugin '{name}' (available: {})", available.join(", "))]
    UnknownFetcher { name: String, available: Vec<String> },

    /// A fetch task could not be constructed for a node.
    #[error("cannot construct fetch task for node {node}: {reason}")]
    TaskConstruction { node: String, reason: String },
}
