use std::time::Duration;

/// Immutable settings for a directory server instance.
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// Port the directory listens on.
    pub port: u16,
    /// A relay identity not released within this window is reclaimed.
    pub relay_ttl: Duration,
    /// How often expired relay identities are swept.
    pub sweep_interval: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            port: 23200,
            relay_ttl: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}
