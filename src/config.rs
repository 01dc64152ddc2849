//! Configuration for block header synchronization.
//!
//! All options can come from the command line, from `HEADERS_*` environment
//! variables, or from [`Config::builder`] when the crate is embedded.

use clap::Parser;
use std::time::Duration;

use crate::error::Error;
use crate::Result;

/// Networks the sync engine knows how to talk to.
pub const NETWORKS: [&str; 5] = ["mainnet", "testnet", "devnet", "regtest", "local"];

/// Configuration for the block headers provider.
#[derive(Parser, Debug, Clone)]
#[command(name = "block-headers-sync")]
#[command(about = "Synchronize block headers from the network into local chain state")]
pub struct Config {
    /// Network to synchronize against
    #[arg(long, env = "HEADERS_NETWORK", default_value = "testnet")]
    pub network: String,

    // === Historical Sync ===
    /// Height to start the historical sync from
    #[arg(long, env = "HEADERS_FROM_BLOCK_HEIGHT", default_value = "1")]
    pub from_block_height: u64,

    /// Upper bound on concurrent historical header streams
    #[arg(long, env = "HEADERS_MAX_PARALLEL_STREAMS", default_value = "5")]
    pub max_parallel_streams: u64,

    /// Preferred number of headers per stream window
    #[arg(long, env = "HEADERS_TARGET_BATCH_SIZE", default_value = "500")]
    pub target_batch_size: u64,

    // === Retries & Timeouts ===
    /// Retries per historical stream before the whole sync is aborted
    #[arg(long, env = "HEADERS_MAX_RETRIES", default_value = "10")]
    pub max_retries: u32,

    /// Seconds of stream silence before a reconnect is forced
    #[arg(long, env = "HEADERS_RECONNECT_TIMEOUT_SECS", default_value = "30")]
    pub reconnect_timeout_secs: u64,

    // === Lifecycle ===
    /// Start synchronization as soon as the client connects
    #[arg(long, env = "HEADERS_AUTO_START", default_value = "false")]
    pub auto_start: bool,
}

impl Config {
    /// Create a new Config builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.reconnect_timeout_secs)
    }

    /// Validate that config is consistent.
    pub fn validate(&self) -> Result<()> {
        if !NETWORKS.contains(&self.network.as_str()) {
            return Err(Error::Config(format!(
                "unknown network '{}', expected one of {}",
                self.network,
                NETWORKS.join(", ")
            )));
        }
        if self.from_block_height < 1 {
            return Err(Error::Config(
                "from_block_height must be at least 1".into(),
            ));
        }
        if self.max_parallel_streams < 1 {
            return Err(Error::Config(
                "max_parallel_streams must be at least 1".into(),
            ));
        }
        if self.target_batch_size < 1 {
            return Err(Error::Config("target_batch_size must be at least 1".into()));
        }
        if self.reconnect_timeout_secs < 1 {
            return Err(Error::Config(
                "reconnect_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for Config.
#[derive(Default)]
pub struct ConfigBuilder {
    network: Option<String>,
    from_block_height: Option<u64>,
    max_parallel_streams: Option<u64>,
    target_batch_size: Option<u64>,
    max_retries: Option<u32>,
    reconnect_timeout_secs: Option<u64>,
    auto_start: Option<bool>,
}

impl ConfigBuilder {
    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn from_block_height(mut self, height: u64) -> Self {
        self.from_block_height = Some(height);
        self
    }

    pub fn max_parallel_streams(mut self, streams: u64) -> Self {
        self.max_parallel_streams = Some(streams);
        self
    }

    pub fn target_batch_size(mut self, size: u64) -> Self {
        self.target_batch_size = Some(size);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn reconnect_timeout_secs(mut self, secs: u64) -> Self {
        self.reconnect_timeout_secs = Some(secs);
        self
    }

    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = Some(auto_start);
        self
    }

    pub fn build(self) -> Result<Config> {
        let config = Config {
            network: self.network.unwrap_or_else(|| "testnet".to_string()),
            from_block_height: self.from_block_height.unwrap_or(1),
            max_parallel_streams: self.max_parallel_streams.unwrap_or(5),
            target_batch_size: self.target_batch_size.unwrap_or(500),
            max_retries: self.max_retries.unwrap_or(10),
            reconnect_timeout_secs: self.reconnect_timeout_secs.unwrap_or(30),
            auto_start: self.auto_start.unwrap_or(false),
        };

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_are_valid() {
        let config = Config::builder().build().unwrap();
        assert_eq!(config.network, "testnet");
        assert_eq!(config.from_block_height, 1);
        assert_eq!(config.max_parallel_streams, 5);
        assert_eq!(config.target_batch_size, 500);
        assert_eq!(config.max_retries, 10);
        assert_eq!(config.reconnect_timeout(), Duration::from_secs(30));
        assert!(!config.auto_start);
    }

    #[test]
    fn unknown_network_is_rejected() {
        let err = Config::builder().network("moonnet").build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn zero_valued_limits_are_rejected() {
        assert!(Config::builder().from_block_height(0).build().is_err());
        assert!(Config::builder().max_parallel_streams(0).build().is_err());
        assert!(Config::builder().target_batch_size(0).build().is_err());
        assert!(Config::builder().reconnect_timeout_secs(0).build().is_err());
    }

    #[test]
    fn all_networks_are_accepted() {
        for network in NETWORKS {
            assert!(Config::builder().network(network).build().is_ok());
        }
    }
}
