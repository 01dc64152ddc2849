//! # Block Headers Sync
//!
//! Synchronize block headers from the network into local chain state.
//!
//! This library drives a light client's header sync end to end: it discovers
//! the chain tip, fetches the historical range over parallel self-healing
//! streams, then follows new headers as they are produced. Every batch runs
//! through a pluggable chain-state validator before it is published; a batch
//! that fails validation is re-fetched from the network.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use block_headers_sync::{BlockHeadersProvider, Config, ProviderEvent};
//! # use async_trait::async_trait;
//! # use block_headers_sync::{HeaderTransport, RawBlockHeader, Result, SpvChain};
//! # use block_headers_sync::transport::HeaderStream;
//! # struct Chain;
//! # impl SpvChain for Chain {
//! #     fn add_headers(&self, headers: Vec<RawBlockHeader>) -> Result<Vec<RawBlockHeader>> {
//! #         Ok(headers)
//! #     }
//! # }
//! # struct Transport;
//! # #[async_trait]
//! # impl HeaderTransport for Transport {
//! #     async fn open_historical_stream(&self, _: u64, _: u64) -> Result<HeaderStream> {
//! #         unimplemented!()
//! #     }
//! #     async fn open_continuous_stream(&self, _: u64) -> Result<HeaderStream> {
//! #         unimplemented!()
//! #     }
//! #     async fn best_block_height(&self) -> Result<u64> { Ok(1) }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::builder()
//!         .from_block_height(1)
//!         .build()?;
//!
//!     let (mut provider, mut events) = BlockHeadersProvider::new(config, Arc::new(Chain))?;
//!     provider.set_transport(Arc::new(Transport));
//!     provider.start().await?;
//!
//!     while let Some(event) = events.recv().await {
//!         if let ProviderEvent::ChainUpdated { head_height, headers } = event {
//!             println!("{} new headers at height {head_height}", headers.len());
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`provider`]: The sync facade wiring reader events into chain state
//! - [`reader`]: Parallel historical sessions and the continuous live tail
//! - [`stream`]: Self-healing stream wrapper with an idle-reconnect watchdog
//! - [`transport`]: The seam between the sync engine and the wire protocol
//! - [`config`]: Configuration and CLI argument handling

pub mod config;
pub mod error;
pub mod provider;
pub mod reader;
pub mod stream;
pub mod transport;

#[cfg(test)]
pub mod test_utils;

// Re-exports for convenience
pub use config::Config;
pub use error::Error;
pub use provider::{BlockHeadersProvider, ProviderEvent, SpvChain};
pub use reader::{BlockHeadersReader, HeaderBatch, ReaderEvent, ReaderOptions};
pub use stream::{ReconnectingStream, ReconnectingStreamOptions};
pub use transport::{HeaderTransport, RawBlockHeader};

pub type Result<T> = std::result::Result<T, Error>;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::Error;
    pub use crate::provider::{BlockHeadersProvider, ProviderEvent, SpvChain};
    pub use crate::reader::{BlockHeadersReader, HeaderBatch, ReaderEvent};
    pub use crate::transport::{HeaderTransport, RawBlockHeader};
}
