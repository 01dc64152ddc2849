//! The transport seam consumed by the sync engine.
//!
//! A [`HeaderTransport`] opens server-streaming calls against a remote node
//! and answers the current chain tip height. The engine treats both as opaque:
//! headers are immutable binary blobs passed through unchanged, and the
//! transport is free to multiplex its streams however it likes as long as a
//! cancelled stream yields the distinguished [`Error::Cancelled`] code.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::Result;

/// An opaque serialized block header (80 bytes on the wire).
pub type RawBlockHeader = Vec<u8>;

/// Continuation point for (re)opening a stream.
///
/// `count` is `None` for the unbounded live-tail subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamArgs {
    pub from_height: u64,
    pub count: Option<u64>,
}

/// One message observed on an open header stream.
#[derive(Debug)]
pub enum StreamItem {
    /// A batch of consecutive raw headers, in chain order.
    Headers(Vec<RawBlockHeader>),
    /// The server finished sending the requested range.
    Finished,
    /// The stream terminated with an error.
    Failed(Error),
}

/// Factory for server-streaming header calls.
#[async_trait]
pub trait HeaderTransport: Send + Sync + 'static {
    /// Open a stream delivering `count` headers starting at `from_height`.
    async fn open_historical_stream(&self, from_height: u64, count: u64) -> Result<HeaderStream>;

    /// Open an unbounded stream delivering headers from `from_height` as they
    /// are produced.
    async fn open_continuous_stream(&self, from_height: u64) -> Result<HeaderStream>;

    /// Height of the current chain tip.
    async fn best_block_height(&self) -> Result<u64>;
}

/// Handle to one underlying server stream.
///
/// The transport implementation feeds `items` and must observe the
/// cancellation token; from the consumer side a cancelled stream always
/// yields `Failed(Error::Cancelled)`.
pub struct HeaderStream {
    items: mpsc::Receiver<StreamItem>,
    cancel: CancellationToken,
}

impl HeaderStream {
    pub fn new(items: mpsc::Receiver<StreamItem>, cancel: CancellationToken) -> Self {
        Self { items, cancel }
    }

    /// Wait for the next item on the stream.
    pub async fn next(&mut self) -> StreamItem {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => StreamItem::Failed(Error::Cancelled),
            item = self.items.recv() => item.unwrap_or_else(|| {
                StreamItem::Failed(Error::Transport("stream closed without end signal".into()))
            }),
        }
    }

    /// Deliberately cancel the underlying stream.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_stream_yields_the_cancellation_code() {
        let (tx, rx) = mpsc::channel(1);
        let mut stream = HeaderStream::new(rx, CancellationToken::new());

        tx.send(StreamItem::Headers(vec![vec![0u8; 80]]))
            .await
            .unwrap();
        assert!(matches!(stream.next().await, StreamItem::Headers(h) if h.len() == 1));

        stream.cancel();
        assert!(matches!(
            stream.next().await,
            StreamItem::Failed(err) if err.is_cancelled()
        ));
    }

    #[tokio::test]
    async fn abrupt_close_is_a_transport_error() {
        let (tx, rx) = mpsc::channel::<StreamItem>(1);
        let mut stream = HeaderStream::new(rx, CancellationToken::new());

        drop(tx);
        assert!(matches!(
            stream.next().await,
            StreamItem::Failed(Error::Transport(_))
        ));
    }
}
