//! Shared test doubles for the transport seam.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::transport::{HeaderStream, HeaderTransport, RawBlockHeader, StreamItem};
use crate::Result;

/// Deterministic header fixtures; content only needs to be distinct.
pub fn raw_headers(n: usize) -> Vec<RawBlockHeader> {
    (0..n).map(|i| vec![i as u8; 80]).collect()
}

/// What the code under test asked the transport for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRequest {
    Historical { from_height: u64, count: u64 },
    Continuous { from_height: u64 },
}

/// Test-side handle to one opened stream: the request that produced it, a
/// sender for scripting items, and the stream's cancellation token.
pub struct OpenedStream {
    pub request: StreamRequest,
    pub items: mpsc::Sender<StreamItem>,
    pub cancel: CancellationToken,
}

/// A transport whose opened streams are handed to the test for scripting.
pub struct MockTransport {
    best_height: u64,
    opened_tx: mpsc::UnboundedSender<OpenedStream>,
    /// Opens remaining before every further open fails; negative means
    /// unlimited.
    opens_before_failure: AtomicI64,
}

impl MockTransport {
    pub fn new(best_height: u64) -> (Arc<Self>, mpsc::UnboundedReceiver<OpenedStream>) {
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            best_height,
            opened_tx,
            opens_before_failure: AtomicI64::new(-1),
        });
        (transport, opened_rx)
    }

    /// Let `n` more opens succeed, then fail every open after that.
    pub fn fail_open_after(&self, n: i64) {
        self.opens_before_failure.store(n, Ordering::SeqCst);
    }

    fn open(&self, request: StreamRequest) -> Result<HeaderStream> {
        let remaining = self.opens_before_failure.load(Ordering::SeqCst);
        if remaining >= 0 {
            if remaining == 0 {
                return Err(Error::Transport("connect refused".into()));
            }
            self.opens_before_failure
                .store(remaining - 1, Ordering::SeqCst);
        }

        let (items_tx, items_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let _ = self.opened_tx.send(OpenedStream {
            request,
            items: items_tx,
            cancel: cancel.clone(),
        });
        Ok(HeaderStream::new(items_rx, cancel))
    }
}

#[async_trait]
impl HeaderTransport for MockTransport {
    async fn open_historical_stream(&self, from_height: u64, count: u64) -> Result<HeaderStream> {
        self.open(StreamRequest::Historical { from_height, count })
    }

    async fn open_continuous_stream(&self, from_height: u64) -> Result<HeaderStream> {
        self.open(StreamRequest::Continuous { from_height })
    }

    async fn best_block_height(&self) -> Result<u64> {
        Ok(self.best_height)
    }
}
