//! The header sync facade: tip discovery, historical catch-up, live tail.
//!
//! The provider owns a [`BlockHeadersReader`], feeds every delivered batch to
//! the chain-state validator, and republishes the results as
//! [`ProviderEvent`]s. Validation failures are translated into batch
//! rejections so the reader re-fetches the offending window; everything else
//! from the validator is fatal.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Error;
use crate::reader::{BlockHeadersReader, ReaderEvent, ReaderOptions};
use crate::transport::{HeaderTransport, RawBlockHeader};
use crate::Result;

/// Chain-state validation seam.
///
/// `add_headers` must be idempotent for already-known headers: the live tail
/// deliberately re-delivers one overlapping header after a reconnect, and a
/// duplicate must come back as `Ok` with the known headers filtered out of
/// the returned set, not as an error.
pub trait SpvChain: Send + Sync + 'static {
    /// Validate and append raw headers. Returns the subset that was actually
    /// new; [`Error::InvalidHeaders`] marks a batch that fails validation.
    fn add_headers(&self, headers: Vec<RawBlockHeader>) -> Result<Vec<RawBlockHeader>>;
}

/// Events published by the provider.
#[derive(Debug)]
pub enum ProviderEvent {
    /// The validator accepted at least one new header.
    ChainUpdated {
        headers: Vec<RawBlockHeader>,
        head_height: u64,
    },
    /// Historical catch-up finished; the live tail starts right after.
    HistoricalDataObtained,
    Error(Error),
    Stopped,
}

/// Drives header synchronization end to end.
pub struct BlockHeadersProvider<T, C> {
    config: Config,
    chain: Arc<C>,
    transport: Option<Arc<T>>,
    injected_reader: Option<(BlockHeadersReader<T>, mpsc::Receiver<ReaderEvent>)>,
    active_reader: Option<BlockHeadersReader<T>>,
    loop_cancel: CancellationToken,
    events: mpsc::Sender<ProviderEvent>,
    started: bool,
}

impl<T: HeaderTransport, C: SpvChain> BlockHeadersProvider<T, C> {
    pub fn new(config: Config, chain: Arc<C>) -> Result<(Self, mpsc::Receiver<ProviderEvent>)> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::channel(16);
        let provider = Self {
            config,
            chain,
            transport: None,
            injected_reader: None,
            active_reader: None,
            loop_cancel: CancellationToken::new(),
            events: events_tx,
            started: false,
        };
        Ok((provider, events_rx))
    }

    pub fn set_transport(&mut self, transport: Arc<T>) {
        self.transport = Some(transport);
    }

    /// Replace the internally constructed reader, mostly for tests that want
    /// to observe or script reader events directly.
    pub fn set_reader(
        &mut self,
        reader: BlockHeadersReader<T>,
        events: mpsc::Receiver<ReaderEvent>,
    ) {
        self.injected_reader = Some((reader, events));
    }

    /// Discover the chain tip, start historical catch-up below it, and hand
    /// the reader's event stream to the background loop.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::InvalidState("provider is already started".into()));
        }
        let transport = self
            .transport
            .clone()
            .ok_or_else(|| Error::InvalidState("no transport configured".into()))?;

        let best_height = transport.best_block_height().await?;
        tracing::info!("starting header sync: best block height {best_height}");

        let (reader, reader_events) = match self.injected_reader.take() {
            Some(pair) => pair,
            None => BlockHeadersReader::new(transport, ReaderOptions::from_config(&self.config)),
        };

        // The historical pass covers everything strictly below the tip; when
        // the configured start is at or above it there is nothing to catch
        // up on.
        let historical_to = best_height.saturating_sub(1);
        if self.config.from_block_height <= historical_to {
            reader
                .read_historical(self.config.from_block_height, historical_to)
                .await?;
        } else {
            tracing::info!("no historical headers below the tip, starting live tail");
            let _ = self.events.send(ProviderEvent::HistoricalDataObtained).await;
            reader.subscribe_to_new(best_height.max(1)).await?;
        }

        self.loop_cancel = CancellationToken::new();
        tokio::spawn(run_event_loop(
            reader.clone(),
            reader_events,
            self.chain.clone(),
            self.events.clone(),
            best_height,
            self.loop_cancel.clone(),
        ));

        self.active_reader = Some(reader);
        self.started = true;
        Ok(())
    }

    /// Stop every session and the event loop. Idempotent.
    pub async fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.loop_cancel.cancel();
        if let Some(reader) = self.active_reader.take() {
            reader.stop_reading_historical().await;
            reader.unsubscribe_from_new().await;
        }
        self.started = false;
        tracing::info!("header sync stopped");
        let _ = self.events.send(ProviderEvent::Stopped).await;
    }
}

async fn run_event_loop<T: HeaderTransport, C: SpvChain>(
    reader: BlockHeadersReader<T>,
    mut reader_events: mpsc::Receiver<ReaderEvent>,
    chain: Arc<C>,
    events: mpsc::Sender<ProviderEvent>,
    best_height: u64,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            event = reader_events.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };

        match event {
            ReaderEvent::BlockHeaders { batch, reject } => {
                match chain.add_headers(batch.headers) {
                    Ok(new_headers) => {
                        drop(reject);
                        if !new_headers.is_empty() {
                            let event = ProviderEvent::ChainUpdated {
                                headers: new_headers,
                                head_height: batch.head_height,
                            };
                            if events.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(err @ Error::InvalidHeaders(_)) => {
                        tracing::debug!(
                            "rejecting batch at height {}: {err}",
                            batch.head_height
                        );
                        reject.reject(err);
                    }
                    Err(err) => {
                        drop(reject);
                        tracing::error!("chain state fault: {err}");
                        let _ = events.send(ProviderEvent::Error(err)).await;
                    }
                }
            }
            ReaderEvent::HistoricalDataObtained => {
                if events
                    .send(ProviderEvent::HistoricalDataObtained)
                    .await
                    .is_err()
                {
                    return;
                }
                // The historical pass stopped one below the tip; the live
                // tail picks up at the tip itself.
                if let Err(err) = reader.subscribe_to_new(best_height).await {
                    let _ = events.send(ProviderEvent::Error(err)).await;
                }
            }
            ReaderEvent::Error(err) => {
                let _ = events.send(ProviderEvent::Error(err)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{raw_headers, MockTransport, StreamRequest};
    use crate::transport::StreamItem;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;

    const TICK: Duration = Duration::from_millis(100);

    /// What the scripted chain does with the next batch it receives.
    enum ChainReply {
        Accept,
        AcceptNone,
        Invalid,
        Fault,
    }

    struct TestChain {
        replies: Mutex<VecDeque<ChainReply>>,
    }

    impl TestChain {
        fn new(replies: Vec<ChainReply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
            })
        }

        fn accepting() -> Arc<Self> {
            Self::new(vec![])
        }
    }

    impl SpvChain for TestChain {
        fn add_headers(&self, headers: Vec<RawBlockHeader>) -> Result<Vec<RawBlockHeader>> {
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ChainReply::Accept);
            match reply {
                ChainReply::Accept => Ok(headers),
                ChainReply::AcceptNone => Ok(vec![]),
                ChainReply::Invalid => {
                    Err(Error::InvalidHeaders("does not connect to chain tip".into()))
                }
                ChainReply::Fault => Err(Error::Other(anyhow::anyhow!("storage unavailable"))),
            }
        }
    }

    fn config(from_block_height: u64) -> Config {
        Config::builder()
            .from_block_height(from_block_height)
            .target_batch_size(50)
            .max_parallel_streams(2)
            .build()
            .unwrap()
    }

    async fn started_provider(
        best_height: u64,
        chain: Arc<TestChain>,
    ) -> (
        BlockHeadersProvider<MockTransport, TestChain>,
        mpsc::Receiver<ProviderEvent>,
        mpsc::UnboundedReceiver<crate::test_utils::OpenedStream>,
    ) {
        let (transport, opened) = MockTransport::new(best_height);
        let (mut provider, events) = BlockHeadersProvider::new(config(1), chain).unwrap();
        provider.set_transport(transport);
        provider.start().await.unwrap();
        (provider, events, opened)
    }

    #[tokio::test]
    async fn start_requires_a_transport() {
        let (mut provider, _events) =
            BlockHeadersProvider::<MockTransport, _>::new(config(1), TestChain::accepting())
                .unwrap();
        assert!(matches!(provider.start().await, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let (mut provider, _events, _opened) =
            started_provider(51, TestChain::accepting()).await;
        assert!(matches!(provider.start().await, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn historical_range_ends_one_below_the_tip() {
        let (_provider, _events, mut opened) =
            started_provider(51, TestChain::accepting()).await;
        let stream = opened.recv().await.unwrap();
        assert_eq!(
            stream.request,
            StreamRequest::Historical { from_height: 1, count: 50 }
        );
    }

    #[tokio::test]
    async fn accepted_headers_are_published_as_chain_updates() {
        let (_provider, mut events, mut opened) =
            started_provider(51, TestChain::accepting()).await;
        let stream = opened.recv().await.unwrap();

        stream
            .items
            .send(StreamItem::Headers(raw_headers(10)))
            .await
            .unwrap();
        match timeout(TICK, events.recv()).await.unwrap().unwrap() {
            ProviderEvent::ChainUpdated { headers, head_height } => {
                assert_eq!(headers.len(), 10);
                assert_eq!(head_height, 1);
            }
            other => panic!("expected a chain update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fully_duplicate_batches_are_silent() {
        let chain = TestChain::new(vec![ChainReply::AcceptNone, ChainReply::Accept]);
        let (_provider, mut events, mut opened) = started_provider(51, chain).await;
        let stream = opened.recv().await.unwrap();

        stream
            .items
            .send(StreamItem::Headers(raw_headers(3)))
            .await
            .unwrap();
        stream
            .items
            .send(StreamItem::Headers(raw_headers(2)))
            .await
            .unwrap();

        // Only the second batch produced new headers.
        match timeout(TICK, events.recv()).await.unwrap().unwrap() {
            ProviderEvent::ChainUpdated { headers, head_height } => {
                assert_eq!(headers.len(), 2);
                assert_eq!(head_height, 4);
            }
            other => panic!("expected a chain update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn validation_failure_rejects_and_replays_the_batch() {
        let chain = TestChain::new(vec![ChainReply::Invalid, ChainReply::Accept]);
        let (_provider, mut events, mut opened) = started_provider(51, chain).await;
        let stream = opened.recv().await.unwrap();

        stream
            .items
            .send(StreamItem::Headers(raw_headers(10)))
            .await
            .unwrap();

        // The rejection forces a re-fetch of the same window; the replayed
        // batch passes the second time.
        let replacement = timeout(TICK, opened.recv()).await.unwrap().unwrap();
        assert_eq!(
            replacement.request,
            StreamRequest::Historical { from_height: 1, count: 50 }
        );
        replacement
            .items
            .send(StreamItem::Headers(raw_headers(10)))
            .await
            .unwrap();

        match timeout(TICK, events.recv()).await.unwrap().unwrap() {
            ProviderEvent::ChainUpdated { head_height, .. } => assert_eq!(head_height, 1),
            other => panic!("expected a chain update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn chain_fault_is_published_as_an_error() {
        let chain = TestChain::new(vec![ChainReply::Fault]);
        let (_provider, mut events, mut opened) = started_provider(51, chain).await;
        let stream = opened.recv().await.unwrap();

        stream
            .items
            .send(StreamItem::Headers(raw_headers(10)))
            .await
            .unwrap();
        assert!(matches!(
            timeout(TICK, events.recv()).await.unwrap().unwrap(),
            ProviderEvent::Error(Error::Other(_))
        ));
    }

    #[tokio::test]
    async fn live_tail_starts_at_the_tip_after_historical_completion() {
        let (_provider, mut events, mut opened) =
            started_provider(51, TestChain::accepting()).await;
        let historical = opened.recv().await.unwrap();

        historical.items.send(StreamItem::Finished).await.unwrap();
        assert!(matches!(
            timeout(TICK, events.recv()).await.unwrap().unwrap(),
            ProviderEvent::HistoricalDataObtained
        ));

        let tail = timeout(TICK, opened.recv()).await.unwrap().unwrap();
        assert_eq!(tail.request, StreamRequest::Continuous { from_height: 51 });

        tail.items
            .send(StreamItem::Headers(raw_headers(2)))
            .await
            .unwrap();
        match timeout(TICK, events.recv()).await.unwrap().unwrap() {
            ProviderEvent::ChainUpdated { head_height, .. } => assert_eq!(head_height, 51),
            other => panic!("expected a chain update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tip_at_the_start_height_skips_straight_to_the_live_tail() {
        let (mut provider, mut events, mut opened) =
            started_provider(1, TestChain::accepting()).await;

        assert!(matches!(
            timeout(TICK, events.recv()).await.unwrap().unwrap(),
            ProviderEvent::HistoricalDataObtained
        ));
        let tail = timeout(TICK, opened.recv()).await.unwrap().unwrap();
        assert_eq!(tail.request, StreamRequest::Continuous { from_height: 1 });

        provider.stop().await;
    }

    #[tokio::test]
    async fn stop_cancels_sessions_and_emits_stopped() {
        let (mut provider, mut events, mut opened) =
            started_provider(51, TestChain::accepting()).await;
        let stream = opened.recv().await.unwrap();

        provider.stop().await;
        timeout(TICK, stream.cancel.cancelled()).await.unwrap();
        assert!(matches!(
            timeout(TICK, events.recv()).await.unwrap().unwrap(),
            ProviderEvent::Stopped
        ));

        // A second stop is a no-op.
        provider.stop().await;
        assert!(timeout(TICK, events.recv()).await.is_err());
    }
}
