//! Parallel historical header fetching and the continuous live tail.
//!
//! The reader turns a closed height range into N contiguous windows, each
//! fetched by its own retrying session over a [`ReconnectingStream`], and
//! separately maintains one unbounded live-tail session. Every batch is
//! reported through a typed event channel together with a rejection handle;
//! a rejected batch never advances the session's counters, so the forced
//! reconnect that follows re-requests exactly the unconsumed window.
//!
//! Ordering is per-session only: batches from different sessions interleave
//! arbitrarily, which is why every batch carries its own `head_height`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Error;
use crate::stream::{
    BeforeReconnectFn, ReconnectingStream, ReconnectingStreamOptions, StreamEvent, StreamOpener,
};
use crate::transport::{HeaderTransport, RawBlockHeader, StreamArgs};
use crate::Result;

/// A batch of consecutive block headers plus the chain height of the first
/// one. `head_height` is the sole ordering key between batches.
#[derive(Debug, Clone)]
pub struct HeaderBatch {
    pub headers: Vec<RawBlockHeader>,
    pub head_height: u64,
}

/// Lets the consumer refuse a batch that failed chain-state validation.
///
/// Dropping the handle without calling [`RejectHandle::reject`] counts as
/// acceptance; the emitting session waits for the verdict before advancing
/// its height bookkeeping.
#[derive(Debug)]
pub struct RejectHandle {
    tx: oneshot::Sender<Error>,
}

impl RejectHandle {
    fn new() -> (Self, oneshot::Receiver<Error>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    pub fn reject(self, err: Error) {
        let _ = self.tx.send(err);
    }
}

/// Events emitted by the reader.
#[derive(Debug)]
pub enum ReaderEvent {
    BlockHeaders {
        batch: HeaderBatch,
        reject: RejectHandle,
    },
    /// Fires exactly once per historical run, after every session has ended.
    HistoricalDataObtained,
    /// A fatal condition: retry exhaustion, a failed resubscription attempt,
    /// or a live-tail stream error.
    Error(Error),
}

#[derive(Debug, Clone)]
pub struct ReaderOptions {
    pub max_parallel_streams: u64,
    pub target_batch_size: u64,
    pub max_retries: u32,
    pub reconnect_timeout: Duration,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            max_parallel_streams: 5,
            target_batch_size: 500,
            max_retries: 10,
            reconnect_timeout: Duration::from_secs(30),
        }
    }
}

impl ReaderOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_parallel_streams: config.max_parallel_streams,
            target_batch_size: config.target_batch_size,
            max_retries: config.max_retries,
            reconnect_timeout: config.reconnect_timeout(),
        }
    }
}

/// One contiguous fetch window assigned to a historical session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Window {
    pub from_height: u64,
    pub count: u64,
}

/// Splits `[from_height, to_height]` into contiguous, non-overlapping
/// windows. The stream count rounds `total / target_batch_size` to the
/// nearest integer before clamping, and the per-stream size uses ceiling
/// division; the last window takes the remainder.
pub(crate) fn partition_range(
    from_height: u64,
    to_height: u64,
    target_batch_size: u64,
    max_parallel_streams: u64,
) -> Vec<Window> {
    let total = to_height - from_height + 1;
    let ideal = (total as f64 / target_batch_size as f64).round() as u64;
    let num_streams = ideal.clamp(1, max_parallel_streams);
    let batch_size = total.div_ceil(num_streams);
    // Ceiling-division can satisfy the range with fewer streams than the
    // rounded count; empty trailing windows are dropped.
    let num_streams = total.div_ceil(batch_size);

    (0..num_streams)
        .map(|i| Window {
            from_height: from_height + i * batch_size,
            count: if i + 1 == num_streams {
                total - batch_size * (num_streams - 1)
            } else {
                batch_size
            },
        })
        .collect()
}

struct HistoricalRun {
    generation: u64,
    cancel: CancellationToken,
    active_sessions: usize,
}

struct ContinuousRun {
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct ReaderState {
    generation: u64,
    historical: Option<HistoricalRun>,
    continuous: Option<ContinuousRun>,
}

struct ReaderInner<T> {
    transport: Arc<T>,
    options: ReaderOptions,
    events: mpsc::Sender<ReaderEvent>,
    state: Mutex<ReaderState>,
}

/// Orchestrates historical and live-tail header sessions over a transport.
pub struct BlockHeadersReader<T> {
    inner: Arc<ReaderInner<T>>,
}

impl<T> Clone for BlockHeadersReader<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: HeaderTransport> BlockHeadersReader<T> {
    pub fn new(transport: Arc<T>, options: ReaderOptions) -> (Self, mpsc::Receiver<ReaderEvent>) {
        let (events_tx, events_rx) = mpsc::channel(16);
        let reader = Self {
            inner: Arc::new(ReaderInner {
                transport,
                options,
                events: events_tx,
                state: Mutex::new(ReaderState::default()),
            }),
        };
        (reader, events_rx)
    }

    /// Fetch the closed range `[from_height, to_height]` over parallel
    /// retrying sessions. All initial streams are opened before this returns;
    /// an open failure cancels the already-opened siblings and surfaces here.
    pub async fn read_historical(&self, from_height: u64, to_height: u64) -> Result<()> {
        if from_height < 1 {
            return Err(Error::InvalidState(format!(
                "from_height must be >= 1, got {from_height}"
            )));
        }
        if to_height < from_height {
            return Err(Error::InvalidState(format!(
                "invalid header range: {from_height}..={to_height}"
            )));
        }

        let (windows, generation, run_cancel) = {
            let mut state = self.inner.state.lock().await;
            if state.historical.is_some() {
                return Err(Error::InvalidState(
                    "historical sync is already in progress".into(),
                ));
            }
            let windows = partition_range(
                from_height,
                to_height,
                self.inner.options.target_batch_size,
                self.inner.options.max_parallel_streams,
            );
            state.generation += 1;
            let cancel = CancellationToken::new();
            state.historical = Some(HistoricalRun {
                generation: state.generation,
                cancel: cancel.clone(),
                active_sessions: windows.len(),
            });
            (windows, state.generation, cancel)
        };

        tracing::info!(
            "reading historical headers {}..={} over {} streams",
            from_height,
            to_height,
            windows.len()
        );

        let mut attempts = Vec::with_capacity(windows.len());
        for window in &windows {
            match open_historical_attempt(&self.inner, *window).await {
                Ok(attempt) => attempts.push(attempt),
                Err(err) => {
                    for attempt in &attempts {
                        attempt.stream.cancel();
                    }
                    self.stop_reading_historical().await;
                    return Err(err);
                }
            }
        }

        for (window, attempt) in windows.into_iter().zip(attempts) {
            tokio::spawn(run_historical_session(
                self.inner.clone(),
                generation,
                run_cancel.clone(),
                window,
                attempt,
            ));
        }

        Ok(())
    }

    /// Cancel every active historical session and detach completion
    /// bookkeeping. Safe to call when no run is active.
    pub async fn stop_reading_historical(&self) {
        let mut state = self.inner.state.lock().await;
        if let Some(run) = state.historical.take() {
            tracing::debug!("stopping historical header sync");
            run.cancel.cancel();
        }
    }

    /// Subscribe to headers produced from `from_height` onwards.
    ///
    /// An idle reconnect re-requests from one height below the last delivered
    /// header, so the first batch after a reconnect overlaps the chain by one
    /// header; the chain-state validator is expected to absorb the duplicate.
    pub async fn subscribe_to_new(&self, from_height: u64) -> Result<()> {
        if from_height < 1 {
            return Err(Error::InvalidState(format!(
                "from_height must be >= 1, got {from_height}"
            )));
        }

        let (generation, cancel) = {
            let mut state = self.inner.state.lock().await;
            if state.continuous.is_some() {
                return Err(Error::InvalidState(
                    "continuous sync is already in progress".into(),
                ));
            }
            state.generation += 1;
            let cancel = CancellationToken::new();
            state.continuous = Some(ContinuousRun {
                generation: state.generation,
                cancel: cancel.clone(),
            });
            (state.generation, cancel)
        };

        let last_known_height = Arc::new(AtomicU64::new(from_height - 1));
        let hook: BeforeReconnectFn = {
            let last_known_height = last_known_height.clone();
            Box::new(move |args| {
                // Deliberate one-height rollback: re-request the last
                // delivered height so no header is lost to a race between the
                // watchdog and an in-flight batch.
                let height = last_known_height.load(Ordering::SeqCst);
                args.from_height = height;
                last_known_height.store(height.saturating_sub(1), Ordering::SeqCst);
            })
        };

        let stream = match ReconnectingStream::connect(
            continuous_opener(self.inner.transport.clone()),
            StreamArgs {
                from_height,
                count: None,
            },
            ReconnectingStreamOptions {
                reconnect_timeout: self.inner.options.reconnect_timeout,
            },
            Some(hook),
        )
        .await
        {
            Ok(stream) => stream,
            Err(err) => {
                let mut state = self.inner.state.lock().await;
                state.continuous.take_if(|run| run.generation == generation);
                return Err(err);
            }
        };

        tracing::info!("subscribed to new block headers from height {from_height}");
        tokio::spawn(run_continuous_session(
            self.inner.clone(),
            generation,
            cancel,
            stream,
            last_known_height,
        ));

        Ok(())
    }

    /// Cancel the live-tail session. Safe to call when none is active.
    pub async fn unsubscribe_from_new(&self) {
        let mut state = self.inner.state.lock().await;
        if let Some(run) = state.continuous.take() {
            tracing::debug!("unsubscribing from new block headers");
            run.cancel.cancel();
        }
    }
}

fn historical_opener<T: HeaderTransport>(transport: Arc<T>) -> StreamOpener {
    Box::new(move |args| {
        let transport = transport.clone();
        async move {
            let count = args.count.unwrap_or(0);
            transport
                .open_historical_stream(args.from_height, count)
                .await
        }
        .boxed()
    })
}

fn continuous_opener<T: HeaderTransport>(transport: Arc<T>) -> StreamOpener {
    Box::new(move |args| {
        let transport = transport.clone();
        async move { transport.open_continuous_stream(args.from_height).await }.boxed()
    })
}

/// One (re)connect attempt of a historical session. `headers_obtained` is
/// shared with the stream's reconnect hook so a watchdog reconnect resumes
/// from the unconsumed height instead of the window start.
struct HistoricalAttempt {
    stream: ReconnectingStream,
    headers_obtained: Arc<AtomicU64>,
}

async fn open_historical_attempt<T: HeaderTransport>(
    inner: &ReaderInner<T>,
    window: Window,
) -> Result<HistoricalAttempt> {
    let headers_obtained = Arc::new(AtomicU64::new(0));
    let hook: BeforeReconnectFn = {
        let headers_obtained = headers_obtained.clone();
        Box::new(move |args| {
            let obtained = headers_obtained.load(Ordering::SeqCst);
            args.from_height = window.from_height + obtained;
            args.count = Some(window.count.saturating_sub(obtained));
        })
    };

    let stream = ReconnectingStream::connect(
        historical_opener(inner.transport.clone()),
        StreamArgs {
            from_height: window.from_height,
            count: Some(window.count),
        },
        ReconnectingStreamOptions {
            reconnect_timeout: inner.options.reconnect_timeout,
        },
        Some(hook),
    )
    .await?;

    Ok(HistoricalAttempt {
        stream,
        headers_obtained,
    })
}

/// Consumer's verdict on one emitted batch.
enum Verdict {
    Accepted,
    Rejected(Error),
    ConsumerGone,
}

async fn deliver_batch<T>(
    inner: &ReaderInner<T>,
    headers: Vec<RawBlockHeader>,
    head_height: u64,
) -> Verdict {
    let (reject, verdict_rx) = RejectHandle::new();
    let event = ReaderEvent::BlockHeaders {
        batch: HeaderBatch {
            headers,
            head_height,
        },
        reject,
    };
    if inner.events.send(event).await.is_err() {
        return Verdict::ConsumerGone;
    }
    match verdict_rx.await {
        Ok(err) => Verdict::Rejected(err),
        Err(_) => Verdict::Accepted,
    }
}

enum AttemptOutcome {
    /// The stream ended cleanly: server finished, or a deliberate cancel.
    Ended,
    /// The whole run was cancelled from outside; cleanup happened there.
    Stopped,
    /// A recoverable failure; resume from the unconsumed height.
    Retry(Error),
}

async fn drive_attempt<T>(
    inner: &ReaderInner<T>,
    run_cancel: &CancellationToken,
    from_height: u64,
    attempt: &mut HistoricalAttempt,
) -> AttemptOutcome {
    loop {
        let event = tokio::select! {
            biased;
            _ = run_cancel.cancelled() => {
                attempt.stream.cancel();
                return AttemptOutcome::Stopped;
            }
            event = attempt.stream.next() => event,
        };

        match event {
            StreamEvent::Headers(headers) => {
                let obtained = attempt.headers_obtained.load(Ordering::SeqCst);
                let head_height = from_height + obtained;
                let len = headers.len() as u64;
                match deliver_batch(inner, headers, head_height).await {
                    Verdict::Accepted => {
                        attempt
                            .headers_obtained
                            .store(obtained + len, Ordering::SeqCst);
                    }
                    Verdict::Rejected(err) => {
                        // The rejected batch was not counted; cancelling here
                        // forces a reconnect that re-requests the same window.
                        attempt.stream.cancel();
                        return AttemptOutcome::Retry(err);
                    }
                    Verdict::ConsumerGone => {
                        attempt.stream.cancel();
                        return AttemptOutcome::Stopped;
                    }
                }
            }
            StreamEvent::End => return AttemptOutcome::Ended,
            StreamEvent::Error(err) => return AttemptOutcome::Retry(err),
        }
    }
}

async fn run_historical_session<T: HeaderTransport>(
    inner: Arc<ReaderInner<T>>,
    generation: u64,
    run_cancel: CancellationToken,
    window: Window,
    first_attempt: HistoricalAttempt,
) {
    let mut from_height = window.from_height;
    let mut count = window.count;
    let mut retries_used = 0u32;
    let mut attempt = first_attempt;

    loop {
        match drive_attempt(&inner, &run_cancel, from_height, &mut attempt).await {
            AttemptOutcome::Ended => {
                session_ended(&inner, generation).await;
                return;
            }
            AttemptOutcome::Stopped => return,
            AttemptOutcome::Retry(err) => {
                if retries_used >= inner.options.max_retries {
                    abort_run(&inner, generation, err).await;
                    return;
                }
                retries_used += 1;

                let obtained = attempt.headers_obtained.load(Ordering::SeqCst);
                from_height += obtained;
                count = count.saturating_sub(obtained);
                tracing::debug!(
                    "resubscribing historical stream: from_height={} count={} retry={}: {}",
                    from_height,
                    count,
                    retries_used,
                    err
                );

                let window = Window { from_height, count };
                match open_historical_attempt(&inner, window).await {
                    Ok(next) => attempt = next,
                    Err(open_err) => {
                        abort_run(&inner, generation, open_err).await;
                        return;
                    }
                }
            }
        }
    }
}

/// Decrements the run's session count; the last session to end emits the
/// completion signal. The generation guard keeps a late exit from a stopped
/// run away from a newer run's bookkeeping.
async fn session_ended<T>(inner: &ReaderInner<T>, generation: u64) {
    let completed = {
        let mut state = inner.state.lock().await;
        match state.historical.as_mut() {
            Some(run) if run.generation == generation => {
                run.active_sessions -= 1;
                if run.active_sessions == 0 {
                    state.historical = None;
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    };
    if completed {
        tracing::info!("historical header sync complete");
        let _ = inner.events.send(ReaderEvent::HistoricalDataObtained).await;
    }
}

/// Fatal for the whole run: cancel every sibling session and surface exactly
/// one error event.
async fn abort_run<T>(inner: &ReaderInner<T>, generation: u64, err: Error) {
    let aborted = {
        let mut state = inner.state.lock().await;
        if let Some(run) = state
            .historical
            .take_if(|run| run.generation == generation)
        {
            run.cancel.cancel();
            true
        } else {
            false
        }
    };
    if aborted {
        tracing::warn!("historical header sync aborted: {err}");
        let _ = inner.events.send(ReaderEvent::Error(err)).await;
    }
}

async fn clear_continuous<T>(inner: &ReaderInner<T>, generation: u64) {
    let mut state = inner.state.lock().await;
    state.continuous.take_if(|run| run.generation == generation);
}

async fn run_continuous_session<T: HeaderTransport>(
    inner: Arc<ReaderInner<T>>,
    generation: u64,
    cancel: CancellationToken,
    mut stream: ReconnectingStream,
    last_known_height: Arc<AtomicU64>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                stream.cancel();
                return;
            }
            event = stream.next() => event,
        };

        match event {
            StreamEvent::Headers(headers) => {
                let head_height = last_known_height.load(Ordering::SeqCst) + 1;
                let len = headers.len() as u64;
                match deliver_batch(&inner, headers, head_height).await {
                    Verdict::Accepted => {
                        last_known_height.store(head_height + len - 1, Ordering::SeqCst);
                    }
                    Verdict::Rejected(err) => {
                        // Surfaces through the stream's own error path so the
                        // cancellation-vs-error distinction stays in one place.
                        stream.destroy(err).await;
                    }
                    Verdict::ConsumerGone => {
                        stream.cancel();
                        clear_continuous(&inner, generation).await;
                        return;
                    }
                }
            }
            StreamEvent::End => {
                clear_continuous(&inner, generation).await;
                return;
            }
            StreamEvent::Error(err) => {
                clear_continuous(&inner, generation).await;
                if !err.is_cancelled() {
                    tracing::warn!("continuous header sync failed: {err}");
                    let _ = inner.events.send(ReaderEvent::Error(err)).await;
                }
                return;
            }
        }
    }
}
