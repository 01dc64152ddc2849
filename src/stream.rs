//! Auto-reconnecting wrapper over one server stream.
//!
//! Transport streams can stall silently without surfacing an error. The
//! [`ReconnectingStream`] arms a watchdog timer on every connection attempt
//! and, when it fires, cancels the underlying stream and transparently
//! reopens it. Before each reopen the caller may rewrite the continuation
//! arguments through a hook, which is how a consumer resumes from the right
//! height instead of the original one.
//!
//! The hook runs on the consumer task, not the driver: the recycle point is
//! delivered through the same ordered event channel as the data, so by the
//! time the hook computes the continuation arguments the consumer has
//! processed every batch the old connection managed to deliver. The reopen
//! does not happen until the consumer answers.
//!
//! The wrapper distinguishes three ways a stream terminates:
//!
//! - its own watchdog-triggered cancellation, which reconnects silently;
//! - an external or server-side cancellation, forwarded as a clean
//!   [`StreamEvent::End`] rather than an error;
//! - any other error, forwarded as [`StreamEvent::Error`]. Network errors are
//!   not retried here; that is the reader's job.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::transport::{HeaderStream, RawBlockHeader, StreamArgs, StreamItem};
use crate::Result;

/// Opens one underlying stream for the given continuation point.
pub type StreamOpener =
    Box<dyn FnMut(StreamArgs) -> BoxFuture<'static, Result<HeaderStream>> + Send>;

/// Invoked on the consumer task right before a watchdog-triggered reopen;
/// may rewrite the continuation arguments in place. When absent, the
/// previous arguments are reused as-is.
pub type BeforeReconnectFn = Box<dyn FnMut(&mut StreamArgs) + Send + Sync>;

/// Event forwarded to the wrapper's consumer.
#[derive(Debug)]
pub enum StreamEvent {
    Headers(Vec<RawBlockHeader>),
    /// The logical stream ended cleanly: the server finished sending, or the
    /// stream was deliberately cancelled.
    End,
    Error(Error),
}

/// What the driver puts on the wire to the consumer. The recycle marker is
/// ordered behind every event the old connection produced.
#[derive(Debug)]
enum DriverMessage {
    Event(StreamEvent),
    ReconnectPoint,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectingStreamOptions {
    /// Idle window after which the underlying stream is recycled.
    pub reconnect_timeout: Duration,
}

impl Default for ReconnectingStreamOptions {
    fn default() -> Self {
        Self {
            reconnect_timeout: Duration::from_secs(30),
        }
    }
}

/// Why the current connection is being torn down. Makes the
/// cancellation-vs-reconnect branch a total function over states instead of a
/// boolean flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriverState {
    Connected,
    /// Our own watchdog cancelled the stream; the next cancellation-coded
    /// error triggers a reconnect instead of an end signal.
    ReconnectPending,
    /// An external `cancel()` is in flight; the stream ends cleanly.
    Cancelling,
}

/// One logical, indefinitely-lived header stream.
pub struct ReconnectingStream {
    messages: mpsc::Receiver<DriverMessage>,
    args: StreamArgs,
    before_reconnect: Option<BeforeReconnectFn>,
    resume_tx: mpsc::Sender<StreamArgs>,
    cancel: CancellationToken,
    destroy_tx: mpsc::Sender<Error>,
}

impl ReconnectingStream {
    /// Open the underlying stream and start the reconnect driver.
    ///
    /// The first open is awaited in place so that a failure to establish the
    /// initial connection surfaces synchronously; reopen failures after a
    /// watchdog reconnect are forwarded as [`StreamEvent::Error`].
    pub async fn connect(
        mut open: StreamOpener,
        args: StreamArgs,
        options: ReconnectingStreamOptions,
        before_reconnect: Option<BeforeReconnectFn>,
    ) -> Result<Self> {
        let inner = open(args.clone()).await?;

        let (messages_tx, messages_rx) = mpsc::channel(16);
        let (resume_tx, resume_rx) = mpsc::channel(1);
        let (destroy_tx, destroy_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        tokio::spawn(drive(
            inner,
            open,
            options.reconnect_timeout,
            messages_tx,
            resume_rx,
            cancel.clone(),
            destroy_rx,
        ));

        Ok(Self {
            messages: messages_rx,
            args,
            before_reconnect,
            resume_tx,
            cancel,
            destroy_tx,
        })
    }

    /// Wait for the next event on the logical stream.
    ///
    /// Recycle markers are handled here: every batch the old connection
    /// queued has already been returned from `next` by the time the hook
    /// computes the continuation arguments, so the resume point reflects
    /// fully settled accounting.
    pub async fn next(&mut self) -> StreamEvent {
        loop {
            match self.messages.recv().await {
                Some(DriverMessage::Event(event)) => return event,
                Some(DriverMessage::ReconnectPoint) => {
                    if let Some(hook) = self.before_reconnect.as_mut() {
                        hook(&mut self.args);
                    }
                    let _ = self.resume_tx.send(self.args.clone()).await;
                }
                None => return StreamEvent::End,
            }
        }
    }

    /// Deliberately cancel the stream; surfaces as [`StreamEvent::End`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Force-terminate the stream with an error payload; surfaces as
    /// [`StreamEvent::Error`] carrying `err`.
    pub async fn destroy(&self, err: Error) {
        let _ = self.destroy_tx.send(err).await;
    }
}

async fn drive(
    mut inner: HeaderStream,
    mut open: StreamOpener,
    reconnect_timeout: Duration,
    messages: mpsc::Sender<DriverMessage>,
    mut resume_rx: mpsc::Receiver<StreamArgs>,
    cancel: CancellationToken,
    mut destroy_rx: mpsc::Receiver<Error>,
) {
    // Outer loop: one iteration per connection. The watchdog is armed per
    // connection attempt, not per message.
    loop {
        let mut state = DriverState::Connected;
        let idle = tokio::time::sleep(reconnect_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                biased;
                Some(err) = destroy_rx.recv() => {
                    inner.cancel();
                    let _ = messages
                        .send(DriverMessage::Event(StreamEvent::Error(err)))
                        .await;
                    return;
                }
                _ = cancel.cancelled(), if state == DriverState::Connected => {
                    state = DriverState::Cancelling;
                    inner.cancel();
                }
                _ = &mut idle, if state == DriverState::Connected => {
                    state = DriverState::ReconnectPending;
                    inner.cancel();
                }
                item = inner.next() => match item {
                    StreamItem::Headers(headers) => {
                        let event = DriverMessage::Event(StreamEvent::Headers(headers));
                        if messages.send(event).await.is_err() {
                            // Consumer gone; tear the stream down.
                            inner.cancel();
                            return;
                        }
                    }
                    StreamItem::Finished => {
                        let _ = messages.send(DriverMessage::Event(StreamEvent::End)).await;
                        return;
                    }
                    StreamItem::Failed(err) if err.is_cancelled() => match state {
                        DriverState::ReconnectPending => break,
                        // An external or server-initiated cancel: the logical
                        // stream ends cleanly, not with an error.
                        DriverState::Connected | DriverState::Cancelling => {
                            let _ = messages.send(DriverMessage::Event(StreamEvent::End)).await;
                            return;
                        }
                    },
                    StreamItem::Failed(err) => {
                        let _ = messages
                            .send(DriverMessage::Event(StreamEvent::Error(err)))
                            .await;
                        return;
                    }
                },
            }
        }

        // A cancel that raced the watchdog wins: end cleanly instead of
        // reopening a stream nobody wants.
        if cancel.is_cancelled() {
            let _ = messages.send(DriverMessage::Event(StreamEvent::End)).await;
            return;
        }

        // Ask the consumer for the continuation point; it answers only after
        // draining everything queued ahead of the marker.
        if messages.send(DriverMessage::ReconnectPoint).await.is_err() {
            return;
        }
        let args = tokio::select! {
            biased;
            Some(err) = destroy_rx.recv() => {
                let _ = messages
                    .send(DriverMessage::Event(StreamEvent::Error(err)))
                    .await;
                return;
            }
            _ = cancel.cancelled() => {
                let _ = messages.send(DriverMessage::Event(StreamEvent::End)).await;
                return;
            }
            args = resume_rx.recv() => match args {
                Some(args) => args,
                None => return,
            },
        };

        tracing::debug!(
            "reconnecting header stream after idle timeout: from_height={}",
            args.from_height
        );
        match open(args).await {
            Ok(stream) => inner = stream,
            Err(err) => {
                let _ = messages
                    .send(DriverMessage::Event(StreamEvent::Error(err)))
                    .await;
                return;
            }
        }
    }
}
