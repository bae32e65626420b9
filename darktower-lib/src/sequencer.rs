//! Single-flight command sequencer.
//!
//! The tower handles one command at a time. Commands are written strictly in
//! enqueue order and the next one is only written once the current one is
//! acknowledged (`on_response`), times out, or fails to send.
//!
//! A timeout resolves the command successfully: the tower does not answer
//! every frame type, and a stuck queue is worse than an unconfirmed command.

use crate::error::{Result, TowerError};
use futures_lite::FutureExt;
use futures_lite::future::Boxed;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, Span, debug, warn};

type SendFn<P> = Arc<dyn Fn(P) -> Boxed<Result<()>> + Send + Sync>;

/// How a command left the queue when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Acknowledged,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    pub pending: usize,
    pub in_flight: bool,
    /// Description of the in-flight command, if it has one
    pub current: Option<String>,
}

type Completion = oneshot::Sender<Result<CommandOutcome>>;

struct QueuedCommand<P> {
    id: u64,
    payload: P,
    enqueued_at: Instant,
    completion: Completion,
    description: Option<String>,
}

struct InFlight {
    id: u64,
    /// Set by the writer just before the frame goes out
    written: bool,
    completion: Completion,
    description: Option<String>,
    timer: Option<JoinHandle<()>>,
}

struct Inner<P> {
    queue: VecDeque<QueuedCommand<P>>,
    current: Option<InFlight>,
    next_id: u64,
}

struct Shared<P> {
    inner: Mutex<Inner<P>>,
    writer: mpsc::UnboundedSender<(u64, P)>,
    timeout: Duration,
    span: Span,
}

/// Resolves once the command is acknowledged, times out, fails to send, or
/// the queue is cleared.
#[derive(Debug)]
pub struct CommandCompletion {
    id: u64,
    rx: oneshot::Receiver<Result<CommandOutcome>>,
}

impl CommandCompletion {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for CommandCompletion {
    type Output = Result<CommandOutcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the sequencer itself is gone
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(TowerError::QueueCleared)))
    }
}

pub struct CommandSequencer<P> {
    shared: Arc<Shared<P>>,
}

impl<P> Clone for CommandSequencer<P> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<P: Send + 'static> CommandSequencer<P> {
    /// Create a sequencer that writes through `send`. Must be called from
    /// within a Tokio runtime.
    pub fn new<F, Fut>(timeout: Duration, parent: &Span, send: F) -> Self
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let send: SendFn<P> = Arc::new(move |payload| send(payload).boxed());
        let (writer, rx) = mpsc::unbounded_channel();
        let span = tracing::debug_span!(parent: parent, "sequencer");
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                current: None,
                next_id: 0,
            }),
            writer,
            timeout,
            span: span.clone(),
        });

        tokio::spawn(Self::write_loop(Arc::downgrade(&shared), rx, send).instrument(span));
        Self { shared }
    }

    async fn write_loop(shared: Weak<Shared<P>>, mut rx: mpsc::UnboundedReceiver<(u64, P)>, send: SendFn<P>) {
        while let Some((id, payload)) = rx.recv().await {
            let Some(seq) = shared.upgrade().map(|shared| CommandSequencer { shared }) else {
                break;
            };
            if !seq.mark_written(id) {
                debug!(id, "Skipping write for command that is no longer current");
                continue;
            }
            drop(seq);

            if let Err(e) = send(payload).await {
                if let Some(shared) = shared.upgrade() {
                    CommandSequencer { shared }.fail_current(id, e);
                }
            }
        }
    }

    pub fn enqueue(&self, payload: P, description: Option<&str>) -> CommandCompletion {
        let (tx, rx) = oneshot::channel();
        let (id, idle) = {
            let mut inner = self.shared.inner.lock();
            let id = inner.next_id;
            inner.next_id = inner.next_id.wrapping_add(1);
            inner.queue.push_back(QueuedCommand {
                id,
                payload,
                enqueued_at: Instant::now(),
                completion: tx,
                description: description.map(str::to_string),
            });
            (id, inner.current.is_none())
        };

        if idle {
            self.process_next();
        } else {
            let _guard = self.shared.span.enter();
            debug!(id, description, "Command queued behind in-flight command");
        }
        CommandCompletion { id, rx }
    }

    fn process_next(&self) {
        let _guard = self.shared.span.enter();
        let mut inner = self.shared.inner.lock();
        if inner.current.is_some() {
            return;
        }
        let Some(cmd) = inner.queue.pop_front() else {
            return;
        };

        let deadline = Instant::now() + self.shared.timeout;
        let weak = Arc::downgrade(&self.shared);
        let id = cmd.id;
        let timer = tokio::spawn(
            async move {
                tokio::time::sleep_until(deadline).await;
                if let Some(shared) = weak.upgrade() {
                    CommandSequencer { shared }.on_timeout(id);
                }
            }
            .in_current_span(),
        );

        debug!(
            id,
            description = cmd.description.as_deref(),
            waited_ms = cmd.enqueued_at.elapsed().as_millis() as u64,
            "Sending command"
        );
        inner.current = Some(InFlight {
            id,
            written: false,
            completion: cmd.completion,
            description: cmd.description,
            timer: Some(timer),
        });
        drop(inner);

        // The writer holds a weak reference and the receiver outlives every sender
        let _ = self.shared.writer.send((id, cmd.payload));
    }

    /// Flag the command as written if it is still current.
    fn mark_written(&self, id: u64) -> bool {
        let mut inner = self.shared.inner.lock();
        match inner.current.as_mut() {
            Some(current) if current.id == id => {
                current.written = true;
                true
            }
            _ => false,
        }
    }

    /// `None` takes the current command only once its frame has been written.
    fn take_current_if(&self, id: Option<u64>) -> Option<InFlight> {
        let mut inner = self.shared.inner.lock();
        match (&inner.current, id) {
            (Some(current), None) if current.written => inner.current.take(),
            (Some(current), Some(id)) if current.id == id => inner.current.take(),
            _ => None,
        }
    }

    /// Release the in-flight command after the tower answered. Returns false
    /// (and does nothing) when nothing is in flight or its frame has not been
    /// written yet.
    pub fn on_response(&self) -> bool {
        let Some(mut current) = self.take_current_if(None) else {
            return false;
        };
        if let Some(timer) = current.timer.take() {
            timer.abort();
        }
        let _ = current.completion.send(Ok(CommandOutcome::Acknowledged));
        self.process_next();
        true
    }

    fn on_timeout(&self, id: u64) {
        let Some(current) = self.take_current_if(Some(id)) else {
            return;
        };
        {
            let _guard = self.shared.span.enter();
            warn!(
                id,
                description = current.description.as_deref(),
                "Command timeout after {}ms, continuing with queue",
                self.shared.timeout.as_millis()
            );
        }
        let _ = current.completion.send(Ok(CommandOutcome::TimedOut));
        self.process_next();
    }

    fn fail_current(&self, id: u64, error: TowerError) {
        let Some(mut current) = self.take_current_if(Some(id)) else {
            return;
        };
        if let Some(timer) = current.timer.take() {
            timer.abort();
        }
        {
            let _guard = self.shared.span.enter();
            warn!(id, error = %error, "Command send failed");
        }
        let _ = current.completion.send(Err(error));
        self.process_next();
    }

    /// Fail every pending and in-flight command with `QueueCleared` and go idle.
    /// Returns how many commands were dropped.
    pub fn clear(&self) -> usize {
        let (current, queued) = {
            let mut inner = self.shared.inner.lock();
            (inner.current.take(), std::mem::take(&mut inner.queue))
        };

        let mut cleared = 0;
        if let Some(mut current) = current {
            if let Some(timer) = current.timer.take() {
                timer.abort();
            }
            let _ = current.completion.send(Err(TowerError::QueueCleared));
            cleared += 1;
        }
        for cmd in queued {
            let _ = cmd.completion.send(Err(TowerError::QueueCleared));
            cleared += 1;
        }

        if cleared > 0 {
            let _guard = self.shared.span.enter();
            debug!(cleared, "Command queue cleared");
        }
        cleared
    }

    pub fn status(&self) -> QueueStatus {
        let inner = self.shared.inner.lock();
        QueueStatus {
            pending: inner.queue.len(),
            in_flight: inner.current.is_some(),
            current: inner.current.as_ref().and_then(|c| c.description.clone()),
        }
    }

    pub fn is_idle(&self) -> bool {
        let inner = self.shared.inner.lock();
        inner.current.is_none() && inner.queue.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LinkError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recording_sequencer(timeout: Duration) -> (CommandSequencer<&'static str>, Arc<Mutex<Vec<&'static str>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let log = sent.clone();
        let seq = CommandSequencer::new(timeout, &Span::none(), move |payload| {
            let log = log.clone();
            async move {
                log.lock().push(payload);
                Ok(())
            }
        });
        (seq, sent)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completes_in_order_with_one_write_each() {
        let (seq, sent) = recording_sequencer(Duration::from_secs(30));
        let a = seq.enqueue("A", Some("first"));
        let b = seq.enqueue("B", None);
        let c = seq.enqueue("C", None);
        settle().await;

        assert_eq!(*sent.lock(), vec!["A"]);
        assert_eq!(seq.status().pending, 2);
        assert_eq!(seq.status().current.as_deref(), Some("first"));

        assert!(seq.on_response());
        assert_eq!(a.await, Ok(CommandOutcome::Acknowledged));
        settle().await;
        assert_eq!(*sent.lock(), vec!["A", "B"]);

        assert!(seq.on_response());
        assert_eq!(b.await, Ok(CommandOutcome::Acknowledged));
        settle().await;

        assert!(seq.on_response());
        assert_eq!(c.await, Ok(CommandOutcome::Acknowledged));
        settle().await;

        assert_eq!(*sent.lock(), vec!["A", "B", "C"]);
        assert!(seq.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn response_without_command_is_ignored() {
        let (seq, sent) = recording_sequencer(Duration::from_secs(30));
        assert!(!seq.on_response());
        let a = seq.enqueue("A", None);
        settle().await;
        assert!(seq.on_response());
        assert!(!seq.on_response());
        assert_eq!(a.await, Ok(CommandOutcome::Acknowledged));
        assert_eq!(sent.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn response_before_write_does_not_acknowledge() {
        let (seq, sent) = recording_sequencer(Duration::from_secs(30));
        let a = seq.enqueue("A", None);
        // the writer task has not run yet
        assert!(!seq.on_response());
        assert!(seq.status().in_flight);

        settle().await;
        assert_eq!(*sent.lock(), vec!["A"]);
        assert!(seq.on_response());
        assert_eq!(a.await, Ok(CommandOutcome::Acknowledged));
        assert_eq!(*sent.lock(), vec!["A"]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_resolves_at_exact_deadline() {
        let (seq, _sent) = recording_sequencer(Duration::from_millis(30_000));
        let start = Instant::now();
        let outcome = seq.enqueue("A", None).await;
        assert_eq!(outcome, Ok(CommandOutcome::TimedOut));
        assert_eq!(start.elapsed(), Duration::from_millis(30_000));
        assert!(seq.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_moves_on_to_next_command() {
        let (seq, sent) = recording_sequencer(Duration::from_secs(5));
        let a = seq.enqueue("A", None);
        let b = seq.enqueue("B", None);
        assert_eq!(a.await, Ok(CommandOutcome::TimedOut));
        settle().await;
        assert_eq!(*sent.lock(), vec!["A", "B"]);
        seq.on_response();
        assert_eq!(b.await, Ok(CommandOutcome::Acknowledged));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_fails_everything_outstanding() {
        let (seq, sent) = recording_sequencer(Duration::from_secs(30));
        let completions: Vec<_> = ["A", "B", "C", "D"].into_iter().map(|p| seq.enqueue(p, None)).collect();
        settle().await;

        assert_eq!(seq.clear(), 4);
        assert!(seq.is_idle());
        for completion in completions {
            assert_eq!(completion.await, Err(TowerError::QueueCleared));
        }
        settle().await;
        assert_eq!(*sent.lock(), vec!["A"]);

        // idle sequencer starts over cleanly
        let e = seq.enqueue("E", None);
        settle().await;
        seq.on_response();
        assert_eq!(e.await, Ok(CommandOutcome::Acknowledged));
    }

    #[tokio::test(start_paused = true)]
    async fn send_failure_fails_only_that_command() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let seq = CommandSequencer::new(Duration::from_secs(30), &Span::none(), move |payload: u8| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if payload == 1 {
                    Err(LinkError::WriteFailed("radio busy".into()).into())
                } else {
                    Ok(())
                }
            }
        });

        let first = seq.enqueue(1, None);
        let second = seq.enqueue(2, None);
        assert_eq!(
            first.await,
            Err(TowerError::Link(LinkError::WriteFailed("radio busy".into())))
        );
        settle().await;
        seq.on_response();
        assert_eq!(second.await, Ok(CommandOutcome::Acknowledged));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
