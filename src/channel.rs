//! Request channel between callers and the device session.
//!
//! Any number of [`RequestSender`] clones enqueue [`Request`]s into one bounded
//! FIFO; the device session is the only consumer. Every request carries a
//! single-use [`ResultSlot`] that the session fulfils exactly once.
//!
//! A caller that gives up (its deadline passes) simply drops the receiving half
//! of its slot. The session sees that, skips the request, and fulfilling an
//! abandoned slot is a silent no-op.

use crate::config::{QueueFullPolicy, SessionSettings};
use crate::error::{PsuError, PsuResult};
use crate::protocol::{Command, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::time::{self, Instant};
use tracing::trace;

/// Slack added to the default caller deadline on top of the exchange budget.
const DEADLINE_MARGIN: Duration = Duration::from_millis(100);

/// Single-fulfilment result slot.
#[derive(Debug)]
pub struct ResultSlot(oneshot::Sender<PsuResult<Value>>);

impl ResultSlot {
    /// Slot plus the receiver the caller waits on.
    pub fn pair() -> (Self, oneshot::Receiver<PsuResult<Value>>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    /// Deliver the result. Returns false if the caller already gave up.
    pub fn fulfill(self, result: PsuResult<Value>) -> bool {
        self.0.send(result).is_ok()
    }

    /// True once the caller dropped its receiver.
    pub fn is_abandoned(&self) -> bool {
        self.0.is_closed()
    }
}

/// One logical request in flight between a caller and the session.
#[derive(Debug)]
pub struct Request {
    /// Monotonic id, for logs
    pub id: u64,
    /// What to send
    pub command: Command,
    /// Read deadline for each exchange attempt
    pub timeout: Duration,
    slot: ResultSlot,
}

impl Request {
    /// Build a request around an existing slot.
    pub fn new(id: u64, command: Command, timeout: Duration, slot: ResultSlot) -> Self {
        Self {
            id,
            command,
            timeout,
            slot,
        }
    }

    /// True once the caller stopped waiting.
    pub fn is_abandoned(&self) -> bool {
        self.slot.is_abandoned()
    }

    /// Complete the request.
    pub fn fulfill(self, result: PsuResult<Value>) {
        let id = self.id;
        if !self.slot.fulfill(result) {
            trace!(id, "Result discarded, caller gone");
        }
    }

    /// Complete the request with an error.
    pub fn fail(self, error: PsuError) {
        self.fulfill(Err(error));
    }
}

/// Consumer half, owned by the device session.
pub type RequestReceiver = mpsc::Receiver<Request>;

/// Create a request channel sized and timed per `settings`.
pub fn request_channel(settings: &SessionSettings) -> (RequestSender, RequestReceiver) {
    let (tx, rx) = mpsc::channel(settings.queue_depth.max(1));
    let sender = RequestSender {
        tx,
        next_id: Arc::new(AtomicU64::new(1)),
        policy: settings.queue_full_policy,
        write_timeout: settings.write_timeout,
        query_timeout: settings.query_timeout,
        attempt_overhead: settings.command_delay,
        max_attempts: settings.max_attempts.max(1),
    };
    (sender, rx)
}

/// Producer half. Clone freely, one per caller task if convenient.
#[derive(Debug, Clone)]
pub struct RequestSender {
    tx: mpsc::Sender<Request>,
    next_id: Arc<AtomicU64>,
    policy: QueueFullPolicy,
    write_timeout: Duration,
    query_timeout: Duration,
    attempt_overhead: Duration,
    max_attempts: u32,
}

impl RequestSender {
    /// Default per-attempt read deadline for `command`.
    pub fn default_timeout(&self, command: &Command) -> Duration {
        if command.is_write() {
            self.write_timeout
        } else {
            self.query_timeout
        }
    }

    /// Default caller deadline: long enough for every retry of one exchange.
    pub fn default_deadline(&self, timeout: Duration) -> Instant {
        let per_attempt = timeout + self.attempt_overhead;
        Instant::now() + per_attempt * self.max_attempts + DEADLINE_MARGIN
    }

    /// Submit with default timeout and deadline, and wait for the result.
    pub async fn submit(&self, command: Command) -> PsuResult<Value> {
        let timeout = self.default_timeout(&command);
        let deadline = self.default_deadline(timeout);
        self.submit_with(command, timeout, deadline).await
    }

    /// Submit with an explicit per-attempt `timeout`, giving up at `deadline`.
    ///
    /// Returns `Timeout { attempts: 0 }` if the deadline passes while queued or
    /// waiting, `QueueFull` under the reject policy, `NotConnected` if the
    /// session is gone.
    pub async fn submit_with(
        &self,
        command: Command,
        timeout: Duration,
        deadline: Instant,
    ) -> PsuResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (slot, result) = ResultSlot::pair();
        let request = Request::new(id, command, timeout, slot);

        match self.policy {
            QueueFullPolicy::Block => match time::timeout_at(deadline, self.tx.send(request)).await {
                Err(_) => return Err(PsuError::Timeout { attempts: 0 }),
                Ok(Err(_)) => return Err(PsuError::NotConnected),
                Ok(Ok(())) => {}
            },
            QueueFullPolicy::Reject => match self.tx.try_send(request) {
                Err(TrySendError::Full(_)) => return Err(PsuError::QueueFull),
                Err(TrySendError::Closed(_)) => return Err(PsuError::NotConnected),
                Ok(()) => {}
            },
        }
        trace!(id, "Request queued");

        match time::timeout_at(deadline, result).await {
            Err(_) => Err(PsuError::Timeout { attempts: 0 }),
            // Slot dropped without an answer: the session went away.
            Ok(Err(_)) => Err(PsuError::NotConnected),
            Ok(Ok(result)) => result,
        }
    }

    /// True once the session stopped consuming.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
