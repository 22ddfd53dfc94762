//! Device session: connection state machine and single-flight request servicing.
//!
//! One task owns the [`Transport`] and the consumer side of the request channel.
//! It is the only reader and writer of the link, so exchanges never overlap and
//! are serviced strictly in submission order.
//!
//! ```text
//!  Disconnected ──► Connecting ──ok──► Ready ──I/O error / retries exhausted──┐
//!                      ▲   │                                                  │
//!                      │   └──open or handshake failed──► Faulted ◄───────────┘
//!                      └──────────── backoff elapsed ─────────┘
//!  any state ──shutdown──► Disconnected
//! ```
//!
//! While Faulted, and while reconnecting after a fault, queued requests are
//! failed at once with [`PsuError::NotConnected`]. Only during the first
//! connect do they wait in the queue.
//!
//! A supervisor awaits the session task. If the task dies instead of stopping,
//! the supervisor logs it and publishes [`SessionState::Disconnected`].

use crate::channel::{request_channel, RequestReceiver, RequestSender};
use crate::config::SessionSettings;
use crate::error::{DecodeError, PsuError, PsuResult, TransportError};
use crate::error_recovery::{ReconnectBackoff, RetryPolicy};
use crate::protocol::{Codec, Command, Value};
use crate::transport::{SrqEvent, Transport};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, debug_span, error, info, info_span, trace, warn, Instrument};

/// Connection state of a [`DeviceSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not running (before start, after shutdown)
    Disconnected,
    /// Opening the link and addressing the unit
    Connecting,
    /// Serving requests
    Ready,
    /// Link lost; waiting out the reconnect backoff
    Faulted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Why one exchange (with its retries) did not produce a value.
#[derive(Debug, thiserror::Error)]
enum Failure {
    /// Coherent error token; the line is fine.
    #[error("device answered {0}")]
    Device(String),
    /// Every attempt timed out or was undecodable.
    #[error(transparent)]
    Exhausted(PsuError),
    /// The link itself failed.
    #[error(transparent)]
    Link(#[from] TransportError),
}

enum Exit {
    Shutdown,
    Faulted,
    Reconnect,
}

/// The transport and the exchange discipline applied to it.
struct Link {
    transport: Box<dyn Transport>,
    codec: Codec,
    command_delay: Duration,
    retry: RetryPolicy,
}

impl Link {
    /// Open the transport and address the unit.
    async fn connect(&mut self, address: u8, timeout: Duration) -> Result<(), Failure> {
        self.transport.open().await?;
        self.execute(&Command::SelectAddress(address), timeout).await?;
        info!("Device addressed");
        Ok(())
    }

    /// One logical exchange, retried per policy.
    async fn execute(&mut self, command: &Command, timeout: Duration) -> Result<Value, Failure> {
        let frame = self.codec.encode(command);
        let terminator = self.codec.terminator();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if attempts > 1 {
                self.transport.discard_input().await?;
            }
            time::sleep(self.command_delay).await;
            self.transport.write_frame(&frame).await?;

            let deadline = Instant::now() + timeout;
            let failure = match self.transport.read_until(terminator, deadline).await {
                Ok(payload) => match self.codec.decode(command, &payload) {
                    Ok(value) => {
                        trace!(attempts, %value, "Exchange complete");
                        return Ok(value);
                    }
                    Err(DecodeError::DeviceRejected(code)) => return Err(Failure::Device(code)),
                    Err(source) => PsuError::Decode { attempts, source },
                },
                Err(TransportError::Timeout) => PsuError::Timeout { attempts },
                Err(e) => return Err(Failure::Link(e)),
            };

            if !self.retry.should_retry(attempts) {
                return Err(Failure::Exhausted(failure));
            }
            warn!(attempt = attempts, error = %failure, "Exchange failed, retrying");
        }
    }
}

/// The task that owns one device connection.
pub struct DeviceSession {
    link: Link,
    requests: RequestReceiver,
    device_address: u8,
    handshake_timeout: Duration,
    backoff: ReconnectBackoff,
    state: Arc<watch::Sender<SessionState>>,
}

impl DeviceSession {
    /// Start a session over `transport`, addressing the unit at `device_address`.
    ///
    /// The session connects immediately and keeps reconnecting until shut down.
    pub fn spawn(
        mut transport: Box<dyn Transport>,
        codec: Codec,
        device_address: u8,
        settings: &SessionSettings,
    ) -> SessionHandle {
        let (sender, requests) = request_channel(settings);
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let state_tx = Arc::new(state_tx);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (srq_tx, _) = broadcast::channel(16);
        transport.set_srq_sink(srq_tx.clone());

        let span = info_span!("session", link = %transport.describe(), address = device_address);
        let session = Self {
            link: Link {
                transport,
                codec,
                command_delay: settings.command_delay,
                retry: RetryPolicy::from(settings),
            },
            requests,
            device_address,
            handshake_timeout: settings.write_timeout,
            backoff: ReconnectBackoff::from(settings),
            state: state_tx.clone(),
        };
        let task = tokio::spawn(session.run(shutdown_rx).instrument(span.clone()));
        let supervisor = tokio::spawn(supervise(task, state_tx).instrument(span));

        SessionHandle {
            sender,
            state: state_rx,
            shutdown: Arc::new(shutdown_tx),
            srq: srq_tx,
            task: Arc::new(Mutex::new(Some(supervisor))),
        }
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            match next {
                SessionState::Faulted => warn!(from = %previous, "Session faulted"),
                _ => info!(from = %previous, to = %next, "Session state changed"),
            }
        }
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut recovering = false;
        loop {
            self.set_state(SessionState::Connecting);
            let connected = {
                let connect = self.link.connect(self.device_address, self.handshake_timeout);
                tokio::pin!(connect);
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break None,
                        result = &mut connect => break Some(result),
                        request = self.requests.recv(), if recovering => match request {
                            Some(request) => {
                                debug!(id = request.id, "Rejecting request while reconnecting");
                                request.fail(PsuError::NotConnected);
                            }
                            None => break None,
                        },
                    }
                }
            };
            match connected {
                None => break,
                Some(Ok(())) => {
                    recovering = false;
                    self.backoff.reset();
                    self.set_state(SessionState::Ready);
                    if let Exit::Shutdown = self.serve(&mut shutdown).await {
                        break;
                    }
                }
                Some(Err(e)) => error!(error = %e, "Connect failed"),
            }

            recovering = true;
            self.enter_fault().await;
            let delay = self.backoff.next_delay();
            debug!(?delay, "Reconnect scheduled");
            if let Exit::Shutdown = self.reject_while_faulted(delay, &mut shutdown).await {
                break;
            }
        }

        self.link.transport.close().await;
        self.requests.close();
        while let Ok(request) = self.requests.try_recv() {
            request.fail(PsuError::NotConnected);
        }
        self.set_state(SessionState::Disconnected);
        info!("Session stopped");
    }

    /// Close the link and publish Faulted. Idempotent.
    async fn enter_fault(&mut self) {
        self.link.transport.close().await;
        self.set_state(SessionState::Faulted);
    }

    async fn serve(&mut self, shutdown: &mut watch::Receiver<bool>) -> Exit {
        loop {
            let request = tokio::select! {
                biased;
                _ = shutdown.changed() => return Exit::Shutdown,
                request = self.requests.recv() => request,
            };
            let Some(request) = request else {
                return Exit::Shutdown;
            };
            if request.is_abandoned() {
                debug!(id = request.id, "Skipping abandoned request");
                continue;
            }

            let span = debug_span!("request", id = request.id, command = %request.command);
            let outcome = self
                .link
                .execute(&request.command, request.timeout)
                .instrument(span)
                .await;

            match outcome {
                Ok(value) => request.fulfill(Ok(value)),
                Err(Failure::Device(code)) => {
                    warn!(id = request.id, %code, "Device rejected command");
                    request.fail(PsuError::Device(code));
                }
                Err(Failure::Exhausted(err)) => {
                    error!(id = request.id, error = %err, "Retries exhausted");
                    self.enter_fault().await;
                    request.fail(err);
                    return Exit::Faulted;
                }
                Err(Failure::Link(err)) => {
                    error!(id = request.id, error = %err, "Link failed");
                    self.enter_fault().await;
                    request.fail(PsuError::NotConnected);
                    return Exit::Faulted;
                }
            }
        }
    }

    async fn reject_while_faulted(
        &mut self,
        delay: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Exit {
        let wake = time::sleep(delay);
        tokio::pin!(wake);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => return Exit::Shutdown,
                _ = &mut wake => return Exit::Reconnect,
                request = self.requests.recv() => match request {
                    Some(request) => {
                        debug!(id = request.id, "Rejecting request while faulted");
                        request.fail(PsuError::NotConnected);
                    }
                    None => return Exit::Shutdown,
                },
            }
        }
    }
}

/// Wait for the session task and report it if it died instead of stopping.
async fn supervise(task: JoinHandle<()>, state: Arc<watch::Sender<SessionState>>) {
    if let Err(e) = task.await {
        if e.is_panic() {
            error!(error = %e, "Session task panicked");
        } else {
            error!(error = %e, "Session task ended abnormally");
        }
        state.send_replace(SessionState::Disconnected);
    }
}

/// Caller-side handle to a running [`DeviceSession`]. Cheap to clone.
///
/// Dropping every handle shuts the session down.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    sender: RequestSender,
    state: watch::Receiver<SessionState>,
    shutdown: Arc<watch::Sender<bool>>,
    srq: broadcast::Sender<SrqEvent>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SessionHandle {
    /// Producer side of the request channel.
    pub fn sender(&self) -> RequestSender {
        self.sender.clone()
    }

    /// Submit `command` with default timing and wait for the result.
    pub async fn request(&self, command: Command) -> PsuResult<Value> {
        self.sender.submit(command).await
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wait until the session reaches `target`.
    pub async fn wait_for(&self, target: SessionState) -> PsuResult<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| PsuError::NotConnected)
    }

    /// Service requests raised by the unit.
    pub fn srq_events(&self) -> broadcast::Receiver<SrqEvent> {
        self.srq.subscribe()
    }

    /// Stop the session: close the link, fail queued requests, end the task.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Session supervisor ended abnormally");
            }
        }
    }
}
