//! Emulated Genesys power supply
//!
//! The emulator runs as a single task that owns the [`DeviceState`]. Hosts reach
//! it through in-memory links handed out by [`EmulatorHandle::connect`]; each
//! link speaks the same framed ASCII protocol as the RS-232 port of a real unit,
//! so the device session cannot tell the difference.
//!
//! State survives reconnects: a new link replaces the previous one (which the
//! host then sees as closed), the set points stay.
//!
//! # Fault injection
//!
//! [`EmulatorFault`] lets tests drive the session through its error paths:
//!
//! ```rust,ignore
//! let handle = Emulator::new(&settings, 6, Codec::default()).spawn();
//! handle.set_fault(EmulatorFault::Silent).await;   // every request times out
//! handle.set_fault(EmulatorFault::Unplugged).await; // link drops, connects refused
//! handle.set_fault(EmulatorFault::None).await;      // back to normal
//! ```

mod device;
mod jitter;

pub use device::{DeviceState, VirtualSupply};
pub use jitter::JitterSource;

use crate::config::EmulatorSettings;
use crate::protocol::Codec;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Buffer size of each in-memory link, per direction.
const LINK_BUFFER: usize = 1024;

/// Misbehaviour injected into the emulated unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmulatorFault {
    /// Normal operation
    #[default]
    None,
    /// Frames are processed but never answered
    Silent,
    /// Every answer is replaced by an empty, truncated frame
    Garbled,
    /// The current link is dropped and new connects are refused
    Unplugged,
}

enum Control {
    Connect(oneshot::Sender<io::Result<DuplexStream>>),
    SetFault(EmulatorFault),
    Snapshot(oneshot::Sender<DeviceState>),
}

/// Emulated unit before it is started.
#[derive(Debug)]
pub struct Emulator {
    supply: VirtualSupply,
    fault: EmulatorFault,
    response_delay: Duration,
    link: Option<DuplexStream>,
    inbox: Vec<u8>,
}

impl Emulator {
    /// Unit answering at bus `address`.
    pub fn new(settings: &EmulatorSettings, address: u8, codec: Codec) -> Self {
        Self {
            supply: VirtualSupply::new(settings, address, codec),
            fault: EmulatorFault::None,
            response_delay: settings.response_delay,
            link: None,
            inbox: Vec::with_capacity(64),
        }
    }

    /// Start the emulator task.
    pub fn spawn(self) -> EmulatorHandle {
        let (tx, rx) = mpsc::channel(16);
        info!(
            address = self.supply.state().address,
            serial = %self.supply.state().serial_number,
            "Starting emulated power supply"
        );
        tokio::spawn(self.run(rx));
        EmulatorHandle {
            tx,
            connect_attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    async fn run(mut self, mut control: mpsc::Receiver<Control>) {
        let mut buf = [0u8; 256];
        loop {
            tokio::select! {
                msg = control.recv() => match msg {
                    Some(Control::Connect(reply)) => {
                        let _ = reply.send(self.accept());
                    }
                    Some(Control::SetFault(fault)) => self.set_fault(fault),
                    Some(Control::Snapshot(reply)) => {
                        let _ = reply.send(self.supply.state().clone());
                    }
                    None => break,
                },
                read = read_link(&mut self.link, &mut buf) => match read {
                    Ok(0) | Err(_) => self.hang_up("host closed link"),
                    Ok(n) => {
                        self.inbox.extend_from_slice(&buf[..n]);
                        self.process_inbox().await;
                    }
                },
            }
        }
        debug!("Emulator stopped");
    }

    fn accept(&mut self) -> io::Result<DuplexStream> {
        if self.fault == EmulatorFault::Unplugged {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "emulated device unplugged",
            ));
        }
        let (host, device) = tokio::io::duplex(LINK_BUFFER);
        if self.link.replace(device).is_some() {
            debug!("Replacing previous emulator link");
        }
        self.inbox.clear();
        Ok(host)
    }

    fn set_fault(&mut self, fault: EmulatorFault) {
        info!(?fault, "Emulator fault injected");
        self.fault = fault;
        if fault == EmulatorFault::Unplugged {
            self.hang_up("unplugged");
        }
    }

    fn hang_up(&mut self, reason: &str) {
        if self.link.take().is_some() {
            debug!(reason, "Emulator link dropped");
        }
        self.inbox.clear();
    }

    async fn process_inbox(&mut self) {
        let terminator = self.supply.codec().terminator();
        while let Some(end) = self.inbox.iter().position(|&b| b == terminator) {
            let frame: Vec<u8> = self.inbox.drain(..=end).collect();
            let payload = &frame[..frame.len() - 1];
            if payload.is_empty() {
                continue;
            }

            tokio::time::sleep(self.response_delay).await;
            let reply = match self.fault {
                EmulatorFault::Silent => {
                    self.supply.handle_frame(payload);
                    None
                }
                EmulatorFault::Garbled => {
                    self.supply.handle_frame(payload).map(|_| vec![terminator])
                }
                EmulatorFault::None | EmulatorFault::Unplugged => self.supply.handle_frame(payload),
            };

            let (Some(bytes), Some(link)) = (reply, self.link.as_mut()) else {
                continue;
            };
            if link.write_all(&bytes).await.is_err() {
                self.hang_up("host gone while replying");
                break;
            }
        }
    }
}

async fn read_link(link: &mut Option<DuplexStream>, buf: &mut [u8]) -> io::Result<usize> {
    match link {
        Some(stream) => stream.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Control handle for a running [`Emulator`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EmulatorHandle {
    tx: mpsc::Sender<Control>,
    connect_attempts: Arc<AtomicUsize>,
}

impl EmulatorHandle {
    /// Open a new link to the unit, replacing any previous one.
    pub async fn connect(&self) -> io::Result<DuplexStream> {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Control::Connect(reply))
            .await
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    /// Inject (or clear) a fault.
    pub async fn set_fault(&self, fault: EmulatorFault) {
        let _ = self.tx.send(Control::SetFault(fault)).await;
    }

    /// Copy of the current device state, `None` if the emulator has stopped.
    pub async fn snapshot(&self) -> Option<DeviceState> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Control::Snapshot(reply)).await.ok()?;
        rx.await.ok()
    }

    /// Number of connect attempts made through this handle and its clones.
    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::Relaxed)
    }
}

fn stopped() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "emulator stopped")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exchange(link: &mut DuplexStream, frame: &[u8]) -> Vec<u8> {
        link.write_all(frame).await.unwrap();
        let mut reply = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            link.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\r' {
                return reply;
            }
            reply.push(byte[0]);
        }
    }

    fn spawn_default() -> EmulatorHandle {
        Emulator::new(&EmulatorSettings::default(), 6, Codec::default()).spawn()
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_speaks_protocol() {
        let handle = spawn_default();
        let mut link = handle.connect().await.unwrap();
        assert_eq!(exchange(&mut link, b"ADR 6\r").await, b"OK");
        assert_eq!(exchange(&mut link, b"PV 5\r").await, b"OK");
        assert_eq!(exchange(&mut link, b"PV?\r").await, b"5.000");
        assert_eq!(handle.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_survives_reconnect() {
        let handle = spawn_default();
        let mut first = handle.connect().await.unwrap();
        exchange(&mut first, b"ADR 6\r").await;
        exchange(&mut first, b"PC 3.25\r").await;

        let mut second = handle.connect().await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(first.read(&mut buf).await.unwrap(), 0, "old link closed");
        assert_eq!(exchange(&mut second, b"PC?\r").await, b"3.250");

        let state = handle.snapshot().await.unwrap();
        assert_eq!(state.current, 3.25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unplugged_refuses_connects() {
        let handle = spawn_default();
        let mut link = handle.connect().await.unwrap();
        handle.set_fault(EmulatorFault::Unplugged).await;

        let mut buf = [0u8; 1];
        assert_eq!(link.read(&mut buf).await.unwrap(), 0);
        let err = handle.connect().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);

        handle.set_fault(EmulatorFault::None).await;
        assert!(handle.connect().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_garbled_replies_are_empty_frames() {
        let handle = spawn_default();
        let mut link = handle.connect().await.unwrap();
        exchange(&mut link, b"ADR 6\r").await;
        handle.set_fault(EmulatorFault::Garbled).await;
        assert_eq!(exchange(&mut link, b"SN?\r").await, b"");
    }
}
