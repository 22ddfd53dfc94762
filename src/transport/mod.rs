//! Byte-stream transports
//!
//! The device session talks to the power supply through the [`Transport`] trait
//! only. All three link kinds share one implementation, [`StreamTransport`],
//! which frames responses on the protocol terminator and strips service-request
//! markers. What differs between serial, TCP and the emulator is how the raw
//! stream is obtained, which is the job of a [`Connector`].
//!
//! # Example
//!
//! ```rust,ignore
//! let connector = TcpConnector::new("192.168.0.20:8003", Duration::from_secs(2));
//! let mut transport = StreamTransport::new(connector);
//! transport.open().await?;
//! transport.write_frame(b"ADR 6\r").await?;
//! let reply = transport.read_until(b'\r', Instant::now() + Duration::from_millis(200)).await?;
//! assert_eq!(reply, b"OK");
//! ```

mod emulated;
#[cfg(feature = "serial")]
mod serial;
mod srq;
mod tcp;

pub use emulated::EmulatedConnector;
#[cfg(feature = "serial")]
pub use serial::SerialConnector;
pub use srq::{SrqEvent, SrqFilter};
pub use tcp::TcpConnector;

use crate::config::{ConnectionConfig, TransportKind};
use crate::emulator::EmulatorHandle;
use crate::error::{PsuError, TransportError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

/// Anything that behaves like a serial port.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased byte stream.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Quiet period used when discarding stale input.
const DRAIN_WINDOW: Duration = Duration::from_millis(20);

/// Frame-level link to one device.
///
/// A transport is owned by exactly one task, so methods take `&mut self` and no
/// locking is involved.
#[async_trait]
pub trait Transport: Send {
    /// Open the link. Opening an already open link reopens it.
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Write one complete frame (terminator included).
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Read one frame, returning its payload without the terminator.
    ///
    /// Fails with [`TransportError::Timeout`] if no terminator arrives before
    /// `deadline`.
    async fn read_until(&mut self, terminator: u8, deadline: Instant)
        -> Result<Vec<u8>, TransportError>;

    /// Throw away buffered and in-flight input. Returns the number of bytes dropped.
    async fn discard_input(&mut self) -> Result<usize, TransportError>;

    /// Close the link. Closing a closed link is a no-op.
    async fn close(&mut self);

    /// True while the link is open.
    fn is_open(&self) -> bool;

    /// Human-readable link description for logs.
    fn describe(&self) -> String;

    /// Where to publish service requests seen on the line.
    fn set_srq_sink(&mut self, _sink: broadcast::Sender<SrqEvent>) {}
}

/// Produces a fresh byte stream for each connect attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish the raw stream.
    async fn connect(&self) -> Result<DynSerial, TransportError>;

    /// Human-readable target description.
    fn describe(&self) -> String;
}

/// [`Transport`] over any [`Connector`].
pub struct StreamTransport<C> {
    connector: C,
    stream: Option<DynSerial>,
    pending: Vec<u8>,
    srq: SrqFilter,
    srq_sink: Option<broadcast::Sender<SrqEvent>>,
}

impl<C: Connector> StreamTransport<C> {
    /// Wrap a connector. The link starts closed.
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            stream: None,
            pending: Vec::with_capacity(64),
            srq: SrqFilter::default(),
            srq_sink: None,
        }
    }

    fn take_frame(&mut self, terminator: u8) -> Option<Vec<u8>> {
        let end = self.pending.iter().position(|&b| b == terminator)?;
        let mut frame: Vec<u8> = self.pending.drain(..=end).collect();
        frame.pop();
        Some(frame)
    }

    fn ingest(&mut self, bytes: &[u8]) {
        for event in self.srq.filter(bytes, &mut self.pending) {
            debug!(address = event.address, "Service request");
            if let Some(sink) = &self.srq_sink {
                // No subscribers is fine.
                let _ = sink.send(event);
            }
        }
    }

    fn drop_stream(&mut self) {
        self.stream = None;
        self.pending.clear();
        self.srq.reset();
    }
}

#[async_trait]
impl<C: Connector> Transport for StreamTransport<C> {
    async fn open(&mut self) -> Result<(), TransportError> {
        self.drop_stream();
        let stream = self.connector.connect().await?;
        debug!(target_link = %self.connector.describe(), "Link opened");
        self.stream = Some(stream);
        Ok(())
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        trace!(frame = ?String::from_utf8_lossy(frame), "TX");
        stream.write_all(frame).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read_until(
        &mut self,
        terminator: u8,
        deadline: Instant,
    ) -> Result<Vec<u8>, TransportError> {
        let mut buf = [0u8; 256];
        loop {
            if let Some(frame) = self.take_frame(terminator) {
                trace!(frame = ?String::from_utf8_lossy(&frame), "RX");
                return Ok(frame);
            }

            let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
            let n = match time::timeout_at(deadline, stream.read(&mut buf)).await {
                Err(_) => return Err(TransportError::Timeout),
                Ok(Err(e)) => return Err(TransportError::Io(e)),
                Ok(Ok(n)) => n,
            };
            if n == 0 {
                self.drop_stream();
                return Err(TransportError::Closed);
            }
            self.ingest(&buf[..n]);
        }
    }

    async fn discard_input(&mut self) -> Result<usize, TransportError> {
        let buffered = self.pending.len();
        self.pending.clear();
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        let drained = drain_input(stream, DRAIN_WINDOW).await;
        let total = buffered + drained;
        if total > 0 {
            debug!(bytes = total, "Discarded stale input");
        }
        Ok(total)
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!(target_link = %self.connector.describe(), "Link closed");
        }
        self.drop_stream();
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn describe(&self) -> String {
        self.connector.describe()
    }

    fn set_srq_sink(&mut self, sink: broadcast::Sender<SrqEvent>) {
        self.srq_sink = Some(sink);
    }
}

/// Read and discard whatever arrives until the line stays quiet for `window`.
pub async fn drain_input<R: AsyncRead + Unpin>(port: &mut R, window: Duration) -> usize {
    let mut discard = [0u8; 256];
    let mut total = 0usize;
    loop {
        match time::timeout(window, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total += n,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }
    total
}

/// Build the transport described by `config`.
///
/// The emulated transport needs a running emulator to connect to.
pub fn build_transport(
    config: &ConnectionConfig,
    emulator: Option<EmulatorHandle>,
) -> Result<Box<dyn Transport>, PsuError> {
    match config.transport {
        TransportKind::Tcp => Ok(Box::new(StreamTransport::new(TcpConnector::new(
            config.address.clone(),
            config.connect_timeout,
        )))),
        TransportKind::Emulated => {
            let handle = emulator.ok_or_else(|| {
                PsuError::Configuration("emulated transport requires an emulator".into())
            })?;
            Ok(Box::new(StreamTransport::new(EmulatedConnector::new(handle))))
        }
        #[cfg(feature = "serial")]
        TransportKind::Serial => Ok(Box::new(StreamTransport::new(SerialConnector::new(
            config.address.clone(),
            config.serial.clone(),
            config.connect_timeout,
        )))),
        #[cfg(not(feature = "serial"))]
        TransportKind::Serial => Err(PsuError::Configuration(
            "serial transport support not compiled in (enable the `serial` feature)".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::DuplexStream;

    /// Hands out pre-made duplex ends, one per connect.
    struct DuplexConnector {
        ends: Mutex<Vec<DuplexStream>>,
    }

    impl DuplexConnector {
        fn single() -> (Self, DuplexStream) {
            let (host, device) = tokio::io::duplex(256);
            (
                Self {
                    ends: Mutex::new(vec![host]),
                },
                device,
            )
        }
    }

    #[async_trait]
    impl Connector for DuplexConnector {
        async fn connect(&self) -> Result<DynSerial, TransportError> {
            match self.ends.lock().unwrap().pop() {
                Some(end) => Ok(Box::new(end)),
                None => Err(TransportError::Open {
                    target: "duplex".into(),
                    source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
                }),
            }
        }

        fn describe(&self) -> String {
            "duplex".into()
        }
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(100)
    }

    #[tokio::test]
    async fn test_read_splits_frames_on_terminator() {
        let (connector, mut device) = DuplexConnector::single();
        let mut transport = StreamTransport::new(connector);
        transport.open().await.unwrap();

        device.write_all(b"OK\r12.345\rpartial").await.unwrap();
        assert_eq!(transport.read_until(b'\r', soon()).await.unwrap(), b"OK");
        assert_eq!(transport.read_until(b'\r', soon()).await.unwrap(), b"12.345");

        device.write_all(b" frame\r").await.unwrap();
        assert_eq!(
            transport.read_until(b'\r', soon()).await.unwrap(),
            b"partial frame"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_times_out_without_terminator() {
        let (connector, mut device) = DuplexConnector::single();
        let mut transport = StreamTransport::new(connector);
        transport.open().await.unwrap();

        device.write_all(b"12.3").await.unwrap();
        let result = transport.read_until(b'\r', soon()).await;
        assert!(matches!(result, Err(TransportError::Timeout)));
    }

    #[tokio::test]
    async fn test_srq_bytes_are_removed_and_published() {
        let (connector, mut device) = DuplexConnector::single();
        let mut transport = StreamTransport::new(connector);
        let (tx, mut rx) = broadcast::channel(4);
        transport.set_srq_sink(tx);
        transport.open().await.unwrap();

        device.write_all(&[0x86, 0x86, b'O', b'K', b'\r']).await.unwrap();
        assert_eq!(transport.read_until(b'\r', soon()).await.unwrap(), b"OK");
        assert_eq!(rx.try_recv().unwrap(), SrqEvent { address: 6 });
    }

    #[tokio::test]
    async fn test_peer_close_reported_and_link_dropped() {
        let (connector, device) = DuplexConnector::single();
        let mut transport = StreamTransport::new(connector);
        transport.open().await.unwrap();
        drop(device);

        let result = transport.read_until(b'\r', soon()).await;
        assert!(matches!(result, Err(TransportError::Closed)));
        assert!(!transport.is_open());
        assert!(matches!(
            transport.write_frame(b"MV?\r").await,
            Err(TransportError::NotOpen)
        ));
    }

    #[tokio::test]
    async fn test_open_failure_is_open_error() {
        let (connector, _device) = DuplexConnector::single();
        connector.ends.lock().unwrap().clear();
        let mut transport = StreamTransport::new(connector);
        let err = transport.open().await.unwrap_err();
        assert!(err.is_open_failure());
    }

    #[tokio::test]
    async fn test_discard_input_drops_stale_bytes() {
        let (connector, mut device) = DuplexConnector::single();
        let mut transport = StreamTransport::new(connector);
        transport.open().await.unwrap();

        device.write_all(b"late reply\rmore").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(transport.discard_input().await.unwrap(), 15);

        device.write_all(b"fresh\r").await.unwrap();
        assert_eq!(transport.read_until(b'\r', soon()).await.unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn test_write_reaches_device() {
        let (connector, mut device) = DuplexConnector::single();
        let mut transport = StreamTransport::new(connector);
        transport.open().await.unwrap();
        transport.write_frame(b"PV 1.000\r").await.unwrap();

        let mut buf = [0u8; 9];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PV 1.000\r");
    }
}
