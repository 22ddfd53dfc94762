//! RS-232 links via `tokio-serial`.

use super::{Connector, DynSerial};
use crate::config::{FlowControl, Parity, SerialSettings};
use crate::error::TransportError;
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::task::spawn_blocking;
use tokio_serial::SerialPortBuilderExt;
use tracing::instrument;

/// Opens a serial device with the configured framing.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    path: String,
    settings: SerialSettings,
    connect_timeout: Duration,
}

impl SerialConnector {
    /// Connector for the device at `path`.
    pub fn new(path: impl Into<String>, settings: SerialSettings, connect_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            settings,
            connect_timeout,
        }
    }

    fn builder(&self) -> tokio_serial::SerialPortBuilder {
        let data_bits = match self.settings.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let parity = match self.settings.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        };
        let stop_bits = match self.settings.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };
        let flow_control = match self.settings.flow_control {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Software => tokio_serial::FlowControl::Software,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        };

        tokio_serial::new(&self.path, self.settings.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(flow_control)
    }
}

#[async_trait]
impl Connector for SerialConnector {
    #[instrument(skip(self), fields(path = %self.path, baud = self.settings.baud_rate), err)]
    async fn connect(&self) -> Result<DynSerial, TransportError> {
        let open_error = |source: io::Error| TransportError::Open {
            target: self.describe(),
            source,
        };

        // Opening a tty can block (exclusive lock, modem lines), keep it off the runtime.
        let builder = self.builder();
        let opening = spawn_blocking(move || builder.open_native_async());

        let port = tokio::time::timeout(self.connect_timeout, opening)
            .await
            .map_err(|_| open_error(io::Error::from(io::ErrorKind::TimedOut)))?
            .map_err(|join| open_error(io::Error::new(io::ErrorKind::Other, join)))?
            .map_err(|e| open_error(io::Error::from(e)))?;
        Ok(Box::new(port))
    }

    fn describe(&self) -> String {
        format!("serial {} @ {} baud", self.path, self.settings.baud_rate)
    }
}
