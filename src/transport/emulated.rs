//! In-process links to the [`Emulator`](crate::emulator::Emulator).

use super::{Connector, DynSerial};
use crate::emulator::EmulatorHandle;
use crate::error::TransportError;
use async_trait::async_trait;

/// Asks a running emulator for a fresh link on every connect.
#[derive(Debug, Clone)]
pub struct EmulatedConnector {
    handle: EmulatorHandle,
}

impl EmulatedConnector {
    /// Connector for the emulator behind `handle`.
    pub fn new(handle: EmulatorHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl Connector for EmulatedConnector {
    async fn connect(&self) -> Result<DynSerial, TransportError> {
        let link = self
            .handle
            .connect()
            .await
            .map_err(|source| TransportError::Open {
                target: self.describe(),
                source,
            })?;
        Ok(Box::new(link))
    }

    fn describe(&self) -> String {
        "emulated".to_string()
    }
}
