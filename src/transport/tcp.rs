//! Raw TCP links (terminal servers, LAN interface option).

use super::{Connector, DynSerial};
use crate::error::TransportError;
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::instrument;

/// Connects to `host:port`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Connector for `address`, giving up after `connect_timeout`.
    pub fn new(address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    #[instrument(skip(self), fields(address = %self.address), err)]
    async fn connect(&self) -> Result<DynSerial, TransportError> {
        let open_error = |source: io::Error| TransportError::Open {
            target: self.describe(),
            source,
        };

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| open_error(io::Error::from(io::ErrorKind::TimedOut)))?
            .map_err(open_error)?;
        stream.set_nodelay(true).map_err(TransportError::Io)?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("tcp {}", self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connects_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let connector = TcpConnector::new(address, Duration::from_secs(1));
        let mut stream = connector.connect().await.unwrap();
        stream.write_all(b"MV?\r").await.unwrap();
        assert_eq!(&server.await.unwrap(), b"MV?\r");
    }

    #[tokio::test]
    async fn test_refused_connection_is_open_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let connector = TcpConnector::new(address, Duration::from_secs(1));
        let err = connector.connect().await.err().unwrap();
        assert!(err.is_open_failure());
    }
}
