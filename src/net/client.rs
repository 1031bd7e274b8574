//! Network Client
//!
//! TCP client for talking to the other pair processes. Every call is
//! bounded by a timeout; a timeout is reported as unreachability, never
//! propagated past the heartbeat/replication layer.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{read_message, write_message};
use crate::error::{Error, Result};
use crate::replication::Message;

/// Network client for pair and arbiter communication
#[derive(Clone)]
pub struct NetClient {
    /// Connection timeout
    connect_timeout: Duration,
    /// Whole-request timeout
    request_timeout: Duration,
}

impl NetClient {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }

    /// Send a message and wait for the single response
    pub async fn request(&self, address: &str, message: Message) -> Result<Message> {
        let result = timeout(self.request_timeout, self.request_inner(address, message)).await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    async fn request_inner(&self, address: &str, message: Message) -> Result<Message> {
        let stream = self.connect(address).await?;
        let (mut reader, mut writer) = stream.into_split();

        write_message(&mut writer, &message).await?;
        let response = read_message(&mut reader).await?;

        // A protocol-level error frame becomes a local error here so
        // callers match on one surface
        if let Message::Error { code, message } = &response {
            tracing::trace!("{} answered error {:?}: {}", address, code, message);
        }

        Ok(response)
    }

    /// Connect to an address
    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let result = timeout(self.connect_timeout, TcpStream::connect(address)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_address_times_out_quickly() {
        let client = NetClient::new(Duration::from_millis(200), Duration::from_millis(400));

        let start = std::time::Instant::now();
        let err = client
            .request("127.0.0.1:1", Message::RoleQuery)
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {:?}", err);
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
