use async_trait::async_trait;
use std::time::Duration;
use syncmd_sync::{Connector, Result, SyncError};
use tokio::net::TcpStream;
use tracing::debug;

/// Plain TCP connections to `host:port` addresses
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, address: &str) -> Result<TcpStream> {
        debug!("Connecting to {}", address);
        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(SyncError::Connect(format!("{}: {}", address, e))),
            Err(_) => {
                return Err(SyncError::Connect(format!(
                    "{}: no answer within {:?}",
                    address, self.connect_timeout
                )))
            }
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncmd_sync::ErrorClass;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let connector = TcpConnector::default();
        let (stream, accepted) = tokio::join!(connector.connect(&addr), listener.accept());
        assert!(stream.is_ok());
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn test_refused_connection_is_transient() {
        // Bind and drop to find a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = TcpConnector::default().connect(&addr).await.unwrap_err();
        assert!(matches!(err, SyncError::Connect(_)));
        assert_eq!(err.class(), ErrorClass::TransientNetwork);
    }
}
