use std::time::Duration;
use tokio::net::TcpStream;

/// Error type for outbound connection establishment
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("connect to {0} timed out after {1:?}")]
    Timeout(String, Duration),

    #[error("no addresses found for {0}")]
    Resolve(String),

    #[error("connect to {0} failed: {1}")]
    Io(String, #[source] std::io::Error),
}

pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// Establishes outbound TCP connections with a bounded timeout
#[derive(Debug, Clone)]
pub struct UpstreamConnector {
    connect_timeout: Duration,
}

impl UpstreamConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Open a TCP connection to `host:port`, resolving the host first.
    /// Returns a live socket or the failure reason; never leaves a
    /// half-established socket behind.
    pub async fn connect(&self, host: &str, port: u16) -> UpstreamResult<TcpStream> {
        let target = format!("{}:{}", host, port);

        let addr = tokio::net::lookup_host(&target)
            .await
            .map_err(|e| UpstreamError::Io(target.clone(), e))?
            .next()
            .ok_or_else(|| UpstreamError::Resolve(target.clone()))?;

        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(UpstreamError::Io(target, e)),
            Err(_) => Err(UpstreamError::Timeout(target, self.connect_timeout)),
        }
    }
}
