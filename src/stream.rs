use crate::monitor::ConnMonitor;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Byte-counting wrapper installed directly over the accepted socket.
///
/// Sits below TLS and the HTTP codec so every byte on the client connection,
/// including tunnel traffic after the CONNECT upgrade, feeds the session's
/// counters and refreshes its activity timestamp.
#[derive(Debug)]
pub struct CountedStream<S> {
    inner: S,
    monitor: Arc<ConnMonitor>,
}

impl<S> CountedStream<S> {
    pub fn new(inner: S, monitor: Arc<ConnMonitor>) -> Self {
        Self { inner, monitor }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CountedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                if n > 0 {
                    this.monitor.add_in(n as u64);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CountedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                if n > 0 {
                    this.monitor.add_out(n as u64);
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::GlobalMonitor;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tracing::Span;

    #[tokio::test]
    async fn counts_bytes_in_both_directions() {
        let global = GlobalMonitor::new();
        let monitor = ConnMonitor::new(global.clone(), Span::none());

        let (near, mut far) = tokio::io::duplex(64);
        let mut counted = CountedStream::new(near, monitor.clone());

        counted.write_all(b"hello").await.unwrap();
        counted.flush().await.unwrap();

        let mut buf = [0u8; 5];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        far.write_all(b"worldwide").await.unwrap();
        let mut buf = [0u8; 9];
        counted.read_exact(&mut buf).await.unwrap();

        assert_eq!(monitor.totals(), (9, 5));

        // Nothing reaches the global counters until a flush
        assert_eq!(global.bytes_in(), 0);
        monitor.flush();
        assert_eq!(global.bytes_in(), 9);
        assert_eq!(global.bytes_out(), 5);
    }

    #[tokio::test]
    async fn eof_read_counts_nothing() {
        let global = GlobalMonitor::new();
        let monitor = ConnMonitor::new(global, Span::none());

        let (near, far) = tokio::io::duplex(16);
        drop(far);

        let mut counted = CountedStream::new(near, monitor.clone());
        let mut buf = [0u8; 8];
        let n = counted.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(monitor.totals(), (0, 0));
    }
}
