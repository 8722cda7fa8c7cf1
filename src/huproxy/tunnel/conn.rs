use std::{io, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time,
};

/// A raw bidirectional byte stream to a tunnel target.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Opens byte-stream connections to tunnel targets.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Stream: ByteStream;

    async fn dial(&self, addr: &str) -> io::Result<Self::Stream>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(&self, addr: &str) -> io::Result<TcpStream> {
        let s = TcpStream::connect(addr).await?;
        // Interactive traffic (ssh) is latency sensitive.
        let _ = s.set_nodelay(true);
        Ok(s)
    }
}

/// Dial with an optional upper bound on connect time; zero means unbounded.
pub async fn dial_timeout<D: Dialer>(
    dialer: &D,
    addr: &str,
    timeout: Duration,
) -> io::Result<D::Stream> {
    if timeout > Duration::from_millis(0) {
        time::timeout(timeout, dialer.dial(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("dial timeout {addr}")))?
    } else {
        dialer.dial(addr).await
    }
}

/// Close a byte stream. Taking it by value means it cannot be closed twice.
pub async fn close<S: ByteStream>(mut s: S) {
    let _ = time::timeout(Duration::from_secs(1), s.shutdown()).await;
}
