//! In-memory doubles for the tunnel transports.

use std::{
    io,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf},
    sync::{mpsc, oneshot},
};

use crate::huproxy::tunnel::channel::{
    CLOSE_ABNORMAL, ChannelError, ChannelReader, ChannelWriter, Message, MessageChannel, Upgrade,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Binary(Bytes),
    Close(u16),
}

#[derive(Debug, Default)]
pub struct Counters {
    pub close_calls: AtomicUsize,
    pub close_frames: AtomicUsize,
}

impl Counters {
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn close_frames(&self) -> usize {
        self.close_frames.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriterBehavior {
    /// `send_close` reports that the peer already started closing.
    pub peer_already_closed: bool,
    /// `send_binary` fails with a transport error.
    pub fail_sends: bool,
    /// `send_close` is counted but never completes.
    pub close_hangs: bool,
}

/// A message channel fed and observed from the test through a [`MockPeer`].
pub struct MockChannel {
    inbound: mpsc::UnboundedReceiver<Result<Message, ChannelError>>,
    sent: mpsc::UnboundedSender<Sent>,
    counters: Arc<Counters>,
    behavior: WriterBehavior,
}

pub struct MockPeer {
    pub inbound: mpsc::UnboundedSender<Result<Message, ChannelError>>,
    pub sent: mpsc::UnboundedReceiver<Sent>,
    pub counters: Arc<Counters>,
}

impl MockPeer {
    pub fn send(&self, msg: Message) {
        let _ = self.inbound.send(Ok(msg));
    }

    pub fn binary(&self, payload: &[u8]) {
        self.send(Message::Binary(Bytes::copy_from_slice(payload)));
    }

    /// Everything the relay sent, until the channel writer is gone.
    pub async fn drain(&mut self) -> Vec<Sent> {
        let mut out = Vec::new();
        while let Some(s) = self.sent.recv().await {
            out.push(s);
        }
        out
    }
}

pub fn mock_channel(behavior: WriterBehavior) -> (MockChannel, MockPeer) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let counters = Arc::new(Counters::default());
    (
        MockChannel {
            inbound: in_rx,
            sent: sent_tx,
            counters: counters.clone(),
            behavior,
        },
        MockPeer {
            inbound: in_tx,
            sent: sent_rx,
            counters,
        },
    )
}

pub struct MockReader {
    inbound: mpsc::UnboundedReceiver<Result<Message, ChannelError>>,
}

pub struct MockWriter {
    sent: mpsc::UnboundedSender<Sent>,
    counters: Arc<Counters>,
    behavior: WriterBehavior,
}

impl MessageChannel for MockChannel {
    type Reader = MockReader;
    type Writer = MockWriter;

    fn split(self) -> (MockReader, MockWriter) {
        (
            MockReader {
                inbound: self.inbound,
            },
            MockWriter {
                sent: self.sent,
                counters: self.counters,
                behavior: self.behavior,
            },
        )
    }
}

#[async_trait]
impl ChannelReader for MockReader {
    async fn next_message(&mut self) -> Result<Message, ChannelError> {
        match self.inbound.recv().await {
            Some(m) => m,
            None => Ok(Message::Close(CLOSE_ABNORMAL)),
        }
    }
}

#[async_trait]
impl ChannelWriter for MockWriter {
    async fn send_binary(&mut self, payload: Bytes) -> Result<(), ChannelError> {
        if self.behavior.fail_sends {
            return Err(ChannelError::Transport("broken pipe".into()));
        }
        let _ = self.sent.send(Sent::Binary(payload));
        Ok(())
    }

    async fn send_close(&mut self, code: u16) -> Result<(), ChannelError> {
        self.counters.close_frames.fetch_add(1, Ordering::SeqCst);
        if self.behavior.close_hangs {
            std::future::pending::<()>().await;
        }
        if self.behavior.peer_already_closed {
            return Err(ChannelError::Closed);
        }
        let _ = self.sent.send(Sent::Close(code));
        Ok(())
    }

    async fn close(self, _timeout: Duration) {
        self.counters.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Upgrade that completes with a prepared channel, fails, or never completes.
pub enum MockUpgrade {
    Ready(MockChannel),
    Fail,
    Hang(oneshot::Receiver<MockChannel>),
}

#[async_trait]
impl Upgrade for MockUpgrade {
    type Channel = MockChannel;

    async fn upgrade(self) -> Result<MockChannel, ChannelError> {
        match self {
            MockUpgrade::Ready(c) => Ok(c),
            MockUpgrade::Fail => Err(ChannelError::Transport("bad handshake".into())),
            MockUpgrade::Hang(rx) => rx
                .await
                .map_err(|_| ChannelError::Transport("upgrade dropped".into())),
        }
    }
}

/// A byte stream that counts shutdown calls and can be told to fail writes.
pub struct CountingStream {
    inner: DuplexStream,
    shutdowns: Arc<AtomicUsize>,
    fail_writes: bool,
}

impl CountingStream {
    pub fn new(inner: DuplexStream) -> (Self, Arc<AtomicUsize>) {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        (
            Self {
                inner,
                shutdowns: shutdowns.clone(),
                fail_writes: false,
            },
            shutdowns,
        )
    }

    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }
}

impl AsyncRead for CountingStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for CountingStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.fail_writes {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
