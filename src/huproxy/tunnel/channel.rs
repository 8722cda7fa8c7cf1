use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Close code for a normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code reported when the transport vanished without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// One message read from a message channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Binary(Bytes),
    Text(String),
    Close(u16),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Binary(_) => "binary",
            Message::Text(_) => "text",
            Message::Close(_) => "close",
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    /// The close handshake was already started, by us or by the peer.
    #[error("channel already closed")]
    Closed,
    #[error("channel: {0}")]
    Transport(String),
}

impl ChannelError {
    pub fn into_io(self) -> std::io::Error {
        match self {
            ChannelError::Closed => std::io::Error::from(std::io::ErrorKind::NotConnected),
            ChannelError::Transport(msg) => std::io::Error::other(msg),
        }
    }
}

/// Read half of a message channel.
#[async_trait]
pub trait ChannelReader: Send {
    /// Next message. A vanished transport is reported as `Message::Close(CLOSE_ABNORMAL)`.
    async fn next_message(&mut self) -> Result<Message, ChannelError>;
}

/// Write half of a message channel.
#[async_trait]
pub trait ChannelWriter: Send {
    async fn send_binary(&mut self, payload: Bytes) -> Result<(), ChannelError>;

    async fn send_close(&mut self, code: u16) -> Result<(), ChannelError>;

    /// Releases the channel. Consuming `self` makes a second close unrepresentable.
    ///
    /// Control replies the transport still owes the peer (such as the answer to a close it
    /// received) are flushed first, bounded by `timeout`; zero means unbounded.
    async fn close(self, timeout: Duration)
    where
        Self: Sized;
}

/// An established message-framed duplex transport.
pub trait MessageChannel: Send + 'static {
    type Reader: ChannelReader + 'static;
    type Writer: ChannelWriter + 'static;

    fn split(self) -> (Self::Reader, Self::Writer);
}

/// A pending protocol upgrade that yields a message channel once committed.
#[async_trait]
pub trait Upgrade: Send + 'static {
    type Channel: MessageChannel;

    async fn upgrade(self) -> Result<Self::Channel, ChannelError>;
}
