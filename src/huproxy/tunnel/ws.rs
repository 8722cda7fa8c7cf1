//! WebSocket binding of the tunnel channel, on top of axum's upgrade.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    extract::ws::{self, CloseFrame, Utf8Bytes, WebSocket, WebSocketUpgrade},
    response::Response,
};
use bytes::Bytes;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{sync::oneshot, time};

use crate::huproxy::tunnel::channel::{
    CLOSE_ABNORMAL, ChannelError, ChannelReader, ChannelWriter, Message, MessageChannel, Upgrade,
};

/// Close code used when a close frame carries no status.
const CLOSE_NO_STATUS: u16 = 1005;

/// An accepted but not yet completed WebSocket upgrade.
///
/// axum completes the upgrade only after the `101` response has been sent, so the socket is
/// handed over through a oneshot and [`Upgrade::upgrade`] waits for it.
pub struct WsUpgrade {
    rx: oneshot::Receiver<WebSocket>,
}

impl WsUpgrade {
    /// Commit the upgrade; the returned response must be sent back to the client.
    pub fn accept(ws: WebSocketUpgrade, sid: &str) -> (Self, Response) {
        let (tx, rx) = oneshot::channel();
        let sid = sid.to_string();
        let response = ws
            .on_failed_upgrade(move |err| {
                tracing::warn!(sid = %sid, err = %err, "tunnel: failed to upgrade to websockets");
            })
            .on_upgrade(move |socket| async move {
                let _ = tx.send(socket);
            });
        (Self { rx }, response)
    }
}

#[async_trait]
impl Upgrade for WsUpgrade {
    type Channel = WsChannel;

    async fn upgrade(self) -> Result<WsChannel, ChannelError> {
        self.rx
            .await
            .map(WsChannel::new)
            .map_err(|_| ChannelError::Transport("upgrade abandoned".into()))
    }
}

pub struct WsChannel {
    socket: WebSocket,
}

impl WsChannel {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

impl MessageChannel for WsChannel {
    type Reader = WsReader;
    type Writer = WsWriter;

    fn split(self) -> (WsReader, WsWriter) {
        let (sink, stream) = self.socket.split();
        let peer_closed = Arc::new(AtomicBool::new(false));
        (
            WsReader {
                stream,
                peer_closed: peer_closed.clone(),
            },
            WsWriter { sink, peer_closed },
        )
    }
}

pub struct WsReader {
    stream: SplitStream<WebSocket>,
    peer_closed: Arc<AtomicBool>,
}

#[async_trait]
impl ChannelReader for WsReader {
    async fn next_message(&mut self) -> Result<Message, ChannelError> {
        loop {
            let msg = match self.stream.next().await {
                None => return Ok(Message::Close(CLOSE_ABNORMAL)),
                Some(Err(err)) => return Err(ChannelError::Transport(err.to_string())),
                Some(Ok(m)) => m,
            };
            let out = match msg {
                ws::Message::Binary(b) => Message::Binary(b),
                ws::Message::Text(t) => Message::Text(t.as_str().to_owned()),
                // Answered by the websocket layer itself.
                ws::Message::Ping(_) | ws::Message::Pong(_) => continue,
                ws::Message::Close(frame) => {
                    self.peer_closed.store(true, Ordering::Release);
                    Message::Close(frame.map(|f| f.code).unwrap_or(CLOSE_NO_STATUS))
                }
            };
            return Ok(out);
        }
    }
}

pub struct WsWriter {
    sink: SplitSink<WebSocket, ws::Message>,
    peer_closed: Arc<AtomicBool>,
}

impl WsWriter {
    fn classify(&self, err: axum::Error) -> ChannelError {
        if self.peer_closed.load(Ordering::Acquire) {
            ChannelError::Closed
        } else {
            ChannelError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl ChannelWriter for WsWriter {
    async fn send_binary(&mut self, payload: Bytes) -> Result<(), ChannelError> {
        match self.sink.send(ws::Message::Binary(payload)).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.classify(err)),
        }
    }

    async fn send_close(&mut self, code: u16) -> Result<(), ChannelError> {
        let frame = CloseFrame {
            code,
            reason: Utf8Bytes::from_static(""),
        };
        match self.sink.send(ws::Message::Close(Some(frame))).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.classify(err)),
        }
    }

    async fn close(mut self, timeout: Duration) {
        // The answer to a close received from the peer is queued by the websocket layer and
        // only goes out on the next flush. Nothing new is sent here, so an aborted session still
        // ends without a close handshake.
        let res = if timeout > Duration::from_millis(0) {
            match time::timeout(timeout, self.sink.flush()).await {
                Ok(r) => r,
                Err(_) => {
                    tracing::debug!("tunnel: flush on close timed out");
                    return;
                }
            }
        } else {
            self.sink.flush().await
        };
        if let Err(err) = res {
            tracing::debug!(err = %err, "tunnel: flush on close");
        }
    }
}
