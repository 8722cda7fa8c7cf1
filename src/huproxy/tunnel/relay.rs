use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::huproxy::tunnel::{
    channel::{
        CLOSE_ABNORMAL, CLOSE_NORMAL, ChannelError, ChannelReader, ChannelWriter, Message,
        MessageChannel,
    },
    close::{self, Direction, Leg, Outcome, Summary},
    conn::ByteStream,
    error::RelayError,
    negotiate::TunnelSession,
    signal::{Cancel, Deadline},
};

/// Relay a negotiated session until both directions have ended, then tear it down.
pub async fn run<C, S>(session: TunnelSession<C, S>) -> Summary
where
    C: MessageChannel,
    S: ByteStream,
{
    let TunnelSession {
        sid,
        target,
        channel,
        socket,
        config,
    } = session;

    let deadline = Deadline::new();
    let cancel = Cancel::new(deadline.clone());

    let (reader, mut writer) = channel.split();
    let (mut sock_rd, mut sock_wr) = tokio::io::split(socket);

    let (inbound, outbound) = tokio::join!(
        channel_to_socket(reader, &mut sock_wr, &deadline, &cancel),
        async {
            let leg = socket_to_channel(
                &mut sock_rd,
                &mut writer,
                config.buffer_size,
                &deadline,
                &cancel,
            )
            .await;
            if matches!(leg.outcome, Outcome::Eof) {
                close::graceful_close(&sid, &target, &mut writer, config.write_timeout).await;
            }
            // Nothing more will reach the channel; stop the reader too.
            cancel.fire();
            leg
        },
    );

    let socket = sock_rd.unsplit(sock_wr);
    close::teardown(
        &sid,
        &target,
        [inbound, outbound],
        writer,
        socket,
        config.write_timeout,
    )
    .await
}

async fn channel_to_socket<R, W>(
    mut reader: R,
    socket: &mut W,
    deadline: &Deadline,
    cancel: &Cancel,
) -> Leg
where
    R: ChannelReader,
    W: AsyncWrite + Unpin,
{
    let mut bytes = 0u64;

    let outcome = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.fired() => break Outcome::Interrupted,
            m = reader.next_message() => m,
        };

        match next {
            Ok(Message::Binary(payload)) => {
                let written = deadline
                    .run(async {
                        socket.write_all(&payload).await?;
                        socket.flush().await
                    })
                    .await;
                if let Err(err) = written {
                    break socket_failure("write to target", err, deadline);
                }
                bytes += payload.len() as u64;
            }
            Ok(Message::Close(code)) if code == CLOSE_NORMAL || code == CLOSE_ABNORMAL => {
                break Outcome::Closed;
            }
            Ok(Message::Close(code)) => {
                break Outcome::Failed(RelayError::io(
                    "channel closed",
                    io::Error::other(format!("close code {code}")),
                ));
            }
            Ok(other) => break Outcome::Failed(RelayError::ProtocolViolation(other.kind())),
            Err(err) => break Outcome::Failed(RelayError::io("read from channel", err.into_io())),
        }
    };

    match outcome {
        Outcome::Failed(_) => {
            cancel.fire();
        }
        // Unblock the other direction if it is parked on a socket read.
        _ => deadline.expire_soon(),
    }

    Leg {
        direction: Direction::ChannelToSocket,
        outcome,
        bytes,
    }
}

async fn socket_to_channel<R, W>(
    socket: &mut R,
    writer: &mut W,
    buffer_size: usize,
    deadline: &Deadline,
    cancel: &Cancel,
) -> Leg
where
    R: AsyncRead + Unpin,
    W: ChannelWriter,
{
    let mut bytes = 0u64;
    let mut buf = vec![0u8; buffer_size.max(1)];

    let outcome = loop {
        let n = match deadline.run(socket.read(&mut buf)).await {
            Ok(0) => break Outcome::Eof,
            Ok(n) => n,
            Err(err) => break socket_failure("read from target", err, deadline),
        };

        let sent = tokio::select! {
            biased;
            _ = cancel.fired() => break Outcome::Interrupted,
            r = writer.send_binary(Bytes::copy_from_slice(&buf[..n])) => r,
        };
        match sent {
            Ok(()) => bytes += n as u64,
            Err(ChannelError::Closed) => break Outcome::Interrupted,
            Err(err) => break Outcome::Failed(RelayError::io("write to channel", err.into_io())),
        }
    };

    if outcome.is_fault() {
        cancel.fire();
    }

    Leg {
        direction: Direction::SocketToChannel,
        outcome,
        bytes,
    }
}

/// A socket error caused by our own teardown deadline is an interruption, not a fault.
fn socket_failure(context: &'static str, err: io::Error, deadline: &Deadline) -> Outcome {
    if err.kind() == io::ErrorKind::TimedOut && deadline.is_set() {
        Outcome::Interrupted
    } else {
        Outcome::Failed(RelayError::io(context, err))
    }
}
