use std::{fmt, time::Duration};

use tokio::time;

use crate::huproxy::tunnel::{
    channel::{CLOSE_NORMAL, ChannelError, ChannelWriter},
    conn::{self, ByteStream},
    error::RelayError,
    target::Target,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ChannelToSocket,
    SocketToChannel,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ChannelToSocket => f.write_str("channel->socket"),
            Direction::SocketToChannel => f.write_str("socket->channel"),
        }
    }
}

/// How one relay direction ended.
#[derive(Debug)]
pub enum Outcome {
    /// The channel peer closed normally or went away.
    Closed,
    /// The target closed its side of the byte stream.
    Eof,
    /// Stopped because the session was already being torn down.
    Interrupted,
    Failed(RelayError),
}

impl Outcome {
    pub fn is_fault(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }
}

#[derive(Debug)]
pub struct Leg {
    pub direction: Direction,
    pub outcome: Outcome,
    pub bytes: u64,
}

/// What a finished session reports back to its owner.
#[derive(Debug)]
pub struct Summary {
    pub bytes_to_target: u64,
    pub bytes_from_target: u64,
    pub faulted: bool,
}

/// Send a normal-closure frame after the target reached end-of-stream.
///
/// A peer that already started its own close is not a fault.
pub async fn graceful_close<W: ChannelWriter>(
    sid: &str,
    target: &Target,
    writer: &mut W,
    timeout: Duration,
) {
    let res = if timeout > Duration::from_millis(0) {
        match time::timeout(timeout, writer.send_close(CLOSE_NORMAL)).await {
            Ok(r) => r,
            Err(_) => {
                tracing::warn!(sid = %sid, target = %target, timeout = %humantime::format_duration(timeout), "tunnel: close message timed out");
                return;
            }
        }
    } else {
        writer.send_close(CLOSE_NORMAL).await
    };

    match res {
        Ok(()) => {}
        Err(ChannelError::Closed) => {
            tracing::debug!(sid = %sid, target = %target, "tunnel: peer already closing");
        }
        Err(err) => {
            tracing::warn!(sid = %sid, target = %target, err = %err, "tunnel: error sending close message");
        }
    }
}

/// Release both resources of a session once both directions have ended.
///
/// Runs exactly once per session; the socket and the channel writer are consumed here.
pub async fn teardown<W, S>(
    sid: &str,
    target: &Target,
    legs: [Leg; 2],
    writer: W,
    socket: S,
    close_timeout: Duration,
) -> Summary
where
    W: ChannelWriter,
    S: ByteStream,
{
    let mut summary = Summary {
        bytes_to_target: 0,
        bytes_from_target: 0,
        faulted: false,
    };

    for leg in &legs {
        match leg.direction {
            Direction::ChannelToSocket => summary.bytes_to_target = leg.bytes,
            Direction::SocketToChannel => summary.bytes_from_target = leg.bytes,
        }
        match &leg.outcome {
            Outcome::Failed(err) => {
                summary.faulted = true;
                tracing::warn!(
                    sid = %sid,
                    target = %target,
                    direction = %leg.direction,
                    err = %err,
                    "tunnel: aborted"
                );
            }
            other => {
                tracing::debug!(sid = %sid, direction = %leg.direction, outcome = ?other, "tunnel: direction ended");
            }
        }
    }

    conn::close(socket).await;
    writer.close(close_timeout).await;

    summary
}
