use std::time::Duration;

use tokio::time;

use crate::huproxy::tunnel::{
    channel::{ChannelError, ChannelWriter, MessageChannel, Upgrade},
    conn::{self, ByteStream, Dialer, TcpDialer},
    error::SetupError,
    target::Target,
};

pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Per-session settings, fixed when a session is negotiated.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub write_timeout: Duration,
    pub buffer_size: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// A negotiated session: both transports are open and owned here until the relay consumes it.
pub struct TunnelSession<C, S> {
    pub sid: String,
    pub target: Target,
    pub channel: C,
    pub socket: S,
    pub config: TunnelConfig,
}

/// A dialed target whose channel upgrade has not been committed yet.
pub struct Dialed<S> {
    sid: String,
    target: Target,
    socket: S,
    config: TunnelConfig,
}

impl<S: ByteStream> Dialed<S> {
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Complete the upgrade within the handshake timeout.
    ///
    /// On failure the already-dialed socket is closed here; no relay is started.
    pub async fn upgrade<U: Upgrade>(
        self,
        upgrade: U,
    ) -> Result<TunnelSession<U::Channel, S>, SetupError> {
        match bounded(self.config.handshake_timeout, upgrade.upgrade()).await {
            Ok(channel) => Ok(TunnelSession {
                sid: self.sid,
                target: self.target,
                channel,
                socket: self.socket,
                config: self.config,
            }),
            Err(err) => {
                conn::close(self.socket).await;
                Err(SetupError::UpgradeFailed(err.to_string()))
            }
        }
    }
}

/// Turns a tunnel request into a [`TunnelSession`].
pub struct Negotiator<D = TcpDialer> {
    dialer: D,
    config: TunnelConfig,
}

impl Negotiator<TcpDialer> {
    pub fn tcp(config: TunnelConfig) -> Self {
        Self::new(TcpDialer, config)
    }
}

impl<D: Dialer> Negotiator<D> {
    pub fn new(dialer: D, config: TunnelConfig) -> Self {
        Self { dialer, config }
    }

    /// Dial the target ahead of the upgrade so a failure can still be answered with a status.
    pub async fn dial(&self, sid: &str, target: Target) -> Result<Dialed<D::Stream>, SetupError> {
        let addr = target.addr();
        let socket = conn::dial_timeout(&self.dialer, &addr, self.config.dial_timeout)
            .await
            .map_err(|source| SetupError::DialFailed {
                target: addr.clone(),
                source,
            })?;

        tracing::debug!(sid = %sid, target = %addr, "tunnel: target dialed");

        Ok(Dialed {
            sid: sid.to_string(),
            target,
            socket,
            config: self.config.clone(),
        })
    }

    /// Negotiation for transports that commit the upgrade before anything else can happen.
    ///
    /// A dial failure can then no longer be answered; the channel is closed without relaying.
    pub async fn negotiate_committed<U: Upgrade>(
        &self,
        sid: &str,
        host: &str,
        port: &str,
        upgrade: U,
    ) -> Result<TunnelSession<U::Channel, D::Stream>, SetupError> {
        let target = Target::new(host, port)?;
        let channel = bounded(self.config.handshake_timeout, upgrade.upgrade())
            .await
            .map_err(|err| SetupError::UpgradeFailed(err.to_string()))?;

        let addr = target.addr();
        match conn::dial_timeout(&self.dialer, &addr, self.config.dial_timeout).await {
            Ok(socket) => Ok(TunnelSession {
                sid: sid.to_string(),
                target,
                channel,
                socket,
                config: self.config.clone(),
            }),
            Err(source) => {
                let (_reader, writer) = channel.split();
                writer.close(self.config.write_timeout).await;
                Err(SetupError::DialFailed {
                    target: addr,
                    source,
                })
            }
        }
    }
}

async fn bounded<F, T>(timeout: Duration, fut: F) -> Result<T, ChannelError>
where
    F: std::future::Future<Output = Result<T, ChannelError>>,
{
    if timeout > Duration::from_millis(0) {
        time::timeout(timeout, fut)
            .await
            .map_err(|_| ChannelError::Transport("handshake timeout".into()))?
    } else {
        fut.await
    }
}
