mod huproxy;

use std::time::Duration;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "huproxy",
    version,
    about = "huproxy - tunnel TCP connections over WebSockets"
)]
struct Cli {
    /// Path to config file (.toml/.yaml/.yml). If omitted, uses HUPROXY_CONFIG; then auto-detects huproxy.toml > huproxy.yaml > huproxy.yml from CWD; then falls back to the OS default path (Linux: /etc/huproxy/huproxy.toml; others: user config dir). A missing file means built-in defaults.
    #[arg(long, env = "HUPROXY_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Address to listen on (default 127.0.0.1:8086; ":PORT" binds all interfaces).
    #[arg(long)]
    listen: Option<String>,

    /// Path prefix for tunnel requests (default "proxy").
    #[arg(long)]
    url: Option<String>,

    /// Upper bound on connecting to the target, e.g. "10s".
    #[arg(long, value_parser = humantime::parse_duration)]
    dial_timeout: Option<Duration>,

    /// Upper bound on completing the WebSocket upgrade.
    #[arg(long, value_parser = humantime::parse_duration)]
    handshake_timeout: Option<Duration>,

    /// Upper bound on sending the final close frame.
    #[arg(long, value_parser = humantime::parse_duration)]
    write_timeout: Option<Duration>,

    /// Log output: stdout, stderr, discard, or a file path.
    #[arg(long)]
    log: Option<String>,

    /// Log level: debug, info, warn, error.
    #[arg(long)]
    level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let overrides = huproxy::config::Overrides {
        listen_addr: cli.listen,
        url: cli.url,
        dial_timeout: cli.dial_timeout,
        handshake_timeout: cli.handshake_timeout,
        write_timeout: cli.write_timeout,
        log_output: cli.log,
        log_level: cli.level,
    };
    huproxy::run(cli.config, overrides).await
}
