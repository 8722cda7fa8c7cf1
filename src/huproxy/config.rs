use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::huproxy::tunnel::negotiate::{DEFAULT_BUFFER_SIZE, TunnelConfig};

pub const CONFIG_ENV: &str = "HUPROXY_CONFIG";

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        if p.as_os_str().is_empty() {
            anyhow::bail!("config: empty config path");
        }
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // Also read here for callers that bypass the CLI.
    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: PathBuf::from(p),
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    ["huproxy.toml", "huproxy.yaml", "huproxy.yml"]
        .into_iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).map(|m| m.is_file()).unwrap_or(false))
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/huproxy/huproxy.toml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        use directories::ProjectDirs;

        let proj = ProjectDirs::from("com", "huproxy", "huproxy")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("huproxy.toml"))
    }
}

/// Load the config file at `path`; a file that does not exist yields the defaults.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = match fs::read(path) {
        Ok(d) => d,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Config::from_file_config(FileConfig::default());
        }
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {:?}", ext),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub url: String,
    pub admin_addr: String,
    pub buffer_size: usize,
    pub timeouts: Timeouts,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub write_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

/// Values given on the command line; each one that is set wins over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen_addr: Option<String>,
    pub url: Option<String>,
    pub dial_timeout: Option<Duration>,
    pub handshake_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub log_output: Option<String>,
    pub log_level: Option<String>,
}

impl Config {
    pub fn tunnel(&self) -> TunnelConfig {
        TunnelConfig {
            dial_timeout: self.timeouts.dial_timeout,
            handshake_timeout: self.timeouts.handshake_timeout,
            write_timeout: self.timeouts.write_timeout,
            buffer_size: self.buffer_size,
        }
    }

    pub fn apply(&mut self, o: &Overrides) -> anyhow::Result<()> {
        if let Some(v) = &o.listen_addr {
            self.listen_addr = v.trim().to_string();
        }
        if let Some(v) = &o.url {
            self.url = normalize_url(v)?;
        }
        if let Some(v) = o.dial_timeout {
            self.timeouts.dial_timeout = v;
        }
        if let Some(v) = o.handshake_timeout {
            self.timeouts.handshake_timeout = v;
        }
        if let Some(v) = o.write_timeout {
            self.timeouts.write_timeout = v;
        }
        if let Some(v) = &o.log_output {
            self.logging.output = v.trim().to_string();
        }
        if let Some(v) = &o.log_level {
            self.logging.level = normalize_level(v)?;
        }
        Ok(())
    }

    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let t = fc.timeouts.unwrap_or_default();
        let mut cfg = Config {
            listen_addr: fc.listen_addr.unwrap_or_default().trim().to_string(),
            url: "proxy".into(),
            admin_addr: fc.admin_addr.trim().to_string(),
            buffer_size: fc.buffer_size.max(0) as usize,
            timeouts: Timeouts {
                dial_timeout: millis_or_default(t.dial_timeout_ms),
                handshake_timeout: millis_or_default(t.handshake_timeout_ms),
                write_timeout: millis_or_default(t.write_timeout_ms),
            },
            logging: LoggingConfig {
                level: "info".into(),
                format: "text".into(),
                output: "stdout".into(),
                add_source: false,
            },
        };

        if cfg.listen_addr.is_empty() {
            cfg.listen_addr = "127.0.0.1:8086".into();
        }
        if cfg.buffer_size == 0 {
            cfg.buffer_size = DEFAULT_BUFFER_SIZE;
        }
        if let Some(url) = &fc.url {
            cfg.url = normalize_url(url).context("config: invalid url")?;
        }

        if let Some(l) = &fc.logging {
            if let Some(level) = l.level.as_deref().filter(|s| !s.trim().is_empty()) {
                cfg.logging.level = normalize_level(level)?;
            }
            if let Some(fmt) = l.format.as_deref().filter(|s| !s.trim().is_empty()) {
                let fmt = fmt.trim().to_ascii_lowercase();
                if fmt != "text" && fmt != "json" {
                    anyhow::bail!("config: logging.format must be text or json, got {fmt:?}");
                }
                cfg.logging.format = fmt;
            }
            if let Some(out) = l.output.as_deref().filter(|s| !s.trim().is_empty()) {
                cfg.logging.output = out.trim().to_string();
            }
            cfg.logging.add_source = l.add_source;
        }

        Ok(cfg)
    }
}

fn millis_or_default(ms: Option<i64>) -> Duration {
    match ms.unwrap_or(0) {
        n if n > 0 => Duration::from_millis(n as u64),
        _ => Duration::from_secs(10),
    }
}

/// The tunnel route prefix, without surrounding slashes.
pub fn normalize_url(s: &str) -> anyhow::Result<String> {
    let out = s.trim().trim_matches('/').to_string();
    if out.is_empty() {
        anyhow::bail!("url must not be empty");
    }
    if out.contains('{') || out.contains('}') || out.contains('*') {
        anyhow::bail!("url must be a plain path, got {out:?}");
    }
    Ok(out)
}

pub fn normalize_level(s: &str) -> anyhow::Result<String> {
    let level = s.trim().to_ascii_lowercase();
    match level.as_str() {
        "debug" | "info" | "warn" | "error" => Ok(level),
        _ => anyhow::bail!("unknown log level {s:?} (expected debug|info|warn|error)"),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    listen_addr: Option<String>,

    url: Option<String>,

    #[serde(default)]
    admin_addr: String,

    #[serde(default)]
    buffer_size: i64,

    timeouts: Option<FileTimeouts>,

    logging: Option<FileLogging>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTimeouts {
    dial_timeout_ms: Option<i64>,
    handshake_timeout_ms: Option<i64>,
    write_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}
