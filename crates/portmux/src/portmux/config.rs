use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use serde::Deserialize;

use crate::portmux::tunnel::info::{TunnelInfo, TunnelKind};

pub const CONFIG_ENV: &str = "PORTMUX_CONFIG";

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
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

/// Precedence: `--config`, then `PORTMUX_CONFIG`, then `portmux.*` in the
/// working directory, then the OS default location.
pub fn resolve_config_path(explicit_flag_path: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        // clap fills the flag from the env var too; report which one it was.
        let from_env = std::env::var_os(CONFIG_ENV).is_some_and(|v| v == p.as_os_str());
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: if from_env {
                ConfigPathSource::Env
            } else {
                ConfigPathSource::Flag
            },
        });
    }

    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: normalize_explicit_path(Path::new(&p))?,
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

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            return Ok(discover_config_path(p).unwrap_or_else(|| p.join("portmux.toml")));
        }
        return Ok(p.to_path_buf());
    }

    // Not there yet: it will be created, as TOML unless told otherwise.
    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    ["portmux.toml", "portmux.yaml", "portmux.yml"]
        .into_iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).is_ok_and(|m| m.is_file()))
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/portmux/portmux.toml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("io", "portmux", "portmux").context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("portmux.toml"))
    }
}

/// Write the default template to `path` if nothing is there. Returns whether
/// a file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!("config: {} exists but is not a regular file", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn config_ext(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    match config_ext(path).as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let fc: FileConfig = match config_ext(path).as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?,
        ext => anyhow::bail!("config: unsupported config extension {ext}"),
    };

    Config::from_file_config(fc).with_context(|| format!("config: {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Empty disables the admin HTTP server.
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub tunnels: Vec<TunnelInfo>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub valid_keys: Vec<String>,
    pub handshake_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub auth_key: String,
    pub dial_timeout: Duration,
    pub heartbeat_interval: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,
    logging: Option<FileLogging>,
    server: Option<FileServer>,
    client: Option<FileClient>,
    #[serde(default)]
    tunnels: Vec<FileTunnel>,
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

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServer {
    listen_addr: Option<String>,
    #[serde(default)]
    valid_keys: Vec<String>,
    handshake_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    server_addr: Option<String>,
    auth_key: Option<String>,
    dial_timeout_ms: Option<i64>,
    heartbeat_interval_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTunnel {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    target_addr: String,
    target_port: u16,
    source_port: u16,
    /// Seconds; UDP only.
    #[serde(default)]
    timeout: u64,
    #[serde(default)]
    local: bool,
}

fn non_empty(v: Option<&String>) -> Option<String> {
    v.map(|s| s.trim()).filter(|s| !s.is_empty()).map(str::to_string)
}

fn millis(v: Option<i64>, default_ms: u64) -> Duration {
    Duration::from_millis(v.map(|ms| ms.max(0) as u64).unwrap_or(default_ms))
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config {
            admin_addr: fc.admin_addr.trim().to_string(),
            logging: LoggingConfig {
                level: "info".into(),
                format: "json".into(),
                output: "stderr".into(),
                add_source: false,
            },
            server: ServerConfig {
                listen_addr: ":7666".into(),
                valid_keys: vec![],
                handshake_timeout: Duration::from_millis(5000),
            },
            client: ClientConfig {
                server_addr: "127.0.0.1:7666".into(),
                auth_key: String::new(),
                dial_timeout: Duration::from_millis(5000),
                heartbeat_interval: Duration::from_millis(1000),
            },
            tunnels: Vec::with_capacity(fc.tunnels.len()),
        };

        if let Some(l) = &fc.logging {
            if let Some(level) = non_empty(l.level.as_ref()) {
                cfg.logging.level = level;
            }
            if let Some(format) = non_empty(l.format.as_ref()) {
                cfg.logging.format = format;
            }
            if let Some(output) = non_empty(l.output.as_ref()) {
                cfg.logging.output = output;
            }
            cfg.logging.add_source = l.add_source;
        }

        if let Some(s) = &fc.server {
            if let Some(addr) = non_empty(s.listen_addr.as_ref()) {
                cfg.server.listen_addr = addr;
            }
            cfg.server.valid_keys = s
                .valid_keys
                .iter()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect();
            cfg.server.handshake_timeout = millis(s.handshake_timeout_ms, 5000);
        }

        if let Some(c) = &fc.client {
            if let Some(addr) = non_empty(c.server_addr.as_ref()) {
                cfg.client.server_addr = addr;
            }
            cfg.client.auth_key = c.auth_key.clone().unwrap_or_default();
            cfg.client.dial_timeout = millis(c.dial_timeout_ms, 5000);
            cfg.client.heartbeat_interval = millis(c.heartbeat_interval_ms, 1000);
        }

        for (i, t) in fc.tunnels.iter().enumerate() {
            let Some(kind) = TunnelKind::parse(&t.kind) else {
                anyhow::bail!("tunnels[{i}]: unknown type {:?} (expected tcp or udp)", t.kind);
            };
            if t.target_port == 0 {
                anyhow::bail!("tunnels[{i}]: target_port is required");
            }
            let target_addr = match t.target_addr.trim() {
                "" => "127.0.0.1",
                a => a,
            };
            let mut info = TunnelInfo::new(kind, target_addr, t.target_port, t.source_port).with_timeout(t.timeout);
            if t.local {
                info = info.local();
            }
            if let Some(dup) = cfg.tunnels.iter().find(|o| o.tunnel_id == info.tunnel_id) {
                anyhow::bail!(
                    "tunnels[{i}]: duplicate of {} {} -> {}",
                    dup.kind,
                    dup.source_port,
                    dup.target()
                );
            }
            cfg.tunnels.push(info);
        }

        Ok(cfg)
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# portmux configuration (auto-generated)
#
# This file was created because portmux could not find a configuration file at
# the resolved config path.
#
# `portmux server` accepts clients on [server].listen_addr.
# `portmux client` connects to [client].server_addr and asks the server to open
# every [[tunnels]] entry's source_port, forwarding connections back to
# target_addr:target_port as seen from the client. Entries with local = true are
# forwarded by the client itself and never sent to the server.

admin_addr = ""

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false

[server]
listen_addr = ":7666"
valid_keys = []
handshake_timeout_ms = 5000

[client]
server_addr = "127.0.0.1:7666"
auth_key = ""
dial_timeout_ms = 5000
heartbeat_interval_ms = 1000

# [[tunnels]]
# type = "tcp"          # tcp | udp
# target_addr = "127.0.0.1"
# target_port = 22
# source_port = 2222
# timeout = 0           # udp session idle timeout in seconds, 0 = never
# local = false
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# portmux configuration (auto-generated)
#
# This file was created because portmux could not find a configuration file at
# the resolved config path.
#
# `portmux server` accepts clients on server.listen_addr.
# `portmux client` connects to client.server_addr and asks the server to open
# every tunnels entry's source_port, forwarding connections back to
# target_addr:target_port as seen from the client. Entries with local: true are
# forwarded by the client itself and never sent to the server.

admin_addr: ""

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false

server:
  listen_addr: ":7666"
  valid_keys: []
  handshake_timeout_ms: 5000

client:
  server_addr: "127.0.0.1:7666"
  auth_key: ""
  dial_timeout_ms: 5000
  heartbeat_interval_ms: 1000

tunnels: []
# tunnels:
#   - type: "tcp"         # tcp | udp
#     target_addr: "127.0.0.1"
#     target_port: 22
#     source_port: 2222
#     timeout: 0          # udp session idle timeout in seconds, 0 = never
#     local: false
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!("portmux_cfg_test_{name}_{}_{}", std::process::id(), now));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn generated_templates_load_with_defaults() {
        let dir = temp_dir("templates");
        for name in ["portmux.toml", "portmux.yaml", "nested/portmux.yml"] {
            let path = dir.join(name);
            assert!(ensure_config_file(&path).expect("create"));
            assert!(!ensure_config_file(&path).expect("exists"));

            let cfg = load_config(&path).expect("load_config");
            assert_eq!(cfg.server.listen_addr, ":7666");
            assert_eq!(cfg.server.handshake_timeout, Duration::from_millis(5000));
            assert_eq!(cfg.client.server_addr, "127.0.0.1:7666");
            assert_eq!(cfg.client.heartbeat_interval, Duration::from_millis(1000));
            assert_eq!(cfg.logging.level, "info");
            assert!(cfg.admin_addr.is_empty());
            assert!(cfg.tunnels.is_empty());
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn tunnels_are_parsed_into_rules() {
        let dir = temp_dir("tunnels");
        let cfg_path = dir.join("portmux.toml");

        let toml = r#"
[server]
valid_keys = [" k1 ", ""]

[client]
auth_key = "k1"

[[tunnels]]
type = "UDP"
target_addr = "10.0.0.2"
target_port = 53
source_port = 5353
timeout = 30

[[tunnels]]
target_port = 80
source_port = 8080
local = true
"#;
        std::fs::write(&cfg_path, toml).expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");

        assert_eq!(cfg.server.valid_keys, vec!["k1".to_string()]);
        assert_eq!(cfg.tunnels.len(), 2);

        let udp = &cfg.tunnels[0];
        assert_eq!(udp.kind, TunnelKind::Udp);
        assert_eq!(udp.target(), "10.0.0.2:53");
        assert_eq!(udp.timeout, 30);
        assert_eq!(udp.tunnel_id, udp.compute_id());
        assert!(!udp.is_local_tunnel);

        let tcp = &cfg.tunnels[1];
        assert_eq!(tcp.kind, TunnelKind::Tcp);
        assert_eq!(tcp.target(), "127.0.0.1:80");
        assert!(tcp.is_local_tunnel);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn yaml_tunnels_are_accepted() {
        let dir = temp_dir("yaml");
        let cfg_path = dir.join("portmux.yaml");
        let yaml = r#"
client:
  server_addr: "example.net:7666"
tunnels:
  - type: tcp
    target_port: 22
    source_port: 2222
"#;
        std::fs::write(&cfg_path, yaml).expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.client.server_addr, "example.net:7666");
        assert_eq!(cfg.tunnels[0].source_port, 2222);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn bad_tunnels_are_rejected() {
        let dir = temp_dir("bad");
        let cfg_path = dir.join("portmux.toml");

        for (toml, needle) in [
            ("[[tunnels]]\ntype = \"sctp\"\ntarget_port = 1\nsource_port = 2\n", "unknown type"),
            ("[[tunnels]]\ntarget_port = 0\nsource_port = 2\n", "target_port"),
            (
                "[[tunnels]]\ntarget_port = 1\nsource_port = 2\n[[tunnels]]\ntarget_port = 1\nsource_port = 2\n",
                "duplicate",
            ),
            ("[[tunnels]]\ntarget_port = 70000\nsource_port = 2\n", "parse toml"),
        ] {
            std::fs::write(&cfg_path, toml).expect("write");
            let err = load_config(&cfg_path).unwrap_err();
            let msg = format!("{err:#}");
            assert!(msg.contains(needle), "expected {needle:?} in {msg}");
        }

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let dir = temp_dir("unknown");
        let cfg_path = dir.join("portmux.toml");
        std::fs::write(&cfg_path, "[server]\nlisten = \":1\"\n").expect("write");
        let msg = format!("{:#}", load_config(&cfg_path).unwrap_err());
        assert!(msg.contains("listen"), "got: {msg}");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn explicit_directory_resolves_to_config_inside() {
        let dir = temp_dir("explicit_dir");
        assert_eq!(normalize_explicit_path(&dir).unwrap(), dir.join("portmux.toml"));

        std::fs::write(dir.join("portmux.yml"), "").expect("write");
        assert_eq!(normalize_explicit_path(&dir).unwrap(), dir.join("portmux.yml"));

        let bare = dir.join("custom");
        assert_eq!(normalize_explicit_path(&bare).unwrap(), dir.join("custom.toml"));

        assert!(normalize_explicit_path(Path::new("")).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let dir = temp_dir("ext");
        assert!(ensure_config_file(&dir.join("portmux.ini")).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
