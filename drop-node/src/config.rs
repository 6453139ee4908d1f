//! Load config from file and environment.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::codec::TransferCodec;
use crate::error::{DropError, Result};
use crate::strategy::StrategyKind;

/// Node configuration. File: ~/.config/drop/config.toml or /etc/drop/config.toml.
/// Env overrides: DROP_PORT, DROP_UID, DROP_STRATEGY.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP port served and advertised (default 3000).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Address to bind and advertise; looked up from the routing table when unset.
    #[serde(default)]
    pub ip: Option<Ipv4Addr>,
    /// mDNS service type (default `_drop._tcp.local.`).
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Host suffix; the advertised droplet is `<uid>.<host>`.
    #[serde(default = "default_host")]
    pub host: String,
    /// Instance name. Defaults to the device id of the node's key pair.
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub strategy: StrategyKind,
    #[serde(default)]
    pub codec: TransferCodec,
    /// Run the public-key handshake before authenticating.
    #[serde(default)]
    pub handshake: bool,
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub holepunch: HolePunchSection,
}

/// PEM files. `root_ca` enables TLS when dialing; `cert` + `key` enable it when serving.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub root_ca: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HolePunchSection {
    /// Relay `host:port`.
    pub relay: Option<String>,
    /// Local address punched from (default `0.0.0.0:0`).
    #[serde(default = "default_punch_listen")]
    pub listen: String,
}

impl Default for HolePunchSection {
    fn default() -> Self {
        Self {
            relay: None,
            listen: default_punch_listen(),
        }
    }
}

fn default_port() -> u16 {
    3000
}
fn default_service_name() -> String {
    "_drop._tcp.local.".to_string()
}
fn default_host() -> String {
    "drop.local".to_string()
}
fn default_discovery_timeout() -> u64 {
    5
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_punch_listen() -> String {
    "0.0.0.0:0".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            ip: None,
            service_name: default_service_name(),
            host: default_host(),
            uid: None,
            strategy: StrategyKind::default(),
            codec: TransferCodec::default(),
            handshake: false,
            discovery_timeout_secs: default_discovery_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            tls: TlsConfig::default(),
            holepunch: HolePunchSection::default(),
        }
    }
}

impl Config {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Advertised display host of this node, also the TLS server name peers verify.
    pub fn droplet(&self, uid: &str) -> String {
        format!("{}.{}", uid, self.host)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let c = load_default_file().unwrap_or_default();
    apply_env(c, |k| std::env::var(k).ok())
}

/// Load an explicit config file, then apply env vars. Errors are reported, not skipped.
pub fn load_from(path: &Path) -> Result<Config> {
    let s = std::fs::read_to_string(path).map_err(DropError::fs(path))?;
    let c = parse(&s)?;
    Ok(apply_env(c, |k| std::env::var(k).ok()))
}

pub fn parse(s: &str) -> Result<Config> {
    toml::from_str::<Config>(s).map_err(|e| DropError::Config(e.to_string()))
}

fn apply_env(mut c: Config, var: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(s) = var("DROP_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.port = p;
        }
    }
    if let Some(s) = var("DROP_UID") {
        if !s.is_empty() {
            c.uid = Some(s);
        }
    }
    if let Some(s) = var("DROP_STRATEGY") {
        if let Ok(kind) = s.parse::<StrategyKind>() {
            c.strategy = kind;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/drop/config.toml"));
    }
    out.push(PathBuf::from("/etc/drop/config.toml"));
    out
}

fn load_default_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map_err(DropError::fs(&p)).and_then(|s| parse(&s)) {
                Ok(c) => return Some(c),
                Err(e) => tracing::warn!("ignoring {}: {}", p.display(), e),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let c = parse("").unwrap();
        assert_eq!(c.port, 3000);
        assert_eq!(c.service_name, "_drop._tcp.local.");
        assert_eq!(c.strategy, StrategyKind::Mdns);
        assert_eq!(c.codec, TransferCodec::TarGzip);
        assert!(!c.handshake);
        assert_eq!(c.droplet("root"), "root.drop.local");
    }

    #[test]
    fn full_file() {
        let c = parse(
            r#"
            port = 7777
            ip = "192.168.1.20"
            uid = "alice"
            strategy = "tcpholepunch"
            codec = "framed"
            handshake = true

            [tls]
            root_ca = "/etc/drop/ca.pem"

            [holepunch]
            relay = "relay.example:9000"
            "#,
        )
        .unwrap();
        assert_eq!(c.port, 7777);
        assert_eq!(c.ip, Some(Ipv4Addr::new(192, 168, 1, 20)));
        assert_eq!(c.uid.as_deref(), Some("alice"));
        assert_eq!(c.strategy, StrategyKind::TcpHolePunch);
        assert_eq!(c.codec, TransferCodec::Framed);
        assert!(c.handshake);
        assert_eq!(c.tls.root_ca, Some(PathBuf::from("/etc/drop/ca.pem")));
        assert_eq!(c.holepunch.relay.as_deref(), Some("relay.example:9000"));
        assert_eq!(c.holepunch.listen, "0.0.0.0:0");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(parse("colour = \"blue\""), Err(DropError::Config(_))));
        assert!(parse("strategy = \"carrier-pigeon\"").is_err());
    }

    #[test]
    fn env_overrides() {
        let c = apply_env(Config::default(), |k| match k {
            "DROP_PORT" => Some("4100".into()),
            "DROP_UID" => Some("bob".into()),
            "DROP_STRATEGY" => Some("tcpholepunch".into()),
            _ => None,
        });
        assert_eq!(c.port, 4100);
        assert_eq!(c.uid.as_deref(), Some("bob"));
        assert_eq!(c.strategy, StrategyKind::TcpHolePunch);

        let c = apply_env(Config::default(), |k| (k == "DROP_PORT").then(|| "nope".into()));
        assert_eq!(c.port, 3000);
    }
}
