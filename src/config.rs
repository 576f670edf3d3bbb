//! Configuration loading and management.
//!
//! Read at startup; the control-plane tables (G-lines, jupes) are not
//! in here because they are reconstructed from peers via burst. Seed
//! jupes and channel quarantines are, because they are policy.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// This server's identity.
    pub server: ServerConfig,
    /// Listening sockets.
    pub listen: Vec<ListenConfig>,
    /// Optional TLS material for `tls = true` listeners.
    pub tls: Option<TlsConfig>,
    /// Connection classes referenced by client and link blocks.
    #[serde(default)]
    pub class: Vec<ClassBlock>,
    /// Client allow blocks (host/IP pattern to class).
    #[serde(default)]
    pub client: Vec<ClientBlock>,
    /// Operator blocks.
    #[serde(default)]
    pub oper: Vec<OperBlock>,
    /// Peer link blocks.
    #[serde(default)]
    pub link: Vec<LinkBlock>,
    /// Seed jupes installed at startup.
    #[serde(default)]
    pub jupe: Vec<JupeBlock>,
    /// Channel quarantines (BADCHAN seeds).
    #[serde(default)]
    pub quarantine: Vec<QuarantineBlock>,
    /// Trusted WEBIRC gateways.
    #[serde(default)]
    pub webirc: Vec<WebircBlock>,
    /// Feature key/value pairs.
    #[serde(default)]
    pub features: HashMap<String, String>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

/// `[server]` block.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Server name, unique and DNS-shaped.
    pub name: String,
    /// The 2-character-numnick value (0..4095) assigned by the network.
    pub numeric: u16,
    /// Free-form description shown to peers.
    pub description: String,
    /// Whether this server may have more than one server link.
    #[serde(default)]
    pub hub: bool,
    /// Path to the PID file.
    #[serde(default = "default_pidfile")]
    pub pidfile: String,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_pidfile() -> String {
    "tenthd.pid".to_string()
}

/// One listening socket.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    /// Bind address, e.g. `0.0.0.0:6667`.
    pub addr: String,
    /// What connects here: `client`, `server` or `webirc`.
    #[serde(default)]
    pub kind: PortKind,
    /// Wrap accepted sockets in TLS (requires `[tls]`).
    #[serde(default)]
    pub tls: bool,
}

/// Kind of a listening port, marking the initial connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    #[default]
    Client,
    Server,
    Webirc,
}

/// `[tls]` block.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate chain.
    pub cert: String,
    /// PEM private key.
    pub key: String,
}

/// `[[class]]` block: shared connection parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassBlock {
    pub name: String,
    /// Seconds of silence before a PING probe; twice this exits.
    #[serde(default = "default_ping_freq")]
    pub ping_freq: i64,
    /// Seconds between automatic connect attempts for links.
    #[serde(default = "default_connect_freq")]
    pub connect_freq: i64,
    /// Connections admitted in this class.
    #[serde(default = "default_max_links")]
    pub max_links: u32,
    /// Outbound queue cap in bytes.
    #[serde(default = "default_sendq")]
    pub max_sendq: usize,
}

fn default_ping_freq() -> i64 {
    90
}

fn default_connect_freq() -> i64 {
    600
}

fn default_max_links() -> u32 {
    400
}

fn default_sendq() -> usize {
    40_960
}

impl ClassBlock {
    /// The built-in class used when nothing matches.
    pub fn fallback() -> Self {
        ClassBlock {
            name: "default".to_string(),
            ping_freq: default_ping_freq(),
            connect_freq: default_connect_freq(),
            max_links: default_max_links(),
            max_sendq: default_sendq(),
        }
    }
}

/// `[[client]]` block: who may connect as a user.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientBlock {
    /// Hostname pattern (`*` and `?`).
    #[serde(default = "default_any")]
    pub host: String,
    /// IP pattern, wildcard or CIDR.
    #[serde(default = "default_any")]
    pub ip: String,
    /// Class name.
    pub class: String,
}

fn default_any() -> String {
    "*".to_string()
}

/// `[[oper]]` block.
#[derive(Debug, Clone, Deserialize)]
pub struct OperBlock {
    pub name: String,
    pub password: String,
    /// Privilege names: `kill`, `gline`, `jupe`, `opmode`, `squit`,
    /// `settime`, `wide_gline`, `local`.
    #[serde(default)]
    pub privileges: Vec<String>,
}

/// `[[link]]` block: a configured peer.
#[derive(Debug, Clone, Deserialize)]
pub struct LinkBlock {
    /// Peer server name.
    pub name: String,
    /// Shared link password.
    pub password: String,
    /// Peer host for outgoing connects.
    pub host: String,
    /// Peer port for outgoing connects.
    pub port: u16,
    /// Class name.
    pub class: String,
    /// Dial this peer automatically.
    #[serde(default)]
    pub autoconnect: bool,
    /// Peer is allowed to introduce further servers.
    #[serde(default)]
    pub hub: bool,
}

/// `[[jupe]]` seed block.
#[derive(Debug, Clone, Deserialize)]
pub struct JupeBlock {
    /// Server-name mask.
    pub mask: String,
    pub reason: String,
}

/// `[[quarantine]]` block: a channel closed by policy.
#[derive(Debug, Clone, Deserialize)]
pub struct QuarantineBlock {
    pub channel: String,
    pub reason: String,
}

/// `[[webirc]]` block: a trusted gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct WebircBlock {
    pub password: String,
    /// Host pattern the gateway must connect from.
    #[serde(default = "default_any")]
    pub host: String,
}

/// Typed view of the `[features]` table with network defaults.
#[derive(Debug, Clone)]
pub struct Features {
    /// Seconds an unregistered connection may idle before exit.
    pub connect_timeout: i64,
    /// Peer parse errors tolerated before the link is SQUIT.
    pub max_violations: u32,
    /// User lines per ten-second window before "Excess Flood".
    pub client_flood: u32,
    /// Registered-user cap.
    pub maxclients: usize,
    /// File-descriptor-bound connection cap.
    pub maxconnections: usize,
    /// Oldest timestamp accepted from the network.
    pub oldest_ts: i64,
}

impl Default for Features {
    fn default() -> Self {
        Features {
            connect_timeout: 90,
            max_violations: 5,
            client_flood: 30,
            maxclients: 4096,
            maxconnections: 8192,
            oldest_ts: 780_000_000,
        }
    }
}

impl Features {
    /// Build from the raw `[features]` table; unknown keys are ignored
    /// with a warning so configs survive version skew.
    pub fn from_table(table: &HashMap<String, String>) -> Self {
        let mut f = Features::default();
        for (key, value) in table {
            let parsed = match key.as_str() {
                "CONNECTTIMEOUT" => value.parse().map(|v| f.connect_timeout = v).is_ok(),
                "MAX_VIOLATIONS" => value.parse().map(|v| f.max_violations = v).is_ok(),
                "CLIENT_FLOOD" => value.parse().map(|v| f.client_flood = v).is_ok(),
                "MAXCLIENTS" => value.parse().map(|v| f.maxclients = v).is_ok(),
                "MAXCONNECTIONS" => value.parse().map(|v| f.maxconnections = v).is_ok(),
                "OLDEST_TS" => value.parse().map(|v| f.oldest_ts = v).is_ok(),
                _ => {
                    tracing::warn!(feature = %key, "unknown feature key ignored");
                    true
                }
            };
            if !parsed {
                tracing::warn!(feature = %key, value = %value, "bad feature value ignored");
            }
        }
        f
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.name.is_empty() || !self.server.name.contains('.') {
            return Err(ConfigError::Invalid(format!(
                "server name {:?} is not DNS-shaped",
                self.server.name
            )));
        }
        if self.server.numeric > 4095 {
            return Err(ConfigError::Invalid(format!(
                "server numeric {} out of range 0..4095",
                self.server.numeric
            )));
        }
        if self.listen.is_empty() {
            return Err(ConfigError::Invalid("no listen blocks".to_string()));
        }
        if self.listen.iter().any(|l| l.tls) && self.tls.is_none() {
            return Err(ConfigError::Invalid(
                "tls listener configured without a [tls] block".to_string(),
            ));
        }
        for block in &self.client {
            if self.find_class(&block.class).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "client block references unknown class {:?}",
                    block.class
                )));
            }
        }
        for link in &self.link {
            if self.find_class(&link.class).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "link {:?} references unknown class {:?}",
                    link.name, link.class
                )));
            }
        }
        Ok(())
    }

    /// Class by name.
    pub fn find_class(&self, name: &str) -> Option<&ClassBlock> {
        self.class.iter().find(|c| c.name == name)
    }

    /// Link block for a peer name (case-insensitive, exact).
    pub fn find_link(&self, name: &str) -> Option<&LinkBlock> {
        self.link
            .iter()
            .find(|l| tenth_proto::irc_eq(&l.name, name))
    }

    /// The class a new client connection falls into.
    pub fn class_for_client(&self, host: &str, ip: &str) -> ClassBlock {
        for block in &self.client {
            if tenth_proto::match_mask(&block.host, host)
                && (tenth_proto::match_mask(&block.ip, ip)
                    || ip
                        .parse()
                        .ok()
                        .and_then(|addr| tenth_proto::match_cidr(&block.ip, addr))
                        .unwrap_or(false))
            {
                if let Some(class) = self.find_class(&block.class) {
                    return class.clone();
                }
            }
        }
        ClassBlock::fallback()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample() -> &'static str {
        r##"
            [server]
            name = "hub.example.net"
            numeric = 1
            description = "Test hub"
            hub = true

            [[listen]]
            addr = "127.0.0.1:6667"

            [[listen]]
            addr = "127.0.0.1:4400"
            kind = "server"

            [[class]]
            name = "users"
            ping_freq = 120

            [[class]]
            name = "links"
            max_sendq = 9000000

            [[client]]
            host = "*"
            ip = "*"
            class = "users"

            [[link]]
            name = "leaf.example.net"
            password = "linkpw"
            host = "127.0.0.1"
            port = 4400
            class = "links"
            autoconnect = true

            [[jupe]]
            mask = "evil.example.net"
            reason = "compromised"

            [[quarantine]]
            channel = "#badness"
            reason = "closed by policy"

            [features]
            CLIENT_FLOOD = "50"
            NO_SUCH_KEY = "1"
        "##
    }

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_sample() {
        let file = write_config(sample());
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.name, "hub.example.net");
        assert_eq!(config.listen.len(), 2);
        assert_eq!(config.listen[1].kind, PortKind::Server);
        assert!(config.find_link("LEAF.example.net").is_some());
        assert_eq!(config.class_for_client("host.tld", "10.0.0.1").name, "users");
    }

    #[test]
    fn test_features_table() {
        let file = write_config(sample());
        let config = Config::load(file.path()).unwrap();
        let features = Features::from_table(&config.features);
        assert_eq!(features.client_flood, 50);
        // unknown key ignored, defaults intact
        assert_eq!(features.connect_timeout, 90);
    }

    #[test]
    fn test_validate_rejects_bad_numeric() {
        let bad = sample().replace("numeric = 1", "numeric = 9999");
        let file = write_config(&bad);
        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_validate_rejects_unknown_class() {
        let bad = sample().replace("class = \"users\"", "class = \"missing\"");
        let file = write_config(&bad);
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_fallback_class_when_no_match() {
        let trimmed = sample().replace("host = \"*\"", "host = \"*.nowhere.example\"");
        let file = write_config(&trimmed);
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.class_for_client("host.tld", "10.0.0.1").name, "default");
    }
}
