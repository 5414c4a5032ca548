//! Configuration snapshot and parser.
//!
//! The config is INI-style text: a `[general]` section followed by one
//! numeric section per node. Within a node section, reserved keys set
//! node options; every other `name=password[,flag...]` line declares a
//! client bound to that node.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;

use voter_proto::{crc32_bufs, FRAME_SIZE};

use crate::error::ConfigError;

/// Default UDP listen port.
pub const DEFAULT_PORT: u16 = 1667;

/// Default buffer length in milliseconds.
pub const DEFAULT_BUFLEN_MS: u32 = 480;

/// Default sticky-winner linger, in 20 ms ticks.
pub const DEFAULT_LINGER: u16 = 6;

/// Maximum outbound status-stream subscribers per node.
pub const MAX_STREAMS: usize = 50;

/// Maximum threshold table entries per node.
pub const MAX_THRESHOLDS: usize = 20;

/// TX carrier turn-off behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxTocType {
    #[default]
    None,
    /// Reverse the CTCSS phase at unkey.
    Phase,
    /// Drop the CTCSS tone while unkeyed.
    NoTone,
}

/// One sticky-winner threshold entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Threshold {
    /// Minimum RSSI for the previous winner to stay selected.
    pub rssi: u8,
    /// Maximum dwell in ticks at this threshold (0 = unlimited).
    pub count: u16,
    /// Linger ticks armed when this threshold stops matching.
    pub linger: u16,
}

/// Primary-server endpoint for a redundant (secondary) node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryConfig {
    pub addr: SocketAddrV4,
    pub password: String,
}

/// Per-client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientConfig {
    pub name: String,
    pub password: String,
    pub transmit: bool,
    pub master: bool,
    pub adpcm: bool,
    pub nulaw: bool,
    pub nodeemp: bool,
    pub noplfilter: bool,
    pub prio: i32,
    pub gpsid: Option<String>,
}

/// Per-node configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub nodenum: u32,
    pub linger: u16,
    pub plfilter: bool,
    pub hostdeemp: bool,
    pub duplex: bool,
    pub mixminus: bool,
    pub isprimary: bool,
    pub streams: Vec<SocketAddrV4>,
    pub txctcss_freq: Option<f32>,
    pub txctcss_level: i32,
    pub txtoctype: TxTocType,
    pub thresholds: Vec<Threshold>,
    pub gtxgain_db: f32,
    pub primary: Option<PrimaryConfig>,
    pub buflen_ms: Option<u32>,
    pub clients: Vec<ClientConfig>,
}

impl NodeConfig {
    pub(crate) fn new(nodenum: u32) -> Self {
        NodeConfig {
            nodenum,
            linger: DEFAULT_LINGER,
            plfilter: false,
            hostdeemp: false,
            duplex: true,
            mixminus: false,
            isprimary: false,
            streams: Vec::new(),
            txctcss_freq: None,
            txctcss_level: 62,
            txtoctype: TxTocType::None,
            thresholds: Vec::new(),
            gtxgain_db: 0.0,
            primary: None,
            buflen_ms: None,
            clients: Vec::new(),
        }
    }
}

/// `[general]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneralConfig {
    pub port: u16,
    pub bindaddr: Ipv4Addr,
    pub password: String,
    pub buflen_ms: u32,
    pub sanity: bool,
    pub puckit: bool,
    pub utos: bool,
    /// Directory for per-client GPS position files.
    pub gps_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            port: DEFAULT_PORT,
            bindaddr: Ipv4Addr::UNSPECIFIED,
            password: String::new(),
            buflen_ms: DEFAULT_BUFLEN_MS,
            sanity: true,
            puckit: false,
            utos: false,
            gps_dir: "/tmp".to_string(),
        }
    }
}

/// Full configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub general: GeneralConfig,
    pub nodes: Vec<NodeConfig>,
}

fn truthy(v: &str) -> bool {
    matches!(
        v.to_ascii_lowercase().as_str(),
        "yes" | "true" | "y" | "t" | "1" | "on"
    )
}

fn parse_err(line: usize, msg: impl Into<String>) -> ConfigError {
    ConfigError::Parse {
        line,
        msg: msg.into(),
    }
}

/// Split a comma list, honoring double-quoted segments.
fn split_list(value: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut inquo = false;
    for ch in value.chars() {
        match ch {
            '"' => inquo = !inquo,
            ',' if !inquo => {
                out.push(cur.trim().to_string());
                cur = String::new();
            }
            _ => cur.push(ch),
        }
    }
    out.push(cur.trim().to_string());
    out.retain(|s| !s.is_empty());
    out
}

/// Parse `ip[:port]`, defaulting the port.
fn parse_hostport(s: &str, default_port: u16) -> Option<SocketAddrV4> {
    let (ip, port) = match s.split_once(':') {
        Some((ip, port)) => (ip, port.parse().ok()?),
        None => (s, default_port),
    };
    Some(SocketAddrV4::new(ip.parse().ok()?, port))
}

/// Parse one `rssi[=count[:linger]]` threshold entry.
fn parse_threshold(s: &str, default_linger: u16) -> Option<Threshold> {
    let (rssi_s, rest) = match s.split_once('=') {
        Some((r, rest)) => (r, Some(rest)),
        None => (s, None),
    };
    let rssi = rssi_s.trim().parse().ok()?;
    let mut count = 0;
    let mut linger = default_linger;
    if let Some(rest) = rest {
        let (count_s, linger_s) = match rest.split_once(':') {
            Some((c, l)) => (c, Some(l)),
            None => (rest, None),
        };
        if !count_s.trim().is_empty() {
            count = count_s.trim().parse().ok()?;
        }
        if let Some(l) = linger_s {
            if !l.trim().is_empty() {
                linger = l.trim().parse().ok()?;
            }
        }
    }
    Some(Threshold { rssi, count, linger })
}

fn parse_client(name: &str, value: &str, lineno: usize) -> Result<ClientConfig, ConfigError> {
    // The password is the first comma token and must be present.
    if value.split(',').next().unwrap_or("").trim().is_empty() {
        return Err(parse_err(lineno, format!("client {name}: missing password")));
    }
    let parts = split_list(value);
    let mut c = ClientConfig {
        name: name.to_string(),
        password: parts[0].clone(),
        ..Default::default()
    };
    for flag in &parts[1..] {
        let lower = flag.to_ascii_lowercase();
        if lower == "transmit" {
            c.transmit = true;
        } else if lower == "master" {
            c.master = true;
        } else if lower == "adpcm" {
            c.adpcm = true;
        } else if lower == "nulaw" {
            c.nulaw = true;
        } else if lower == "nodeemp" {
            c.nodeemp = true;
        } else if lower == "noplfilter" {
            c.noplfilter = true;
        } else if let Some(rest) = lower.strip_prefix("gpsid") {
            c.gpsid = Some(match rest.strip_prefix('=') {
                Some(id) => format!("_{id}"),
                None => String::new(),
            });
        } else if let Some(rest) = lower.strip_prefix("prio") {
            let v: i32 = rest
                .strip_prefix('=')
                .and_then(|s| s.trim().parse().ok())
                .ok_or_else(|| parse_err(lineno, format!("client {name}: bad prio")))?;
            c.prio = if v < -1 { 0 } else { v };
        } else {
            return Err(parse_err(lineno, format!("client {name}: unknown flag {flag}")));
        }
    }
    Ok(c)
}

impl Config {
    /// Load and parse a config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parse config text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut general = GeneralConfig::default();
        let mut nodes: Vec<NodeConfig> = Vec::new();
        let mut section: Option<String> = None;

        for (idx, raw) in text.lines().enumerate() {
            let lineno = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[') {
                let name = name
                    .strip_suffix(']')
                    .ok_or_else(|| parse_err(lineno, "unterminated section header"))?;
                let name = name.trim().to_string();
                if name != "general" {
                    let nodenum: u32 = name
                        .parse()
                        .map_err(|_| parse_err(lineno, format!("section [{name}] is not a node number")))?;
                    if nodenum == 0 {
                        return Err(parse_err(lineno, "node number must be non-zero"));
                    }
                    if !nodes.iter().any(|n| n.nodenum == nodenum) {
                        nodes.push(NodeConfig::new(nodenum));
                    }
                }
                section = Some(name);
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| parse_err(lineno, "expected key=value"))?;
            let key = key.trim();
            let value = value.trim();
            match section.as_deref() {
                None => return Err(parse_err(lineno, "key outside any section")),
                Some("general") => Self::apply_general(&mut general, key, value, lineno)?,
                Some(node_name) => {
                    let nodenum: u32 = node_name.parse().unwrap();
                    let port = general.port;
                    let node = nodes.iter_mut().find(|n| n.nodenum == nodenum).unwrap();
                    Self::apply_node(node, key, value, lineno, port)?;
                }
            }
        }

        let cfg = Config { general, nodes };
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_general(
        g: &mut GeneralConfig,
        key: &str,
        value: &str,
        lineno: usize,
    ) -> Result<(), ConfigError> {
        match key {
            "port" => {
                g.port = value
                    .parse()
                    .map_err(|_| parse_err(lineno, "bad port"))?;
            }
            "bindaddr" => {
                g.bindaddr = value
                    .parse()
                    .map_err(|_| parse_err(lineno, "bad bindaddr"))?;
            }
            "password" => g.password = value.to_string(),
            "buflen" => {
                let ms: u32 = value.parse().map_err(|_| parse_err(lineno, "bad buflen"))?;
                g.buflen_ms = ms.max(40);
            }
            "sanity" => g.sanity = truthy(value),
            "puckit" => g.puckit = truthy(value),
            "utos" => g.utos = truthy(value),
            "gpsdir" => g.gps_dir = value.to_string(),
            // The host framework's dialplan context; not used by the engine.
            "context" => {}
            _ => return Err(parse_err(lineno, format!("unknown general key {key}"))),
        }
        Ok(())
    }

    fn apply_node(
        node: &mut NodeConfig,
        key: &str,
        value: &str,
        lineno: usize,
        listen_port: u16,
    ) -> Result<(), ConfigError> {
        match key {
            "linger" => {
                node.linger = value.parse().map_err(|_| parse_err(lineno, "bad linger"))?;
            }
            "plfilter" => node.plfilter = truthy(value),
            "hostdeemp" => node.hostdeemp = truthy(value),
            "duplex" => node.duplex = truthy(value),
            "mixminus" => node.mixminus = truthy(value),
            "isprimary" => node.isprimary = truthy(value),
            "streams" => {
                node.streams = split_list(value)
                    .iter()
                    .take(MAX_STREAMS)
                    .filter_map(|s| parse_hostport(s, listen_port))
                    .collect();
            }
            "txctcss" => {
                node.txctcss_freq = Some(
                    value
                        .parse()
                        .map_err(|_| parse_err(lineno, "bad txctcss frequency"))?,
                );
            }
            "txctcsslevel" => {
                node.txctcss_level = value
                    .parse()
                    .map_err(|_| parse_err(lineno, "bad txctcsslevel"))?;
            }
            "txtoctype" => {
                node.txtoctype = match value.to_ascii_lowercase().as_str() {
                    "phase" => TxTocType::Phase,
                    "notone" => TxTocType::NoTone,
                    _ => TxTocType::None,
                };
            }
            "thresholds" => {
                let default_linger = node.linger;
                node.thresholds = split_list(value)
                    .iter()
                    .take(MAX_THRESHOLDS)
                    .map(|s| {
                        parse_threshold(s, default_linger)
                            .ok_or_else(|| parse_err(lineno, format!("bad threshold {s}")))
                    })
                    .collect::<Result<_, _>>()?;
            }
            "gtxgain" => {
                node.gtxgain_db = value
                    .parse()
                    .map_err(|_| parse_err(lineno, "bad gtxgain"))?;
            }
            "primary" => {
                let parts = split_list(value);
                if parts.len() < 2 {
                    return Err(ConfigError::BadPrimary(node.nodenum));
                }
                let addr = parse_hostport(&parts[0], listen_port)
                    .ok_or(ConfigError::BadPrimary(node.nodenum))?;
                node.primary = Some(PrimaryConfig {
                    addr,
                    password: parts[1].clone(),
                });
            }
            "buflen" => {
                let ms: u32 = value.parse().map_err(|_| parse_err(lineno, "bad buflen"))?;
                node.buflen_ms = Some(ms.max(40));
            }
            name => {
                node.clients.push(parse_client(name, value, lineno)?);
            }
        }
        Ok(())
    }

    /// Buffer length in samples for a node, rounded down to a whole number
    /// of 40 ms drain pairs.
    pub fn buflen_samples(&self, node: &NodeConfig) -> usize {
        let ms = node.buflen_ms.unwrap_or(self.general.buflen_ms).max(40);
        let samples = ms as usize * 8;
        samples - samples % (FRAME_SIZE * 2)
    }

    /// Whether any client anywhere is a master timing source.
    pub fn has_master(&self) -> bool {
        self.nodes
            .iter()
            .any(|n| n.clients.iter().any(|c| c.master))
    }

    /// Validate digests: non-zero and unique across all clients, the
    /// invariant the authentication table depends on.
    fn validate(&self) -> Result<(), ConfigError> {
        // The digest depends on the process challenge, but zero/duplicate
        // detection only needs password identity, so any fixed challenge
        // works here.
        let mut seen: Vec<(u32, &str)> = Vec::new();
        for node in &self.nodes {
            for client in &node.clients {
                let digest = crc32_bufs(b"x", client.password.as_bytes());
                if client.password.is_empty() || digest == 0 {
                    return Err(ConfigError::ZeroDigest(client.name.clone()));
                }
                if let Some((_, other)) = seen.iter().find(|(d, _)| *d == digest) {
                    return Err(ConfigError::DuplicateDigest(
                        other.to_string(),
                        client.name.clone(),
                    ));
                }
                seen.push((digest, &client.name));
            }
        }
        Ok(())
    }
}
