use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroUsize;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};
use serde::Deserialize;
use serde_with::{DisplayFromStr, Map, serde_as};
use thiserror::Error;

use crate::router::{Backend, PortRouter};

const DEFAULT_MONITOR_PORT: u16 = 9090;
const WORKERS_PER_CPU: usize = 4;

/// Every setting is read from the flag first and the environment second. Presence is checked by
/// [`load_config`] so that all defects surface as a [`ConfigError`].
#[derive(Debug, Default, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Control plane host. A leading http:// or https:// selects the scheme (default http).
    #[arg(long, env = "CONTROL_PLANE_HOST")]
    pub control_plane_host: Option<String>,

    /// Control plane port.
    #[arg(long, env = "CONTROL_PLANE_PORT")]
    pub control_plane_port: Option<String>,

    /// Bearer token attached to every telemetry push.
    #[arg(long, env = "BACKEND_API_TOKEN", hide_env_values = true)]
    pub backend_api_token: Option<String>,

    /// Bearer token required by the monitoring API.
    #[arg(long, env = "MONITOR_API_TOKEN", hide_env_values = true)]
    pub monitor_api_token: Option<String>,

    /// JSON port map.
    ///
    /// Example: {"9443": ["10.0.0.5", 443], "2222": ["bastion.internal", 22]}
    #[arg(long, env = "PORT_MAP")]
    pub port_map: Option<String>,

    /// Address the forwarding listeners bind to (default 0.0.0.0).
    #[arg(long, env = "LISTEN_HOST")]
    pub listen_host: Option<String>,

    /// Address the monitoring API binds to (default 127.0.0.1).
    #[arg(long, env = "MONITOR_HOST")]
    pub monitor_host: Option<String>,

    /// Port of the monitoring API (default 9090).
    #[arg(long, env = "MONITOR_PORT")]
    pub monitor_port: Option<String>,

    /// Accept workers per listen port (default: available cores * 4).
    #[arg(long, env = "WORKERS_PER_PORT")]
    pub workers_per_port: Option<String>,

    /// Override log level (e.g. info, debug, trace).
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Emit logs as JSON lines. Accepts 1/0, true/false, yes/no and on/off.
    #[arg(
        long,
        env = "LOG_JSON",
        action = ArgAction::Set,
        num_args = 0..=1,
        default_value_t = false,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("PORT_MAP must be a JSON object of \"<port>\": [\"<host>\", <port>] entries: {0}")]
    PortMapSyntax(#[source] serde_json::Error),
    #[error("PORT_MAP has no entries")]
    EmptyPortMap,
    #[error("PORT_MAP lists listen port {0} more than once")]
    DuplicatePort(u16),
    #[error("PORT_MAP entry {0} has an empty backend host")]
    EmptyHost(u16),
    #[error("{field} {value} is outside 1-65535")]
    PortOutOfRange { field: String, value: i64 },
    #[error("invalid {field}: {value:?}")]
    InvalidValue { field: &'static str, value: String },
}

/// Validated runtime configuration.
#[derive(Clone)]
pub struct Config {
    pub control_plane_url: String,
    pub backend_api_token: String,
    pub monitor_api_token: String,
    pub router: PortRouter,
    pub listen_host: IpAddr,
    pub monitor_addr: SocketAddr,
    pub workers_per_port: usize,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("control_plane_url", &self.control_plane_url)
            .field("backend_api_token", &"<redacted>")
            .field("monitor_api_token", &"<redacted>")
            .field("router", &self.router)
            .field("listen_host", &self.listen_host)
            .field("monitor_addr", &self.monitor_addr)
            .field("workers_per_port", &self.workers_per_port)
            .finish()
    }
}

#[serde_as]
#[derive(Deserialize)]
struct RawPortMap(#[serde_as(as = "Map<DisplayFromStr, _>")] Vec<(i64, (String, i64))>);

pub fn load_config(cli: &Cli) -> Result<Config, ConfigError> {
    let host = required(&cli.control_plane_host, "CONTROL_PLANE_HOST")?;
    let port = parse_port(
        "CONTROL_PLANE_PORT",
        required(&cli.control_plane_port, "CONTROL_PLANE_PORT")?,
    )?;
    let backend_api_token = required(&cli.backend_api_token, "BACKEND_API_TOKEN")?.to_string();
    let monitor_api_token = required(&cli.monitor_api_token, "MONITOR_API_TOKEN")?.to_string();
    let router = parse_port_map(required(&cli.port_map, "PORT_MAP")?)?;

    let listen_host = optional_addr(&cli.listen_host, "LISTEN_HOST", Ipv4Addr::UNSPECIFIED)?;
    let monitor_host = optional_addr(&cli.monitor_host, "MONITOR_HOST", Ipv4Addr::LOCALHOST)?;
    let monitor_port = match non_blank(&cli.monitor_port) {
        Some(raw) => parse_port("MONITOR_PORT", raw)?,
        None => DEFAULT_MONITOR_PORT,
    };
    let workers_per_port = match non_blank(&cli.workers_per_port) {
        Some(raw) => raw
            .parse::<NonZeroUsize>()
            .map_err(|_| ConfigError::InvalidValue {
                field: "WORKERS_PER_PORT",
                value: raw.to_string(),
            })?
            .get(),
        None => default_workers_per_port(),
    };

    Ok(Config {
        control_plane_url: control_plane_url(host, port),
        backend_api_token,
        monitor_api_token,
        router,
        listen_host,
        monitor_addr: SocketAddr::new(monitor_host, monitor_port),
        workers_per_port,
    })
}

/// Decode and validate the JSON port map into a router.
pub fn parse_port_map(raw: &str) -> Result<PortRouter, ConfigError> {
    let RawPortMap(entries) = serde_json::from_str(raw).map_err(ConfigError::PortMapSyntax)?;
    if entries.is_empty() {
        return Err(ConfigError::EmptyPortMap);
    }

    let mut seen = HashSet::with_capacity(entries.len());
    let mut routes = BTreeMap::new();
    for (listen, (host, target)) in entries {
        let listen = check_port("PORT_MAP listen port".to_string(), listen)?;
        let target = check_port(format!("PORT_MAP target port for {listen}"), target)?;
        if !seen.insert(listen) {
            return Err(ConfigError::DuplicatePort(listen));
        }
        let host = host.trim();
        if host.is_empty() {
            return Err(ConfigError::EmptyHost(listen));
        }
        routes.insert(listen, Backend::new(host, target));
    }
    Ok(PortRouter::new(routes))
}

pub fn default_workers_per_port() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
        * WORKERS_PER_CPU
}

fn control_plane_url(host: &str, port: u16) -> String {
    let host = host.trim_end_matches('/');
    let (scheme, host) = if let Some(rest) = host.strip_prefix("https://") {
        ("https", rest)
    } else if let Some(rest) = host.strip_prefix("http://") {
        ("http", rest)
    } else {
        ("http", host)
    };
    if host.contains(':') && !host.starts_with('[') {
        format!("{scheme}://[{host}]:{port}")
    } else {
        format!("{scheme}://{host}:{port}")
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn required<'a>(value: &'a Option<String>, name: &'static str) -> Result<&'a str, ConfigError> {
    non_blank(value).ok_or(ConfigError::Missing(name))
}

fn optional_addr(
    value: &Option<String>,
    field: &'static str,
    default: Ipv4Addr,
) -> Result<IpAddr, ConfigError> {
    match non_blank(value) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            field,
            value: raw.to_string(),
        }),
        None => Ok(IpAddr::V4(default)),
    }
}

fn parse_port(field: &'static str, raw: &str) -> Result<u16, ConfigError> {
    let value = raw.parse::<i64>().map_err(|_| ConfigError::InvalidValue {
        field,
        value: raw.to_string(),
    })?;
    check_port(field.to_string(), value)
}

fn check_port(field: String, value: i64) -> Result<u16, ConfigError> {
    match u16::try_from(value) {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ConfigError::PortOutOfRange { field, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_cli() -> Cli {
        Cli {
            control_plane_host: Some("cp.internal".into()),
            control_plane_port: Some("8000".into()),
            backend_api_token: Some("backend-secret".into()),
            monitor_api_token: Some("monitor-secret".into()),
            port_map: Some(r#"{"9443": ["10.0.0.5", 443]}"#.into()),
            ..Cli::default()
        }
    }

    #[test]
    fn loads_valid_config_with_defaults() {
        let config = load_config(&valid_cli()).unwrap();
        assert_eq!(config.control_plane_url, "http://cp.internal:8000");
        assert_eq!(config.router.route(9443), Some(&Backend::new("10.0.0.5", 443)));
        assert_eq!(config.monitor_addr, "127.0.0.1:9090".parse().unwrap());
        assert_eq!(config.listen_host, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.workers_per_port, default_workers_per_port());
        assert!(config.workers_per_port >= WORKERS_PER_CPU);
    }

    #[test]
    fn debug_output_hides_tokens() {
        let rendered = format!("{:?}", load_config(&valid_cli()).unwrap());
        assert!(!rendered.contains("backend-secret"));
        assert!(!rendered.contains("monitor-secret"));
    }

    #[test]
    fn honours_explicit_scheme() {
        let mut cli = valid_cli();
        cli.control_plane_host = Some("https://cp.example.com/".into());
        assert_eq!(
            load_config(&cli).unwrap().control_plane_url,
            "https://cp.example.com:8000"
        );
    }

    #[test]
    fn missing_settings_are_named() {
        let cases: [(fn(&mut Cli), &str); 5] = [
            (|c| c.control_plane_host = None, "CONTROL_PLANE_HOST"),
            (|c| c.control_plane_port = None, "CONTROL_PLANE_PORT"),
            (|c| c.backend_api_token = Some("  ".into()), "BACKEND_API_TOKEN"),
            (|c| c.monitor_api_token = None, "MONITOR_API_TOKEN"),
            (|c| c.port_map = None, "PORT_MAP"),
        ];
        for (clear, name) in cases {
            let mut cli = valid_cli();
            clear(&mut cli);
            match load_config(&cli) {
                Err(ConfigError::Missing(missing)) => assert_eq!(missing, name),
                other => panic!("expected Missing({name}), got {other:?}"),
            }
        }
    }

    #[test]
    fn rejects_malformed_port_maps() {
        assert!(matches!(
            parse_port_map("not json"),
            Err(ConfigError::PortMapSyntax(_))
        ));
        assert!(matches!(
            parse_port_map(r#"{"abc": ["h", 1]}"#),
            Err(ConfigError::PortMapSyntax(_))
        ));
        assert!(matches!(
            parse_port_map(r#"{"80": "h:1"}"#),
            Err(ConfigError::PortMapSyntax(_))
        ));
        assert!(matches!(parse_port_map("{}"), Err(ConfigError::EmptyPortMap)));
        assert!(matches!(
            parse_port_map(r#"{"80": ["", 1]}"#),
            Err(ConfigError::EmptyHost(80))
        ));
        assert!(matches!(
            parse_port_map(r#"{"80": ["a", 1], "080": ["b", 2]}"#),
            Err(ConfigError::DuplicatePort(80))
        ));
    }

    #[test]
    fn rejects_out_of_range_ports() {
        for raw in [
            r#"{"0": ["h", 80]}"#,
            r#"{"65536": ["h", 80]}"#,
            r#"{"80": ["h", 0]}"#,
            r#"{"80": ["h", 70000]}"#,
            r#"{"-1": ["h", 80]}"#,
        ] {
            assert!(
                matches!(parse_port_map(raw), Err(ConfigError::PortOutOfRange { .. })),
                "{raw} should be rejected"
            );
        }

        let mut cli = valid_cli();
        cli.control_plane_port = Some("99999".into());
        assert!(matches!(
            load_config(&cli),
            Err(ConfigError::PortOutOfRange { .. })
        ));
        cli.control_plane_port = Some("http".into());
        assert!(matches!(
            load_config(&cli),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn rejects_zero_workers() {
        let mut cli = valid_cli();
        cli.workers_per_port = Some("0".into());
        assert!(matches!(
            load_config(&cli),
            Err(ConfigError::InvalidValue {
                field: "WORKERS_PER_PORT",
                ..
            })
        ));
        cli.workers_per_port = Some("3".into());
        assert_eq!(load_config(&cli).unwrap().workers_per_port, 3);
    }

    #[test]
    fn accepts_full_range_ports() {
        let router = parse_port_map(r#"{"1": ["a", 65535], "65535": ["b", 1]}"#).unwrap();
        assert_eq!(router.len(), 2);
        assert_eq!(router.route(65535).map(|b| b.port), Some(1));
    }
}
