//! INI configuration loader (spec.md §6). A small hand-rolled reader
//! rather than a crate dependency — the key set is fixed and flat, and a
//! single `[main]` section is all the format needs to express.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{NetReactorError, Result};

/// `log.cmd.rotate` / `log.err.rotate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotate {
    Daily,
    Hourly,
}

impl Rotate {
    fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DAILY" => Ok(Rotate::Daily),
            "HOURLY" => Ok(Rotate::Hourly),
            other => Err(NetReactorError::Config(format!("invalid rotate value: {other}"))),
        }
    }
}

/// `child.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildType {
    Single,
    Multi,
}

impl ChildType {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "single" => Ok(ChildType::Single),
            "multi" => Ok(ChildType::Multi),
            other => Err(NetReactorError::Config(format!("invalid child.type value: {other}"))),
        }
    }
}

/// `poller.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerType {
    Auto,
    Epoll,
    Kqueue,
}

impl PollerType {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(PollerType::Auto),
            "epoll" => Ok(PollerType::Epoll),
            "kqueue" => Ok(PollerType::Kqueue),
            other => Err(NetReactorError::Config(format!("invalid poller.type value: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub cmd_path: String,
    pub cmd_rotate: Rotate,
    pub err_path: String,
    pub err_rotate: Rotate,
    pub trace: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            cmd_path: "./log/cmd".to_string(),
            cmd_rotate: Rotate::Daily,
            err_path: "./log/err".to_string(),
            err_rotate: Rotate::Daily,
            trace: false,
        }
    }
}

/// The listener tags spec.md §6 recognizes as `<tag>.port` keys.
pub const PORT_TAGS: [&str; 6] = ["svc", "svcssl", "http", "https", "admin", "adminssl"];

/// Parsed `[main]` section plus any `<tag>.port` keys present.
#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: String,
    pub poller_type: PollerType,
    pub poller_timeout: Duration,
    pub timeout_job: Duration,
    pub timeout_ping: Duration,
    pub log: LogConfig,
    pub flag_stage: bool,
    pub child_type: ChildType,
    pub child_count: u32,
    pub ports: HashMap<String, u16>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            app_name: "netreactord".to_string(),
            poller_type: PollerType::Auto,
            poller_timeout: Duration::from_millis(1000),
            timeout_job: Duration::from_micros(5_000_000),
            timeout_ping: Duration::from_micros(25_000_000),
            log: LogConfig::default(),
            flag_stage: false,
            child_type: ChildType::Single,
            child_count: 0,
            ports: HashMap::new(),
        }
    }
}

impl Config {
    /// Reads and parses `path`. Unknown keys are ignored rather than
    /// rejected, so a config file can carry application-specific keys
    /// alongside the ones this crate understands.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())
            .map_err(|e| NetReactorError::Config(format!("reading {}: {e}", path.as_ref().display())))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let entries = parse_ini(text)?;
        let mut cfg = Config::default();

        for (key, value) in &entries {
            match key.as_str() {
                "app.name" => cfg.app_name = value.clone(),
                "poller.type" => cfg.poller_type = PollerType::parse(value)?,
                "poller.timeout" => cfg.poller_timeout = Duration::from_millis(parse_u64(key, value)?),
                "timeout.job" => cfg.timeout_job = Duration::from_micros(parse_u64(key, value)?),
                "timeout.ping" => cfg.timeout_ping = Duration::from_micros(parse_u64(key, value)?),
                "log.cmd.path" => cfg.log.cmd_path = value.clone(),
                "log.cmd.rotate" => cfg.log.cmd_rotate = Rotate::parse(value)?,
                "log.err.path" => cfg.log.err_path = value.clone(),
                "log.err.rotate" => cfg.log.err_rotate = Rotate::parse(value)?,
                "log.trace" => cfg.log.trace = parse_bool(key, value)?,
                "flag.stage" => cfg.flag_stage = parse_bool(key, value)?,
                "child.type" => cfg.child_type = ChildType::parse(value)?,
                "child.count" => cfg.child_count = parse_u64(key, value)? as u32,
                other => {
                    if let Some(tag) = other.strip_suffix(".port") {
                        if PORT_TAGS.contains(&tag) {
                            cfg.ports.insert(tag.to_string(), parse_u64(key, value)? as u16);
                        }
                    }
                }
            }
        }

        Ok(cfg)
    }

    pub fn port(&self, tag: &str) -> Option<u16> {
        self.ports.get(tag).copied()
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value.parse().map_err(|_| NetReactorError::Config(format!("{key} is not a number: {value}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(NetReactorError::Config(format!("{key} is not a boolean: {other}"))),
    }
}

/// Flattens every `key = value` line in the file into `section.key` pairs.
/// Only `[main]` is meaningful today; other sections are kept (with their
/// name as the prefix) so an application can layer its own sections on
/// top without this reader rejecting the file.
fn parse_ini(text: &str) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    let mut section = String::from("main");

    for (lineno, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix('[') {
            let Some(name) = rest.strip_suffix(']') else {
                return Err(NetReactorError::Config(format!("line {}: malformed section header", lineno + 1)));
            };
            section = name.trim().to_string();
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(NetReactorError::Config(format!("line {}: expected key = value", lineno + 1)));
        };
        let key = key.trim();
        let value = value.trim();
        if section == "main" {
            out.push((key.to_string(), value.to_string()));
        } else {
            out.push((format!("{section}.{key}"), value.to_string()));
        }
    }

    Ok(out)
}
