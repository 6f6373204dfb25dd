//! Host identity

use crate::error::{Error, Result};
use std::fmt;

/// Identity of an agent: host name (or address) and control port
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostAddr {
    pub host: String,
    pub port: u16,
}

impl HostAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host`, `host:port`, `[v6]` or `[v6]:port`, using `default_port`
    /// when none is given
    pub fn parse(input: &str, default_port: u16) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::Config("host must not be empty".to_string()));
        }

        if let Some(rest) = input.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| Error::Config(format!("unterminated IPv6 literal: {}", input)))?;
            let port = match after.strip_prefix(':') {
                Some(port) => parse_port(port, input)?,
                None if after.is_empty() => default_port,
                None => return Err(Error::Config(format!("invalid host: {}", input))),
            };
            return Ok(Self::new(host, port));
        }

        match input.rsplit_once(':') {
            // A bare IPv6 address has several colons and no port
            Some((host, _)) if host.contains(':') => Ok(Self::new(input, default_port)),
            Some((host, port)) => Ok(Self::new(host, parse_port(port, input)?)),
            None => Ok(Self::new(input, default_port)),
        }
    }

    /// Authority part of a URL
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.authority())
    }

    pub fn health_url(&self) -> String {
        format!("http://{}/health", self.authority())
    }
}

fn parse_port(port: &str, input: &str) -> Result<u16> {
    match port.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(Error::Config(format!("invalid port in {}", input))),
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}
