//! Shared types and constants for the zapret manager

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

// ==================== CONSTANTS ====================

/// Rule block separator understood by winws/nfqws
pub const NEW_BLOCK: &str = "--new";

/// Endpoint used when the user does not name one
pub const DEFAULT_DOMAIN: &str = "rutracker.org/forum/index.php";

/// YouTube manifest, small and always served over QUIC as well
pub const YOUTUBE_DOMAIN: &str = "www.youtube.com/manifest.webmanifest";

/// Endpoint used for ipset mode when the user does not name one
pub const DEFAULT_IPSET_DOMAIN: &str = "www.delta.com";

/// Line winws prints once WinDivert is capturing
pub const DEFAULT_READY_MARKER: &str = "windivert initialized. capture is started.";

/// Service name used by older releases, cleaned up on create/delete
pub const LEGACY_SERVICE_NAME: &str = "zapret";

// ==================== PROTOCOL ENUMS ====================

/// Catalog category of a strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain HTTP on TCP 80
    Http,
    /// TLS on TCP 443
    Https,
    /// QUIC on UDP 443
    Http3,
}

impl Protocol {
    /// `tcp` or `udp`
    pub fn transport(self) -> &'static str {
        match self {
            Self::Http | Self::Https => "tcp",
            Self::Http3 => "udp",
        }
    }

    pub fn port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https | Self::Http3 => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Http3 => "http3",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            "http3" | "quic" => Ok(Self::Http3),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

/// TLS version pinned by a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

/// One kind of reachability check
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum CheckKind {
    /// HTTP on port 80
    Http,
    /// HTTPS pinned to TLS 1.2
    HttpsTls12,
    /// HTTPS pinned to TLS 1.3
    HttpsTls13,
    /// QUIC handshake on UDP 443
    Http3,
}

impl CheckKind {
    pub const ALL: [CheckKind; 4] = [Self::Http, Self::HttpsTls12, Self::HttpsTls13, Self::Http3];

    /// Strategy category tested by this check
    pub fn protocol(self) -> Protocol {
        match self {
            Self::Http => Protocol::Http,
            Self::HttpsTls12 | Self::HttpsTls13 => Protocol::Https,
            Self::Http3 => Protocol::Http3,
        }
    }

    pub fn port(self) -> u16 {
        match self {
            Self::Http => 80,
            _ => 443,
        }
    }

    pub fn tls_version(self) -> Option<TlsVersion> {
        match self {
            Self::HttpsTls12 => Some(TlsVersion::Tls12),
            Self::HttpsTls13 => Some(TlsVersion::Tls13),
            _ => None,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::Http => "HTTP",
            Self::HttpsTls12 => "HTTPS (TLS 1.2)",
            Self::HttpsTls13 => "HTTPS (TLS 1.3)",
            Self::Http3 => "HTTP/3 (QUIC)",
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

// ==================== CORE STRUCTS ====================

/// Reachability target: a host with an optional path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name, no scheme or port
    pub host: String,
    /// Path including the leading slash, `/` when absent
    pub path: String,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into();
        let path = if path.starts_with('/') { path } else { format!("/{}", path) };
        Self { host: host.into().to_ascii_lowercase(), path }
    }

    /// URL the probe requests for the given check
    pub fn url(&self, check: CheckKind) -> String {
        let scheme = if check == CheckKind::Http { "http" } else { "https" };
        format!("{}://{}{}", scheme, self.host, self.path)
    }
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let without_scheme = trimmed
            .strip_prefix("https://")
            .or_else(|| trimmed.strip_prefix("http://"))
            .unwrap_or(trimmed);
        let (host, path) = match without_scheme.find('/') {
            Some(idx) => (&without_scheme[..idx], &without_scheme[idx..]),
            None => (without_scheme, "/"),
        };
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(format!("invalid endpoint '{}'", s));
        }
        Ok(Self::new(host, path))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path == "/" {
            f.write_str(&self.host)
        } else {
            write!(f, "{}{}", self.host, self.path)
        }
    }
}

/// Identity of a strategy: its catalog position, or the preset rule it came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StrategyId {
    Catalog(usize),
    PresetRule(usize),
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Catalog(idx) => write!(f, "#{}", idx + 1),
            Self::PresetRule(idx) => write!(f, "rule {}", idx + 1),
        }
    }
}

/// Outcome of one probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Strategy live during the probe, `None` for the no-bypass baseline
    pub strategy: Option<StrategyId>,
    /// Probed endpoint
    pub endpoint: Endpoint,
    /// Check performed
    pub check: CheckKind,
    /// Whether the endpoint answered as expected
    pub success: bool,
    /// Fastest observed round trip
    pub latency: Option<Duration>,
    /// Failure description
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn passed(
        strategy: Option<StrategyId>,
        endpoint: Endpoint,
        check: CheckKind,
        latency: Duration,
    ) -> Self {
        Self { strategy, endpoint, check, success: true, latency: Some(latency), error: None }
    }

    pub fn failed(
        strategy: Option<StrategyId>,
        endpoint: Endpoint,
        check: CheckKind,
        error: impl Into<String>,
    ) -> Self {
        Self { strategy, endpoint, check, success: false, latency: None, error: Some(error.into()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse() {
        let ep: Endpoint = "Rutracker.org/forum/index.php".parse().unwrap();
        assert_eq!(ep.host, "rutracker.org");
        assert_eq!(ep.path, "/forum/index.php");
        assert_eq!(ep.url(CheckKind::Http), "http://rutracker.org/forum/index.php");
        assert_eq!(ep.to_string(), "rutracker.org/forum/index.php");

        let bare: Endpoint = "https://example.com".parse().unwrap();
        assert_eq!(bare.path, "/");
        assert_eq!(bare.url(CheckKind::HttpsTls13), "https://example.com/");
        assert!("".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_check_protocol_mapping() {
        assert_eq!(CheckKind::HttpsTls12.protocol(), Protocol::Https);
        assert_eq!(CheckKind::Http3.protocol(), Protocol::Http3);
        assert_eq!(CheckKind::Http.port(), 80);
        assert_eq!((Protocol::Http3.transport(), Protocol::Http3.port()), ("udp", 443));
        assert_eq!((Protocol::Http.transport(), Protocol::Http.port()), ("tcp", 80));
        assert_eq!("QUIC".parse::<Protocol>().unwrap(), Protocol::Http3);
    }
}
