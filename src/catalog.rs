//! Strategy catalog (`strategies.txt`)
//!
//! One candidate per line: `<protocol> : <engine args...>`. Entries are
//! validated once at load time; a bad line is logged and skipped, the rest
//! of the file still loads.

use std::{
    fmt,
    path::{Path, MAIN_SEPARATOR},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    config::PathSettings,
    engine::Diversion,
    error::{ManagerError, Result},
    targets::Targeting,
    types::{CheckKind, Protocol, StrategyId},
};

// ── Desync techniques ──────────────────────────────────────────────────────

/// One `--dpi-desync` mode understood by winws/nfqws
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DesyncMode {
    Fake,
    FakeKnown,
    Rst,
    RstAck,
    SynAck,
    SynData,
    Split,
    Split2,
    Disorder,
    Disorder2,
    MultiSplit,
    MultiDisorder,
    FakedSplit,
    FakedDisorder,
    HostFakeSplit,
    IpFrag1,
    IpFrag2,
    UdpLen,
    Tamper,
    HopByHop,
    DestOpt,
}

impl DesyncMode {
    fn is_fake(self) -> bool {
        matches!(
            self,
            Self::Fake | Self::FakeKnown | Self::Rst | Self::RstAck | Self::SynAck | Self::SynData
        )
    }

    fn is_split(self) -> bool {
        matches!(
            self,
            Self::Split
                | Self::Split2
                | Self::Disorder
                | Self::Disorder2
                | Self::MultiSplit
                | Self::MultiDisorder
                | Self::FakedSplit
                | Self::FakedDisorder
                | Self::HostFakeSplit
        )
    }

    fn is_udp_only(self) -> bool {
        matches!(self, Self::UdpLen | Self::Tamper | Self::IpFrag2)
    }
}

impl FromStr for DesyncMode {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "fake" => Self::Fake,
            "fakeknown" => Self::FakeKnown,
            "rst" => Self::Rst,
            "rstack" => Self::RstAck,
            "synack" => Self::SynAck,
            "syndata" => Self::SynData,
            "split" => Self::Split,
            "split2" => Self::Split2,
            "disorder" => Self::Disorder,
            "disorder2" => Self::Disorder2,
            "multisplit" => Self::MultiSplit,
            "multidisorder" => Self::MultiDisorder,
            "fakedsplit" => Self::FakedSplit,
            "fakeddisorder" => Self::FakedDisorder,
            "hostfakesplit" => Self::HostFakeSplit,
            "ipfrag1" => Self::IpFrag1,
            "ipfrag2" => Self::IpFrag2,
            "udplen" => Self::UdpLen,
            "tamper" => Self::Tamper,
            "hopbyhop" => Self::HopByHop,
            "destopt" => Self::DestOpt,
            other => return Err(ManagerError::config(format!("unknown desync mode '{}'", other))),
        })
    }
}

/// Validated desync technique of a strategy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Desync {
    /// Fake packets only
    Fake { key: String, modes: Vec<DesyncMode> },
    /// Segmentation/reordering without separate fakes
    Split { key: String, modes: Vec<DesyncMode>, split_pos: Option<String> },
    /// Fakes followed by segmentation
    FakeSplit { key: String, modes: Vec<DesyncMode>, split_pos: Option<String> },
    /// Datagram tricks for QUIC
    Datagram { key: String, modes: Vec<DesyncMode> },
    /// IP-level tricks (ipfrag1, hopbyhop, destopt)
    Ip { key: String, modes: Vec<DesyncMode> },
}

impl Desync {
    /// Validate the `--dpi-desync` value against the rest of the args
    pub fn from_args(protocol: Protocol, args: &[String]) -> Result<Self> {
        let key = find_value(args, "--dpi-desync")
            .ok_or_else(|| ManagerError::config("missing --dpi-desync"))?
            .to_string();
        let modes = key
            .split(',')
            .map(|m| m.trim().parse::<DesyncMode>())
            .collect::<Result<Vec<_>>>()?;
        if modes.is_empty() {
            return Err(ManagerError::config("empty --dpi-desync"));
        }

        if protocol != Protocol::Http3 {
            if let Some(m) = modes.iter().find(|m| m.is_udp_only()) {
                return Err(ManagerError::config(format!(
                    "desync mode {:?} only applies to UDP, not {}",
                    m, protocol
                )));
            }
        }

        let split_pos = find_value(args, "--dpi-desync-split-pos").map(str::to_string);
        let has_fake = modes.iter().any(|m| m.is_fake());
        let has_split = modes.iter().any(|m| m.is_split());
        if split_pos.is_some() && !has_split {
            return Err(ManagerError::config(format!(
                "--dpi-desync-split-pos given but '{}' does not split",
                key
            )));
        }

        Ok(if has_fake && has_split {
            Self::FakeSplit { key, modes, split_pos }
        } else if has_split {
            Self::Split { key, modes, split_pos }
        } else if has_fake {
            Self::Fake { key, modes }
        } else if modes.iter().all(|m| m.is_udp_only()) {
            Self::Datagram { key, modes }
        } else {
            Self::Ip { key, modes }
        })
    }

    /// Raw `--dpi-desync` value, the grouping key for auto-adjust
    pub fn key(&self) -> &str {
        match self {
            Self::Fake { key, .. }
            | Self::Split { key, .. }
            | Self::FakeSplit { key, .. }
            | Self::Datagram { key, .. }
            | Self::Ip { key, .. } => key,
        }
    }

    pub fn modes(&self) -> &[DesyncMode] {
        match self {
            Self::Fake { modes, .. }
            | Self::Split { modes, .. }
            | Self::FakeSplit { modes, .. }
            | Self::Datagram { modes, .. }
            | Self::Ip { modes, .. } => modes,
        }
    }
}

/// Value of the first `--flag=value` in `args`
pub fn find_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter().find_map(|a| {
        a.strip_prefix(flag).and_then(|rest| rest.strip_prefix('='))
    })
}

// ── Strategy ───────────────────────────────────────────────────────────────

/// Immutable candidate argument set for the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Strategy {
    pub id: StrategyId,
    pub protocol: Protocol,
    pub args: Vec<String>,
    pub desync: Desync,
}

impl Strategy {
    pub fn new(id: StrategyId, protocol: Protocol, args: Vec<String>) -> Result<Self> {
        if let Some(bad) = args.iter().find(|a| !a.starts_with("--")) {
            return Err(ManagerError::config(format!("'{}' is not an engine flag", bad)));
        }
        let desync = Desync::from_args(protocol, &args)?;
        Ok(Self { id, protocol, args, desync })
    }

    /// Parse one catalog line; blank lines and comments yield `None`
    pub fn parse_line(id: StrategyId, line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        let (proto, params) = line
            .split_once(" : ")
            .ok_or_else(|| ManagerError::config(format!("expected '<protocol> : <args>' in '{}'", line)))?;
        let protocol = proto.parse::<Protocol>().map_err(ManagerError::Config)?;
        let args = params.split_whitespace().map(str::to_string).collect();
        Self::new(id, protocol, args).map(Some)
    }

    pub fn name(&self) -> String {
        self.args.join(" ")
    }

    pub fn desync_key(&self) -> &str {
        self.desync.key()
    }

    /// Full engine argument list: traffic capture args for `diversion`,
    /// targeting, then the strategy args with path placeholders resolved
    pub fn build_command(&self, diversion: Diversion, targeting: &Targeting, paths: &PathSettings) -> Vec<String> {
        let mut command = diversion.capture_args(self.protocol);
        command.push(targeting.to_arg());
        command.extend(self.args.iter().map(|a| resolve_placeholders(a, paths)));
        command
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.protocol, self.name())
    }
}

/// Expand `%~dp0`, `%BIN%` and `%LISTS%` inside a `--flag=value` argument
pub fn resolve_placeholders(arg: &str, paths: &PathSettings) -> String {
    let Some((key, value)) = arg.split_once('=') else {
        return arg.to_string();
    };
    let value = value.trim_matches('"');
    let table = [
        ("%~dp0", paths.base_dir.clone()),
        ("%BIN%", paths.bin_dir()),
        ("%LISTS%", paths.lists_dir()),
    ];
    for (marker, dir) in table {
        if let Some(rest) = value.strip_prefix(marker) {
            let rest: String = rest
                .chars()
                .map(|c| if c == '\\' || c == '/' { MAIN_SEPARATOR } else { c })
                .collect();
            let rest = rest.trim_start_matches(MAIN_SEPARATOR);
            return format!("{}={}", key, dir.join(rest).display());
        }
    }
    arg.to_string()
}

// ── Catalog ────────────────────────────────────────────────────────────────

/// Ordered, validated strategy list
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    strategies: Vec<Strategy>,
    skipped: usize,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ManagerError::MissingFile(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        let catalog = Self::parse(&text);
        info!(
            "📚 Loaded {} strategies from {} ({} skipped)",
            catalog.len(),
            path.display(),
            catalog.skipped
        );
        Ok(catalog)
    }

    pub fn parse(text: &str) -> Self {
        let mut strategies = Vec::new();
        let mut skipped = 0;
        for (line_no, line) in text.lines().enumerate() {
            match Strategy::parse_line(StrategyId::Catalog(strategies.len()), line) {
                Ok(Some(s)) => {
                    debug!("➕ {}", s);
                    strategies.push(s);
                }
                Ok(None) => {}
                Err(e) => {
                    skipped += 1;
                    warn!("⚠️ strategies line {}: {}, skipped", line_no + 1, e);
                }
            }
        }
        Self { strategies, skipped }
    }

    pub fn get(&self, id: StrategyId) -> Option<&Strategy> {
        match id {
            StrategyId::Catalog(idx) => self.strategies.get(idx),
            StrategyId::PresetRule(_) => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Strategy> {
        self.strategies.iter()
    }

    pub fn for_check(&self, check: CheckKind) -> Vec<&Strategy> {
        let protocol = check.protocol();
        self.strategies.iter().filter(|s| s.protocol == protocol).collect()
    }

    /// Same protocol and identical `--dpi-desync` value, in catalog order
    pub fn candidates(&self, protocol: Protocol, desync_key: &str) -> Vec<&Strategy> {
        self.strategies
            .iter()
            .filter(|s| s.protocol == protocol && s.desync_key() == desync_key)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const SAMPLE: &str = "\
# https
https : --dpi-desync=fake,split2 --dpi-desync-split-pos=1 --dpi-desync-fooling=md5sig
https : --dpi-desync=fake --dpi-desync-fake-tls=%~dp0bin\\tls_clienthello.bin
http : --dpi-desync=split --dpi-desync-split-pos=2
http3 : --dpi-desync=fake --dpi-desync-repeats=6
gopher : --dpi-desync=fake
https : --dpi-desync=teleport
https : --dpi-desync=fake --dpi-desync-split-pos=3
http : --dpi-desync=udplen
https --dpi-desync=fake
https : --dpi-desync=split2 oops
";

    #[test]
    fn test_parse_skips_invalid_entries() {
        let catalog = Catalog::parse(SAMPLE);
        assert_eq!(catalog.len(), 4);
        assert_eq!(catalog.skipped(), 6);
        let ids: Vec<_> = catalog.iter().map(|s| s.id).collect();
        assert_eq!(
            ids,
            vec![
                StrategyId::Catalog(0),
                StrategyId::Catalog(1),
                StrategyId::Catalog(2),
                StrategyId::Catalog(3)
            ]
        );
    }

    #[test]
    fn test_desync_variants() {
        let catalog = Catalog::parse(SAMPLE);
        let first = catalog.get(StrategyId::Catalog(0)).unwrap();
        assert!(matches!(first.desync, Desync::FakeSplit { ref split_pos, .. } if split_pos.as_deref() == Some("1")));
        assert_eq!(first.desync_key(), "fake,split2");
        assert!(matches!(catalog.get(StrategyId::Catalog(2)).unwrap().desync, Desync::Split { .. }));
        assert!(matches!(catalog.get(StrategyId::Catalog(3)).unwrap().desync, Desync::Fake { .. }));

        let quic = Strategy::new(
            StrategyId::Catalog(9),
            Protocol::Http3,
            vec!["--dpi-desync=udplen".into()],
        )
        .unwrap();
        assert!(matches!(quic.desync, Desync::Datagram { .. }));
    }

    #[test]
    fn test_candidates_filter_by_protocol_and_key() {
        let catalog = Catalog::parse(SAMPLE);
        let fakes = catalog.candidates(Protocol::Https, "fake");
        assert_eq!(fakes.len(), 1);
        assert_eq!(fakes[0].id, StrategyId::Catalog(1));
        assert!(catalog.candidates(Protocol::Http, "fake").is_empty());
        assert_eq!(catalog.for_check(CheckKind::HttpsTls12).len(), 2);
    }

    #[test]
    fn test_build_command_resolves_paths() {
        let catalog = Catalog::parse(SAMPLE);
        let paths = PathSettings { base_dir: PathBuf::from("/opt/zapret"), ..Default::default() };
        let eps = crate::targets::parse_endpoints(&["rutracker.org/forum"]).unwrap();
        let cmd = catalog
            .get(StrategyId::Catalog(1))
            .unwrap()
            .build_command(Diversion::WinDivert, &Targeting::Hostlist(eps.clone()), &paths);

        assert_eq!(cmd[0], "--wf-l3=ipv4");
        assert_eq!(cmd[1], "--wf-tcp=443");
        assert_eq!(cmd[2], "--hostlist-domains=rutracker.org");
        assert_eq!(cmd[3], "--dpi-desync=fake");
        let expected = PathBuf::from("/opt/zapret/bin/tls_clienthello.bin");
        assert_eq!(cmd[4], format!("--dpi-desync-fake-tls={}", expected.display()));

        let nfqws = catalog
            .get(StrategyId::Catalog(1))
            .unwrap()
            .build_command(Diversion::Nfqueue { qnum: 200 }, &Targeting::Hostlist(eps), &paths);
        assert_eq!(nfqws[0], "--qnum=200");
        assert_eq!(nfqws[1], "--hostlist-domains=rutracker.org");
        assert!(nfqws.iter().all(|a| !a.starts_with("--wf-")));
    }

    #[test]
    fn test_bin_placeholder() {
        let paths = PathSettings { base_dir: PathBuf::from("/srv"), ..Default::default() };
        let out = resolve_placeholders("--dpi-desync-fake-quic=\"%BIN%quic_initial.bin\"", &paths);
        assert_eq!(out, format!("--dpi-desync-fake-quic={}", PathBuf::from("/srv/bin/quic_initial.bin").display()));
        assert_eq!(resolve_placeholders("--new", &paths), "--new");
    }
}
