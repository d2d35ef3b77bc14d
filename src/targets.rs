//! Probe targets and named domain presets
//!
//! `domain_presets.txt` groups endpoints under `[domain]` / `[ipset]`
//! sections. Inside a section each blank-line separated block is one preset:
//! the first line is its name, the following lines its endpoints.

use std::{collections::HashSet, path::{Path, PathBuf}};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    error::{ManagerError, Result},
    types::Endpoint,
};

/// How the engine is told which traffic to touch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Targeting {
    /// `--hostlist-domains=` built from the probed endpoints
    Hostlist(Vec<Endpoint>),
    /// `--ipset=` pointing at a list file
    Ipset(PathBuf),
}

impl Targeting {
    /// Engine argument selecting the traffic
    pub fn to_arg(&self) -> String {
        match self {
            Self::Hostlist(endpoints) => {
                let mut seen = HashSet::new();
                let hosts: Vec<&str> = endpoints
                    .iter()
                    .map(|e| e.host.as_str())
                    .filter(|h| seen.insert(*h))
                    .collect();
                format!("--hostlist-domains={}", hosts.join(","))
            }
            Self::Ipset(path) => format!("--ipset={}", path.display()),
        }
    }

    pub fn is_ipset(&self) -> bool {
        matches!(self, Self::Ipset(_))
    }
}

/// Section of the preset file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetMode {
    Domain,
    Ipset,
}

impl TargetMode {
    fn from_section(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        if name.contains("domain") {
            Some(Self::Domain)
        } else if name.contains("ipset") {
            Some(Self::Ipset)
        } else {
            None
        }
    }
}

/// Named endpoint group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainPreset {
    pub name: String,
    pub mode: TargetMode,
    pub endpoints: Vec<Endpoint>,
}

/// All presets from `domain_presets.txt`
#[derive(Debug, Clone, Default)]
pub struct DomainPresets {
    presets: Vec<DomainPreset>,
}

impl DomainPresets {
    /// Missing file yields an empty set
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    pub fn parse(text: &str) -> Self {
        let mut presets = Vec::new();
        let mut section: Option<TargetMode> = None;
        let mut name: Option<String> = None;
        let mut endpoints: Vec<Endpoint> = Vec::new();

        let mut flush = |section: Option<TargetMode>, name: &mut Option<String>, eps: &mut Vec<Endpoint>| {
            if let (Some(mode), Some(n)) = (section, name.take()) {
                if !eps.is_empty() {
                    presets.push(DomainPreset { name: n, mode, endpoints: std::mem::take(eps) });
                }
            }
            eps.clear();
        };

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() {
                flush(section, &mut name, &mut endpoints);
                continue;
            }
            if line.starts_with('#') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                flush(section, &mut name, &mut endpoints);
                section = TargetMode::from_section(&line[1..line.len() - 1]);
                continue;
            }
            if section.is_none() {
                continue;
            }
            if name.is_none() {
                name = Some(line.to_string());
                continue;
            }
            match line.parse::<Endpoint>() {
                Ok(ep) => endpoints.push(ep),
                Err(e) => warn!("⚠️ Skipping domain preset entry: {}", e),
            }
        }
        flush(section, &mut name, &mut endpoints);

        Self { presets }
    }

    pub fn for_mode(&self, mode: TargetMode) -> impl Iterator<Item = &DomainPreset> {
        self.presets.iter().filter(move |p| p.mode == mode)
    }

    pub fn by_name(&self, mode: TargetMode, name: &str) -> Option<&DomainPreset> {
        self.for_mode(mode).find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }
}

/// Parse user-supplied endpoint strings, rejecting the whole set on any error
pub fn parse_endpoints<S: AsRef<str>>(items: &[S]) -> Result<Vec<Endpoint>> {
    items
        .iter()
        .map(|s| s.as_ref().parse::<Endpoint>().map_err(ManagerError::Config))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# comment
[Domain presets]
YouTube
www.youtube.com/manifest.webmanifest
i.ytimg.com

Trackers
rutracker.org/forum/index.php

[IPSet presets]
Cloudflare
www.delta.com
";

    #[test]
    fn test_parse_sections_and_blocks() {
        let presets = DomainPresets::parse(SAMPLE);
        let domains: Vec<_> = presets.for_mode(TargetMode::Domain).collect();
        assert_eq!(domains.len(), 2);
        assert_eq!(domains[0].name, "YouTube");
        assert_eq!(domains[0].endpoints.len(), 2);
        assert_eq!(domains[1].endpoints[0].path, "/forum/index.php");

        let cf = presets.by_name(TargetMode::Ipset, "cloudflare").unwrap();
        assert_eq!(cf.endpoints[0].host, "www.delta.com");
    }

    #[test]
    fn test_hostlist_arg_dedups_hosts() {
        let eps = parse_endpoints(&["a.com/x", "a.com/y", "b.com"]).unwrap();
        assert_eq!(Targeting::Hostlist(eps).to_arg(), "--hostlist-domains=a.com,b.com");
        let ipset = Targeting::Ipset(PathBuf::from("lists/ipset-all.txt"));
        assert_eq!(ipset.to_arg(), "--ipset=lists/ipset-all.txt");
    }
}
