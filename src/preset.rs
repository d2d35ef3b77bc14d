//! Preset launcher scripts
//!
//! A preset is a `.bat`/`.cmd` (winws) or `.sh` (nfqws) script that starts
//! the engine with global args followed by `--new`-separated rule blocks.
//! Tokens are kept exactly as written (placeholders unexpanded) and every
//! other line keeps its place, so an adjusted preset can be written back in
//! the same form and the same code page.

use std::{
    fmt::Write as _,
    path::{Path, PathBuf, MAIN_SEPARATOR},
};

use encoding_rs::{Encoding, IBM866, UTF_8, WINDOWS_1251};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    catalog::{find_value, Strategy},
    error::{ManagerError, Result},
    types::{CheckKind, StrategyId, NEW_BLOCK},
};

// ── Dialects ───────────────────────────────────────────────────────────────

/// Script flavour of a preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Windows batch: `set "VAR=VALUE"`, `^` continuations
    Batch,
    /// POSIX shell: `VAR="VALUE"`, `\` continuations
    Shell,
}

impl Dialect {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "bat" | "cmd" => Ok(Self::Batch),
            "sh" => Ok(Self::Shell),
            _ => Err(ManagerError::config(format!(
                "{}: not a preset script (.bat, .cmd or .sh)",
                path.display()
            ))),
        }
    }

    fn continuation(self) -> char {
        match self {
            Self::Batch => '^',
            Self::Shell => '\\',
        }
    }

    /// Parse a variable assignment line into `(name, raw value)`
    fn assignment(self, line: &str) -> Option<(String, String)> {
        match self {
            Self::Batch => {
                let rest = line.get(..4).filter(|p| p.eq_ignore_ascii_case("set "))?;
                let body = line[rest.len()..].trim();
                let body = body.strip_prefix('"')?.strip_suffix('"')?;
                let (name, value) = body.split_once('=')?;
                Some((name.trim().to_string(), value.to_string()))
            }
            Self::Shell => {
                let (name, value) = line.split_once('=')?;
                let mut chars = name.chars();
                let valid = chars.next().map(|c| c.is_ascii_alphabetic() || c == '_').unwrap_or(false)
                    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
                if !valid {
                    return None;
                }
                let value = value.trim();
                let value = value
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .unwrap_or(value);
                Some((name.to_string(), value.to_string()))
            }
        }
    }
}

// ── Code pages ─────────────────────────────────────────────────────────────

/// Text encoding a preset was read in; written back the same way
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextEncoding {
    #[default]
    Utf8,
    /// DOS Cyrillic, what `cmd.exe` uses on Russian Windows
    Cp866,
    Cp1251,
}

impl TextEncoding {
    fn encoding(self) -> &'static Encoding {
        match self {
            Self::Utf8 => UTF_8,
            Self::Cp866 => IBM866,
            Self::Cp1251 => WINDOWS_1251,
        }
    }

    /// UTF-8 if valid, otherwise whichever of cp866/cp1251 reads as more Cyrillic
    pub fn decode(bytes: &[u8]) -> (Self, String) {
        if let Some(text) = UTF_8.decode_without_bom_handling_and_without_replacement(bytes) {
            return (Self::Utf8, text.into_owned());
        }
        let cyrillic = |text: &str| text.chars().filter(|c| ('\u{0400}'..='\u{04FF}').contains(c)).count();
        let (dos, _) = IBM866.decode_without_bom_handling(bytes);
        let (ansi, _) = WINDOWS_1251.decode_without_bom_handling(bytes);
        if cyrillic(&ansi) > cyrillic(&dos) {
            (Self::Cp1251, ansi.into_owned())
        } else {
            (Self::Cp866, dos.into_owned())
        }
    }

    pub fn encode(self, text: &str) -> Vec<u8> {
        let (bytes, _, lossy) = self.encoding().encode(text);
        if lossy {
            warn!("⚠️ Some characters have no {:?} mapping and were escaped", self);
        }
        bytes.into_owned()
    }
}

// ── Tokenizing ─────────────────────────────────────────────────────────────

/// Whitespace split that honours double quotes and drops them
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut started = false;

    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                started = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if started {
                    tokens.push(std::mem::take(&mut current));
                    started = false;
                }
            }
            c => {
                current.push(c);
                started = true;
            }
        }
    }
    if started {
        tokens.push(current);
    }
    tokens
}

/// Join continuation lines into logical lines
fn logical_lines(text: &str, continuation: char) -> Vec<String> {
    let mut out = Vec::new();
    let mut pending = String::new();
    for raw in text.lines() {
        let line = raw.trim();
        match line.strip_suffix(continuation) {
            Some(head) => {
                pending.push_str(head.trim_end());
                pending.push(' ');
            }
            None => {
                pending.push_str(line);
                out.push(std::mem::take(&mut pending).trim().to_string());
            }
        }
    }
    if !pending.trim().is_empty() {
        out.push(pending.trim().to_string());
    }
    out
}

fn is_engine_token(token: &str) -> bool {
    let lower = token.to_ascii_lowercase();
    lower.ends_with("winws.exe") || lower.ends_with("nfqws")
}

// ── Rules ──────────────────────────────────────────────────────────────────

/// One `--new` block of a preset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetRule {
    /// `--filter-*`, `--hostlist*`, `--ipset*`
    pub prefix_args: Vec<String>,
    /// Everything else: the desync strategy
    pub strategy_args: Vec<String>,
}

impl PresetRule {
    pub fn is_prefix_arg(arg: &str) -> bool {
        arg.starts_with("--filter-") || arg.starts_with("--hostlist") || arg.starts_with("--ipset")
    }

    pub fn push(&mut self, arg: String) {
        if Self::is_prefix_arg(&arg) {
            self.prefix_args.push(arg);
        } else {
            self.strategy_args.push(arg);
        }
    }

    /// Check implied by the rule's traffic filter
    pub fn check(&self) -> Option<CheckKind> {
        self.prefix_args.iter().rev().find_map(|a| {
            if a.starts_with("--filter-tcp=80") {
                Some(CheckKind::Http)
            } else if a.starts_with("--filter-tcp=443") {
                Some(CheckKind::HttpsTls13)
            } else if a.starts_with("--filter-udp=443") {
                Some(CheckKind::Http3)
            } else {
                None
            }
        })
    }

    pub fn desync_key(&self) -> Option<&str> {
        find_value(&self.strategy_args, "--dpi-desync")
    }

    /// `(check, desync key)`: rules in the same category share test results
    pub fn category(&self) -> Option<(CheckKind, String)> {
        Some((self.check()?, self.desync_key()?.to_string()))
    }

    pub fn args(&self) -> impl Iterator<Item = &String> {
        self.prefix_args.iter().chain(self.strategy_args.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.prefix_args.is_empty() && self.strategy_args.is_empty()
    }
}

// ── Preset ─────────────────────────────────────────────────────────────────

/// One logical line of a preset script, in file order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptLine {
    /// Kept verbatim (blank lines included)
    Raw(String),
    /// `set "NAME=VALUE"` / `NAME="VALUE"`, raw value
    Assign { name: String, value: String },
    /// Position of the engine command
    Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    pub path: PathBuf,
    pub dialect: Dialect,
    #[serde(default)]
    pub encoding: TextEncoding,
    /// Every line of the script; exactly one is [`ScriptLine::Command`]
    pub lines: Vec<ScriptLine>,
    /// Window title of `start "title"`
    pub title: Option<String>,
    /// Engine token as written, e.g. `%BIN%winws.exe`
    pub executable: String,
    pub global_args: Vec<String>,
    pub rules: Vec<PresetRule>,
}

impl Preset {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ManagerError::MissingFile(path.to_path_buf()));
        }
        let dialect = Dialect::from_path(path)?;
        let (encoding, text) = TextEncoding::decode(&std::fs::read(path)?);
        let mut preset = Self::parse(path, dialect, &text)?;
        preset.encoding = encoding;
        info!(
            "📄 Parsed preset {} ({} rules, {:?})",
            path.file_name().and_then(|n| n.to_str()).unwrap_or_default(),
            preset.rules.len(),
            encoding
        );
        Ok(preset)
    }

    pub fn parse(path: &Path, dialect: Dialect, text: &str) -> Result<Self> {
        let mut lines = Vec::new();
        let mut command = None;

        for line in logical_lines(text, dialect.continuation()) {
            if let Some((name, value)) = dialect.assignment(&line) {
                lines.push(ScriptLine::Assign { name, value });
                continue;
            }
            if command.is_some() || line.is_empty() {
                lines.push(ScriptLine::Raw(line));
                continue;
            }

            let tokens = tokenize(&line);
            let launcher = tokens
                .first()
                .map(|t| t.eq_ignore_ascii_case("start") || t == "exec")
                .unwrap_or(false);
            let Some(exe_idx) = tokens
                .iter()
                .position(|t| is_engine_token(t))
                .filter(|&i| i == 0 || launcher)
            else {
                lines.push(ScriptLine::Raw(line));
                continue;
            };

            let title = match dialect {
                Dialect::Batch
                    if tokens.first().map(|t| t.eq_ignore_ascii_case("start")).unwrap_or(false)
                        && exe_idx > 1
                        && !tokens[1].starts_with('/') =>
                {
                    Some(tokens[1].clone())
                }
                _ => None,
            };
            let executable = tokens[exe_idx].clone();
            let (global_args, rules) = split_rules(&tokens[exe_idx + 1..]);
            debug!("🔎 {} global args, {} rule blocks", global_args.len(), rules.len());
            lines.push(ScriptLine::Command);
            command = Some((title, executable, global_args, rules));
        }

        let Some((title, executable, global_args, rules)) = command else {
            return Err(ManagerError::config(format!("{}: no engine command found", path.display())));
        };
        Ok(Self {
            path: path.to_path_buf(),
            dialect,
            encoding: TextEncoding::Utf8,
            lines,
            title,
            executable,
            global_args,
            rules,
        })
    }

    pub fn name(&self) -> String {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string()
    }

    fn script_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Assignments that run before the engine command, in order
    pub fn assignments(&self) -> impl Iterator<Item = (&str, &str)> {
        self.lines
            .iter()
            .take_while(|l| **l != ScriptLine::Command)
            .filter_map(|l| match l {
                ScriptLine::Assign { name, value } => Some((name.as_str(), value.as_str())),
                _ => None,
            })
    }

    /// Value the command sees: the last assignment before it wins
    pub fn variable(&self, name: &str) -> Option<&str> {
        let batch = self.dialect == Dialect::Batch;
        self.assignments()
            .filter(|(k, _)| if batch { k.eq_ignore_ascii_case(name) } else { *k == name })
            .last()
            .map(|(_, v)| v)
    }

    /// Expand script-dir and variable references in one token
    pub fn expand(&self, token: &str) -> String {
        self.expand_depth(token, 0)
    }

    fn expand_depth(&self, token: &str, depth: usize) -> String {
        if depth > 8 {
            return token.to_string();
        }
        let dir = format!("{}{}", self.script_dir().display(), MAIN_SEPARATOR);
        let mut out = String::new();
        let mut rest = token;
        let mut changed = false;

        match self.dialect {
            Dialect::Batch => {
                while let Some(pos) = rest.find('%') {
                    out.push_str(&rest[..pos]);
                    let tail = &rest[pos..];
                    if tail.get(..5).map(|p| p.eq_ignore_ascii_case("%~dp0")).unwrap_or(false) {
                        out.push_str(&dir);
                        rest = &tail[5..];
                        changed = true;
                        continue;
                    }
                    let close = tail[1..].find('%').map(|i| i + 1);
                    match close.map(|c| (&tail[1..c], c)) {
                        Some((name, c)) if !name.is_empty() && name.chars().all(|ch| ch.is_alphanumeric() || ch == '_') => {
                            match self.variable(name) {
                                Some(v) => {
                                    out.push_str(&self.expand_depth(v, depth + 1));
                                    changed = true;
                                }
                                None => out.push_str(&tail[..=c]),
                            }
                            rest = &tail[c + 1..];
                        }
                        _ => {
                            out.push('%');
                            rest = &tail[1..];
                        }
                    }
                }
            }
            Dialect::Shell => {
                while let Some(pos) = rest.find('$') {
                    out.push_str(&rest[..pos]);
                    let tail = &rest[pos + 1..];
                    let (name, consumed) = if let Some(inner) = tail.strip_prefix('{') {
                        match inner.find('}') {
                            Some(end) => (&inner[..end], end + 2),
                            None => ("", 0),
                        }
                    } else {
                        let end = tail
                            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                            .unwrap_or(tail.len());
                        (&tail[..end], end)
                    };
                    if name.is_empty() {
                        out.push('$');
                        rest = tail;
                        continue;
                    }
                    if name == "SCRIPT_DIR" {
                        out.push_str(&self.script_dir().display().to_string());
                        changed = true;
                    } else if let Some(v) = self.variable(name) {
                        out.push_str(&self.expand_depth(v, depth + 1));
                        changed = true;
                    } else {
                        out.push('$');
                        out.push_str(&tail[..consumed]);
                    }
                    rest = &tail[consumed..];
                }
            }
        }
        out.push_str(rest);

        if changed && MAIN_SEPARATOR != '\\' {
            out = out.replace('\\', "/");
        }
        out
    }

    pub fn resolved_executable(&self) -> PathBuf {
        PathBuf::from(self.expand(&self.executable))
    }

    /// Global args and all rule blocks joined by `--new`, expanded
    pub fn full_args(&self) -> Vec<String> {
        let mut args: Vec<String> = self.global_args.iter().map(|a| self.expand(a)).collect();
        for (i, rule) in self.rules.iter().enumerate() {
            if i > 0 {
                args.push(NEW_BLOCK.to_string());
            }
            args.extend(rule.args().map(|a| self.expand(a)));
        }
        args
    }

    /// Rule strategy as a probe-able strategy (expanded, no prefix args)
    pub fn rule_strategy(&self, idx: usize) -> Result<Strategy> {
        let rule = self
            .rules
            .get(idx)
            .ok_or_else(|| ManagerError::config(format!("rule {} out of range", idx + 1)))?;
        let check = rule
            .check()
            .ok_or_else(|| ManagerError::config(format!("rule {} has no testable filter", idx + 1)))?;
        let args = rule.strategy_args.iter().map(|a| self.expand(a)).collect();
        Strategy::new(StrategyId::PresetRule(idx), check.protocol(), args)
    }

    /// `<stem>_adjusted.<ext>` next to this preset
    pub fn adjusted_path(&self) -> PathBuf {
        let stem = self.path.file_stem().and_then(|s| s.to_str()).unwrap_or("preset");
        let name = match self.path.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{}_adjusted.{}", stem, ext),
            None => format!("{}_adjusted", stem),
        };
        self.path.with_file_name(name)
    }

    // ── Writing ──

    fn quote(&self, token: &str) -> String {
        let needs = token.is_empty()
            || token.contains(char::is_whitespace)
            || token.contains('%')
            || token.contains('$');
        if !needs {
            return token.to_string();
        }
        match token.split_once('=') {
            Some((key, value)) if key.starts_with("--") => format!("{}=\"{}\"", key, value),
            _ => format!("\"{}\"", token),
        }
    }

    fn command_head(&self) -> String {
        let exe = format!("\"{}\"", self.executable);
        let mut head = match self.dialect {
            Dialect::Batch => {
                let title = self.title.clone().unwrap_or_else(|| "zapret: auto-adjusted".to_string());
                format!("start \"{}\" /min {}", title, exe)
            }
            Dialect::Shell => format!("exec {}", exe),
        };
        for arg in &self.global_args {
            head.push(' ');
            head.push_str(&self.quote(arg));
        }
        head
    }

    /// Render the script text
    pub fn render(&self) -> String {
        let mut out = String::new();
        let newline = match self.dialect {
            Dialect::Batch => "\r\n",
            Dialect::Shell => "\n",
        };
        let cont = self.dialect.continuation();

        for line in &self.lines {
            match (line, self.dialect) {
                (ScriptLine::Raw(text), _) => out.push_str(text),
                (ScriptLine::Assign { name, value }, Dialect::Batch) => {
                    let _ = write!(out, "set \"{}={}\"", name, value);
                }
                (ScriptLine::Assign { name, value }, Dialect::Shell) => {
                    let _ = write!(out, "{}=\"{}\"", name, value);
                }
                (ScriptLine::Command, _) => {
                    out.push_str(&self.command_head());
                    for (i, rule) in self.rules.iter().enumerate() {
                        let _ = write!(out, " {}{}", cont, newline);
                        let args: Vec<String> = rule.args().map(|a| self.quote(a)).collect();
                        out.push_str(&args.join(" "));
                        if i + 1 < self.rules.len() {
                            out.push(' ');
                            out.push_str(NEW_BLOCK);
                        }
                    }
                }
            }
            out.push_str(newline);
        }
        out
    }

    /// Write the rendered script in the encoding it was read in
    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.encoding.encode(&self.render()))?;
        info!("💾 Wrote preset {} ({:?})", path.display(), self.encoding);
        Ok(())
    }
}

/// Split engine args into global args and `--new`-separated rules.
/// Rules start at the first `--filter-*` token.
fn split_rules(tokens: &[String]) -> (Vec<String>, Vec<PresetRule>) {
    let Some(first) = tokens.iter().position(|t| t.starts_with("--filter-")) else {
        return (tokens.to_vec(), Vec::new());
    };

    let mut rules = Vec::new();
    let mut current = PresetRule::default();
    for token in &tokens[first..] {
        if token == NEW_BLOCK {
            if !current.is_empty() {
                rules.push(std::mem::take(&mut current));
            }
            continue;
        }
        current.push(token.clone());
    }
    if !current.is_empty() {
        rules.push(current);
    }
    (tokens[..first].to_vec(), rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathSettings;
    use std::collections::BTreeMap;

    const GENERAL_BAT: &str = r#"@echo off
chcp 65001 > nul
cd /d "%~dp0"
set "BIN=%~dp0bin\"
set "LISTS=%~dp0lists\"

start "zapret: general" /min "%BIN%winws.exe" --wf-tcp=80,443 --wf-udp=443 ^
--filter-udp=443 --hostlist="%LISTS%list-general.txt" --dpi-desync=fake --dpi-desync-repeats=6 --dpi-desync-fake-quic="%BIN%quic_initial_www_google_com.bin" --new ^
--filter-tcp=80 --hostlist="%LISTS%list-general.txt" --dpi-desync=fake,split2 --dpi-desync-autottl=2 --dpi-desync-fooling=md5sig --new ^
--filter-tcp=443 --ipset="%LISTS%ipset-all.txt" --dpi-desync=fake --dpi-desync-fake-tls="%BIN%tls_clienthello_www_google_com.bin"
"#;

    const GENERAL_SH: &str = r#"#!/bin/sh
SCRIPT_DIR="$(cd "$(dirname "$0")" && pwd)"
BIN="$SCRIPT_DIR/bin/"
LISTS="$SCRIPT_DIR/lists/"

exec "${BIN}nfqws" --qnum=200 --uid=0:0 \
  --filter-tcp=443 --hostlist="${LISTS}list-general.txt" --dpi-desync=fake --dpi-desync-fake-tls="${BIN}tls_clienthello.bin" --new \
  --filter-udp=443 --hostlist="${LISTS}list-general.txt" --dpi-desync=fake --dpi-desync-repeats=6
"#;

    fn batch() -> Preset {
        Preset::parse(Path::new("/opt/zapret/general.bat"), Dialect::Batch, GENERAL_BAT).unwrap()
    }

    #[test]
    fn test_tokenize_strips_quotes() {
        assert_eq!(
            tokenize(r#"start "" /min "C:\a b\winws.exe" --x="y z""#),
            vec!["start", "", "/min", r"C:\a b\winws.exe", "--x=y z"]
        );
    }

    #[test]
    fn test_parse_batch_preset() {
        let preset = batch();
        assert_eq!(preset.title.as_deref(), Some("zapret: general"));
        assert_eq!(preset.executable, "%BIN%winws.exe");
        assert_eq!(preset.global_args, vec!["--wf-tcp=80,443", "--wf-udp=443"]);
        assert_eq!(preset.rules.len(), 3);
        assert_eq!(preset.lines.len(), 7);
        assert_eq!(preset.lines[2], ScriptLine::Raw("cd /d \"%~dp0\"".into()));
        assert_eq!(preset.lines[6], ScriptLine::Command);
        assert_eq!(preset.variable("bin"), Some("%~dp0bin\\"));

        let quic = &preset.rules[0];
        assert_eq!(quic.check(), Some(CheckKind::Http3));
        assert_eq!(quic.prefix_args, vec!["--filter-udp=443", "--hostlist=%LISTS%list-general.txt"]);
        assert_eq!(quic.strategy_args[1], "--dpi-desync-repeats=6");

        assert_eq!(
            preset.rules[1].category(),
            Some((CheckKind::Http, "fake,split2".to_string()))
        );
        assert_eq!(preset.rules[2].check(), Some(CheckKind::HttpsTls13));
    }

    #[test]
    fn test_expand_and_full_args() {
        let preset = batch();
        assert_eq!(preset.resolved_executable(), PathBuf::from("/opt/zapret/bin/winws.exe"));

        let args = preset.full_args();
        assert_eq!(args.iter().filter(|a| *a == NEW_BLOCK).count(), 2);
        assert!(args.contains(&"--hostlist=/opt/zapret/lists/list-general.txt".to_string()));

        let strategy = preset.rule_strategy(2).unwrap();
        assert_eq!(strategy.id, StrategyId::PresetRule(2));
        assert_eq!(
            strategy.args[1],
            "--dpi-desync-fake-tls=/opt/zapret/bin/tls_clienthello_www_google_com.bin"
        );
    }

    #[test]
    fn test_parse_shell_preset() {
        let preset =
            Preset::parse(Path::new("/srv/zapret/general.sh"), Dialect::Shell, GENERAL_SH).unwrap();
        assert_eq!(preset.executable, "${BIN}nfqws");
        assert_eq!(preset.global_args, vec!["--qnum=200", "--uid=0:0"]);
        assert_eq!(preset.rules.len(), 2);
        assert_eq!(preset.resolved_executable(), PathBuf::from("/srv/zapret/bin/nfqws"));
        assert_eq!(
            preset.expand(&preset.rules[0].prefix_args[1]),
            "--hostlist=/srv/zapret/lists/list-general.txt"
        );
    }

    #[test]
    fn test_adjusted_round_trip_batch() {
        let preset = batch();
        let mut choices = BTreeMap::new();
        choices.insert(
            2,
            vec![
                "--dpi-desync=fake".to_string(),
                "--dpi-desync-fake-tls=%~dp0bin\\tls_clienthello_4pda_to.bin".to_string(),
            ],
        );
        let adjusted = crate::selector::assemble(&preset, &choices, &PathSettings::default());
        let text = adjusted.render();
        let reparsed = Preset::parse(&preset.adjusted_path(), Dialect::Batch, &text).unwrap();

        assert_eq!(reparsed.global_args, preset.global_args);
        assert_eq!(reparsed.rules.len(), 3);
        for (a, b) in reparsed.rules.iter().zip(adjusted.rules.iter()) {
            assert_eq!(a.strategy_args, b.strategy_args);
            assert_eq!(a.prefix_args, b.prefix_args);
        }
        assert_eq!(reparsed.rules[0], preset.rules[0]);
        assert_eq!(reparsed.lines, preset.lines);
    }

    #[test]
    fn test_adjusted_round_trip_shell() {
        let preset =
            Preset::parse(Path::new("/srv/zapret/general.sh"), Dialect::Shell, GENERAL_SH).unwrap();
        let mut choices = BTreeMap::new();
        choices.insert(0, vec!["--dpi-desync=fake".to_string(), "--dpi-desync-fake-tls=%BIN%tls.bin".to_string()]);
        let adjusted = crate::selector::assemble(&preset, &choices, &PathSettings::default());
        assert_eq!(adjusted.rules[0].strategy_args[1], "--dpi-desync-fake-tls=${BIN}tls.bin");

        let reparsed = Preset::parse(&preset.adjusted_path(), Dialect::Shell, &adjusted.render()).unwrap();
        assert_eq!(reparsed.rules, adjusted.rules);
        assert_eq!(reparsed.executable, "${BIN}nfqws");
        assert_eq!(reparsed.expand(&reparsed.rules[0].strategy_args[1]), "--dpi-desync-fake-tls=/srv/zapret/bin/tls.bin");
    }

    #[test]
    fn test_render_keeps_shell_line_order() {
        let text = "#!/bin/sh\n\
SCRIPT_DIR=\"$(cd \"$(dirname \"$0\")\" && pwd)\"\n\
cd \"$SCRIPT_DIR\"\n\
BIN=\"$SCRIPT_DIR/bin/\"\n\
\n\
exec \"${BIN}nfqws\" --qnum=200 \\\n\
--filter-tcp=443 --dpi-desync=fake\n\
echo unreachable\n";
        let preset = Preset::parse(Path::new("/srv/zapret/general.sh"), Dialect::Shell, text).unwrap();
        assert_eq!(preset.lines.last(), Some(&ScriptLine::Raw("echo unreachable".into())));

        let rendered = preset.render();
        assert_eq!(rendered, text);
        let cd = rendered.find("cd \"$SCRIPT_DIR\"").unwrap();
        assert!(cd < rendered.find("BIN=").unwrap());
        assert!(rendered.find("exec ").unwrap() < rendered.find("echo unreachable").unwrap());
    }

    #[test]
    fn test_render_keeps_batch_line_order_and_last_assignment_wins() {
        let text = "@echo off\r\n\
set \"BIN=%~dp0old\\\"\r\n\
cd /d \"%BIN%\"\r\n\
set \"BIN=%~dp0bin\\\"\r\n\
start \"zapret\" /min \"%BIN%winws.exe\" --wf-tcp=443 ^\r\n\
--filter-tcp=443 --dpi-desync=fake\r\n\
exit /b\r\n";
        let preset = Preset::parse(Path::new("/opt/zapret/general.bat"), Dialect::Batch, text).unwrap();
        assert_eq!(preset.render(), text);
        assert_eq!(preset.resolved_executable(), PathBuf::from("/opt/zapret/bin/winws.exe"));
        assert_eq!(preset.assignments().count(), 2);
    }

    #[test]
    fn test_cp866_preset_keeps_title_and_code_page() {
        let dir = std::env::temp_dir().join(format!("zm-preset-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        // "Запрет" in cp866
        let title: &[u8] = &[0x87, 0xA0, 0xAF, 0xE0, 0xA5, 0xE2];
        let mut bytes = b"@echo off\r\nstart \"".to_vec();
        bytes.extend_from_slice(title);
        bytes.extend_from_slice(b"\" /min \"%~dp0bin\\winws.exe\" --wf-tcp=443 ^\r\n--filter-tcp=443 --dpi-desync=fake\r\n");
        let path = dir.join("general.bat");
        std::fs::write(&path, &bytes).unwrap();

        let preset = Preset::load(&path).unwrap();
        assert_eq!(preset.encoding, TextEncoding::Cp866);
        assert_eq!(preset.title.as_deref(), Some("Запрет"));
        assert_eq!(preset.rules.len(), 1);

        preset.write_to(&preset.adjusted_path()).unwrap();
        let written = std::fs::read(preset.adjusted_path()).unwrap();
        assert!(written.windows(title.len()).any(|w| w == title));
        assert!(std::str::from_utf8(&written).is_err());
        assert_eq!(Preset::load(&preset.adjusted_path()).unwrap().title.as_deref(), Some("Запрет"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_decode_prefers_utf8_then_cyrillic_code_page() {
        assert_eq!(TextEncoding::decode("Запрет".as_bytes()), (TextEncoding::Utf8, "Запрет".to_string()));
        // "Запрет" in cp1251
        let ansi: [u8; 6] = [0xC7, 0xE0, 0xEF, 0xF0, 0xE5, 0xF2];
        assert_eq!(TextEncoding::decode(&ansi), (TextEncoding::Cp1251, "Запрет".to_string()));
        assert_eq!(TextEncoding::Cp1251.encode("Запрет"), ansi.to_vec());
    }

    #[test]
    fn test_adjusted_path_and_dialect() {
        assert_eq!(batch().adjusted_path(), PathBuf::from("/opt/zapret/general_adjusted.bat"));
        assert_eq!(Dialect::from_path(Path::new("x.CMD")).unwrap(), Dialect::Batch);
        assert!(Dialect::from_path(Path::new("x.txt")).is_err());
    }

    #[test]
    fn test_missing_command_is_config_error() {
        let err = Preset::parse(Path::new("a.bat"), Dialect::Batch, "@echo off\r\n").unwrap_err();
        assert!(matches!(err, ManagerError::Config(_)));
    }
}
