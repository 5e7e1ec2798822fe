//! Typed configuration model for the substrate and its HCL rendering.
//!
//! The model is validated before rendering and the rendered text is checked
//! syntactically before anything is handed to `apply_config`, so a bad value
//! is rejected here instead of by the scheduler's own parser at reload time.

use std::fmt::Write as _;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::driver::ConfigBlob;
use crate::error::{Result, StackupError};

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsMaterial {
    pub ca_file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubstrateConfig {
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_datacenter")]
    pub datacenter: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_true")]
    pub server: bool,
    #[serde(default = "default_bootstrap_expect")]
    pub bootstrap_expect: u32,
    #[serde(default = "default_true")]
    pub client: bool,
    /// Service catalog agent address, e.g. `127.0.0.1:8500`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsMaterial>,
}

fn default_region() -> String {
    "global".to_string()
}

fn default_datacenter() -> String {
    "dc1".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/opt/nomad/data")
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_bootstrap_expect() -> u32 {
    1
}

impl Default for SubstrateConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            datacenter: default_datacenter(),
            data_dir: default_data_dir(),
            bind_addr: default_bind_addr(),
            server: true,
            bootstrap_expect: default_bootstrap_expect(),
            client: true,
            catalog_address: None,
            tls: None,
        }
    }
}

/// Fields populated when the substrate is switched over to the secrets
/// manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecretsIntegration {
    /// Secrets manager endpoint, e.g. `https://vault.service:8200`. Left
    /// empty in `stack.yaml` it is derived from the secrets manager's address.
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_role")]
    pub create_from_role: String,
    #[serde(default = "default_policies")]
    pub policies: Vec<String>,
    #[serde(default = "default_token_ttl")]
    pub task_token_ttl: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsMaterial>,
}

fn default_role() -> String {
    "nomad-cluster".to_string()
}

fn default_policies() -> Vec<String> {
    vec!["nomad-server".to_string()]
}

fn default_token_ttl() -> String {
    "1h".to_string()
}

impl SecretsIntegration {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            create_from_role: default_role(),
            policies: default_policies(),
            task_token_ttl: default_token_ttl(),
            tls: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.address.starts_with("http://") || self.address.starts_with("https://")) {
            return Err(invalid(format!(
                "secrets endpoint '{}' must start with http:// or https://",
                self.address
            )));
        }
        if self.create_from_role.trim().is_empty() {
            return Err(invalid("secrets role must not be empty"));
        }
        if self.policies.is_empty() {
            return Err(invalid("at least one secrets policy is required"));
        }
        for p in &self.policies {
            if p.is_empty() || !p.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
                return Err(invalid(format!("invalid policy name '{p}'")));
            }
        }
        if !is_duration(&self.task_token_ttl) {
            return Err(invalid(format!(
                "task_token_ttl '{}' is not a duration like 30m or 1h",
                self.task_token_ttl
            )));
        }
        if let Some(tls) = &self.tls {
            tls.validate()?;
        }
        Ok(())
    }
}

impl TlsMaterial {
    fn validate(&self) -> Result<()> {
        let paths = std::iter::once(&self.ca_file)
            .chain(self.cert_file.iter())
            .chain(self.key_file.iter());
        for p in paths {
            if !p.is_absolute() {
                return Err(invalid(format!("TLS path '{}' must be absolute", p.display())));
            }
        }
        if self.cert_file.is_some() != self.key_file.is_some() {
            return Err(invalid("cert_file and key_file must be set together"));
        }
        Ok(())
    }
}

impl SubstrateConfig {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("region", &self.region),
            ("datacenter", &self.datacenter),
            ("bind_addr", &self.bind_addr),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(format!("substrate {field} must not be empty")));
            }
        }
        if !self.data_dir.is_absolute() {
            return Err(invalid(format!(
                "substrate data_dir '{}' must be absolute",
                self.data_dir.display()
            )));
        }
        if self.server && self.bootstrap_expect == 0 {
            return Err(invalid("bootstrap_expect must be at least 1 for a server"));
        }
        if !self.server && !self.client {
            return Err(invalid("substrate must run as a server, a client, or both"));
        }
        if let Some(tls) = &self.tls {
            tls.validate()?;
        }
        Ok(())
    }

    /// Render the agent configuration. `None` produces the pre-integration
    /// form with the secrets block explicitly disabled.
    pub fn render(&self, integration: Option<&SecretsIntegration>) -> Result<ConfigBlob> {
        self.validate()?;
        if let Some(i) = integration {
            i.validate()?;
        }

        let mut out = String::new();
        // Writing to a String cannot fail.
        let _ = writeln!(out, "region     = {}", quote(&self.region));
        let _ = writeln!(out, "datacenter = {}", quote(&self.datacenter));
        let _ = writeln!(out, "data_dir   = {}", quote(&self.data_dir.to_string_lossy()));
        let _ = writeln!(out, "bind_addr  = {}", quote(&self.bind_addr));
        out.push('\n');

        let _ = writeln!(out, "server {{");
        let _ = writeln!(out, "  enabled = {}", self.server);
        if self.server {
            let _ = writeln!(out, "  bootstrap_expect = {}", self.bootstrap_expect);
        }
        let _ = writeln!(out, "}}\n");

        let _ = writeln!(out, "client {{");
        let _ = writeln!(out, "  enabled = {}", self.client);
        let _ = writeln!(out, "}}\n");

        if let Some(addr) = &self.catalog_address {
            let _ = writeln!(out, "consul {{");
            let _ = writeln!(out, "  address = {}", quote(addr));
            let _ = writeln!(out, "}}\n");
        }

        if let Some(tls) = &self.tls {
            let _ = writeln!(out, "tls {{");
            let _ = writeln!(out, "  http = true");
            let _ = writeln!(out, "  rpc  = true");
            write_tls_paths(&mut out, tls);
            let _ = writeln!(out, "}}\n");
        }

        let _ = writeln!(out, "vault {{");
        match integration {
            None => {
                let _ = writeln!(out, "  enabled = false");
            }
            Some(i) => {
                let _ = writeln!(out, "  enabled          = true");
                let _ = writeln!(out, "  address          = {}", quote(&i.address));
                let _ = writeln!(out, "  create_from_role = {}", quote(&i.create_from_role));
                let _ = writeln!(out, "  task_token_ttl   = {}", quote(&i.task_token_ttl));
                let policies: Vec<String> = i.policies.iter().map(|p| quote(p)).collect();
                let _ = writeln!(out, "  policies         = [{}]", policies.join(", "));
                if let Some(tls) = &i.tls {
                    write_tls_paths(&mut out, tls);
                }
            }
        }
        let _ = writeln!(out, "}}");

        check_syntax(&out)?;
        Ok(ConfigBlob::from(out))
    }
}

fn write_tls_paths(out: &mut String, tls: &TlsMaterial) {
    let _ = writeln!(out, "  ca_file   = {}", quote(&tls.ca_file.to_string_lossy()));
    if let Some(cert) = &tls.cert_file {
        let _ = writeln!(out, "  cert_file = {}", quote(&cert.to_string_lossy()));
    }
    if let Some(key) = &tls.key_file {
        let _ = writeln!(out, "  key_file  = {}", quote(&key.to_string_lossy()));
    }
}

fn quote(s: &str) -> String {
    let mut q = String::with_capacity(s.len() + 2);
    q.push('"');
    for c in s.chars() {
        match c {
            '"' => q.push_str("\\\""),
            '\\' => q.push_str("\\\\"),
            '\n' => q.push_str("\\n"),
            c => q.push(c),
        }
    }
    q.push('"');
    q
}

fn is_duration(s: &str) -> bool {
    let Some(unit) = s.chars().last() else {
        return false;
    };
    let digits = &s[..s.len() - unit.len_utf8()];
    matches!(unit, 's' | 'm' | 'h') && !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

fn invalid(msg: impl Into<String>) -> StackupError {
    StackupError::InvalidConfig(msg.into())
}

// ---------------------------------------------------------------------------
// Syntax check
// ---------------------------------------------------------------------------

/// Line-oriented check of the HCL subset this module renders: blocks open
/// with `name {` and close with `}`, attributes are `key = value`, strings
/// are terminated, and braces and brackets balance.
pub fn check_syntax(text: &str) -> Result<()> {
    let mut depth = 0usize;
    for (n, raw) in text.lines().enumerate() {
        let line = raw.trim();
        let lineno = n + 1;
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line == "}" {
            depth = depth
                .checked_sub(1)
                .ok_or_else(|| invalid(format!("line {lineno}: unmatched '}}'")))?;
            continue;
        }
        if let Some(name) = line.strip_suffix('{') {
            let name = name.trim();
            if name.is_empty() || !is_ident(name) {
                return Err(invalid(format!("line {lineno}: bad block header '{line}'")));
            }
            depth += 1;
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(invalid(format!("line {lineno}: expected 'key = value', got '{line}'")));
        };
        if !is_ident(key.trim()) {
            return Err(invalid(format!("line {lineno}: bad attribute name '{}'", key.trim())));
        }
        check_value(value.trim()).map_err(|why| invalid(format!("line {lineno}: {why}")))?;
    }
    if depth != 0 {
        return Err(invalid(format!("{depth} unclosed block(s)")));
    }
    Ok(())
}

fn is_ident(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn check_value(v: &str) -> std::result::Result<(), String> {
    if v.is_empty() {
        return Err("missing value".into());
    }
    if v == "true" || v == "false" || v.parse::<i64>().is_ok() {
        return Ok(());
    }
    if let Some(inner) = v.strip_prefix('[') {
        let inner = inner.strip_suffix(']').ok_or("unterminated list")?;
        if inner.trim().is_empty() {
            return Ok(());
        }
        for item in split_list(inner)? {
            check_value(item.trim())?;
        }
        return Ok(());
    }
    if v.starts_with('"') {
        return check_string(v);
    }
    Err(format!("unrecognised value '{v}'"))
}

fn check_string(v: &str) -> std::result::Result<(), String> {
    let mut chars = v.chars().skip(1);
    let mut escaped = false;
    let mut closed_at = None;
    for (i, c) in chars.by_ref().enumerate() {
        match (escaped, c) {
            (true, _) => escaped = false,
            (false, '\\') => escaped = true,
            (false, '"') => {
                closed_at = Some(i);
                break;
            }
            _ => {}
        }
    }
    match closed_at {
        Some(_) if chars.next().is_none() => Ok(()),
        Some(_) => Err("trailing characters after string".into()),
        None => Err("unterminated string".into()),
    }
}

fn split_list(inner: &str) -> std::result::Result<Vec<&str>, String> {
    let mut items = Vec::new();
    let mut start = 0;
    let mut in_str = false;
    let mut escaped = false;
    for (i, c) in inner.char_indices() {
        match (in_str, escaped, c) {
            (true, true, _) => escaped = false,
            (true, false, '\\') => escaped = true,
            (_, false, '"') => in_str = !in_str,
            (false, _, ',') => {
                items.push(&inner[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if in_str {
        return Err("unterminated string in list".into());
    }
    items.push(&inner[start..]);
    Ok(items)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
