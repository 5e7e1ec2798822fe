use crate::error::{Result, StackupError};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const STATE_DIR: &str = ".stackup";
pub const SNAPSHOTS_DIR: &str = ".stackup/snapshots";
pub const RENDERED_DIR: &str = ".stackup/rendered";

pub const STACK_FILE: &str = ".stackup/stack.yaml";
pub const STATE_DB: &str = ".stackup/state.redb";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn state_dir(root: &Path) -> PathBuf {
    root.join(STATE_DIR)
}

pub fn stack_path(root: &Path) -> PathBuf {
    root.join(STACK_FILE)
}

pub fn state_db_path(root: &Path) -> PathBuf {
    root.join(STATE_DB)
}

pub fn snapshots_dir(root: &Path) -> PathBuf {
    root.join(SNAPSHOTS_DIR)
}

/// Default location for a component's rendered configuration when the stack
/// file does not name one.
pub fn rendered_config_path(root: &Path, component: &str) -> PathBuf {
    root.join(RENDERED_DIR).join(format!("{component}.conf"))
}

// ---------------------------------------------------------------------------
// Component name validation
// ---------------------------------------------------------------------------

static NAME_RE: OnceLock<Regex> = OnceLock::new();

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9\-]*[a-z0-9]$|^[a-z0-9]$").unwrap())
}

/// Component names double as redb key prefixes and snapshot directory names,
/// so they are restricted to a path- and key-safe alphabet.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 || !name_re().is_match(name) {
        return Err(StackupError::InvalidComponentName(name.to_string()));
    }
    Ok(())
}

/// Environment-variable stem for a component: `secrets-manager` → `SECRETS_MANAGER`.
pub fn env_stem(name: &str) -> String {
    name.to_ascii_uppercase().replace('-', "_")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
