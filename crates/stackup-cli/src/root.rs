use stackup_core::paths::STATE_DIR;
use std::path::{Path, PathBuf};

/// Resolve the directory holding `.stackup/`.
///
/// Priority:
/// 1. `--root` / `STACKUP_ROOT`
/// 2. nearest ancestor of cwd containing `.stackup/`
/// 3. nearest ancestor of cwd containing `.git/`
/// 4. cwd
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    resolve_from(&cwd)
}

fn resolve_from(start: &Path) -> PathBuf {
    find_upward(start, STATE_DIR)
        .or_else(|| find_upward(start, ".git"))
        .unwrap_or_else(|| start.to_path_buf())
}

fn find_upward(start: &Path, marker: &str) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(marker).is_dir())
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn explicit_root_wins() {
        let dir = TempDir::new().unwrap();
        assert_eq!(resolve_root(Some(dir.path())), dir.path());
    }

    #[test]
    fn state_dir_beats_git() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        let project = dir.path().join("infra");
        std::fs::create_dir_all(project.join(STATE_DIR)).unwrap();
        let deep = project.join("jobs/vault");
        std::fs::create_dir_all(&deep).unwrap();

        assert_eq!(resolve_from(&deep), project);
    }

    #[test]
    fn falls_back_to_git_then_start() {
        let dir = TempDir::new().unwrap();
        let plain = dir.path().join("a/b");
        std::fs::create_dir_all(&plain).unwrap();
        // Unless the temp dir itself sits inside a repository.
        if find_upward(dir.path(), ".git").is_none() && find_upward(dir.path(), STATE_DIR).is_none() {
            assert_eq!(resolve_from(&plain), plain);
        }

        std::fs::create_dir_all(dir.path().join("a/.git")).unwrap();
        if find_upward(dir.path(), STATE_DIR).is_none() {
            assert_eq!(resolve_from(&plain), dir.path().join("a"));
        }
    }
}
