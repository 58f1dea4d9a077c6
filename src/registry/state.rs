use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::IndexError;

/// Load the {repo_id -> last_indexed_commit} cache. A missing file is an
/// empty map.
pub fn load_state(state_file: &Path) -> Result<HashMap<String, String>> {
    if !state_file.exists() {
        return Ok(HashMap::new());
    }
    let raw = std::fs::read_to_string(state_file)
        .with_context(|| format!("reading state file {}", state_file.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing state file {}", state_file.display()))
}

pub fn save_state(state_file: &Path, state: &HashMap<String, String>) -> Result<()> {
    let raw = serde_json::to_string(state)?;
    std::fs::write(state_file, raw)
        .with_context(|| format!("writing state file {}", state_file.display()))
}

/// The registry row is authoritative; refresh the cache entry when the two
/// disagree.
pub fn sync_state_with_registry(
    state_file: &Path,
    repo_id: &str,
    last_indexed_commit: Option<&str>,
) -> Result<()> {
    let Some(commit) = last_indexed_commit else {
        return Ok(());
    };
    let mut state = load_state(state_file)?;
    if state.get(repo_id).map(String::as_str) == Some(commit) {
        return Ok(());
    }
    state.insert(repo_id.to_string(), commit.to_string());
    save_state(state_file, &state)
}

/// Direct children of the repos root that are git repositories.
pub fn list_git_repositories(repos_dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(repos_dir) else {
        return Vec::new();
    };
    let mut repos: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir() && e.path().join(".git").exists())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    repos.sort();
    repos
}

/// Resolve a repo id to its directory, rejecting anything that is not a
/// git repository.
pub fn repo_path(repos_dir: &Path, repo_id: &str) -> Result<PathBuf> {
    let path = repos_dir.join(repo_id);
    if !path.exists() || !path.join(".git").exists() {
        return Err(IndexError::InvalidRequest(format!("invalid repo: {repo_id}")).into());
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_state_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let state = load_state(&dir.path().join("state.json")).unwrap();
        assert!(state.is_empty());
    }

    #[test]
    fn state_round_trip() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("state.json");
        let mut state = HashMap::new();
        state.insert("demo".to_string(), "abc123".to_string());
        save_state(&file, &state).unwrap();
        assert_eq!(load_state(&file).unwrap(), state);
    }

    #[test]
    fn sync_prefers_registry_value() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("state.json");
        let mut state = HashMap::new();
        state.insert("demo".to_string(), "stale".to_string());
        save_state(&file, &state).unwrap();

        sync_state_with_registry(&file, "demo", Some("fresh")).unwrap();
        assert_eq!(load_state(&file).unwrap().get("demo").map(String::as_str), Some("fresh"));

        // No registry value: cache untouched.
        sync_state_with_registry(&file, "demo", None).unwrap();
        assert_eq!(load_state(&file).unwrap().get("demo").map(String::as_str), Some("fresh"));
    }

    #[test]
    fn repo_path_rejects_non_git_dirs() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("plain")).unwrap();
        let err = repo_path(dir.path(), "plain").unwrap_err();
        assert!(matches!(
            crate::error::IndexError::find_in(&err),
            Some(crate::error::IndexError::InvalidRequest(_))
        ));
        assert!(repo_path(dir.path(), "missing").is_err());
    }

    #[test]
    fn list_repositories_finds_git_children() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("a/.git")).unwrap();
        std::fs::create_dir_all(dir.path().join("b")).unwrap();
        assert_eq!(list_git_repositories(dir.path()), vec!["a".to_string()]);
    }
}
