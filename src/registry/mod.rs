pub mod schema;
pub mod state;

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

/// One registered repository: collection, embedding model, stack type and
/// the last indexing run's status record.
#[derive(Debug, Clone, Serialize)]
pub struct RepoEntry {
    pub repo_id: String,
    pub name: String,
    pub stack_type: Option<String>,
    pub collection_name: String,
    pub embedding_model: String,
    pub last_indexed_commit: Option<String>,
    pub archived: bool,
}

/// Last run record, persisted on every state-machine transition and
/// periodically (advisory) while a run is in flight.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStatus {
    pub last_indexed_commit: Option<String>,
    pub last_indexed_at: Option<String>,
    pub mode: Option<String>,
    pub status: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub total_files: Option<i64>,
    pub processed_files: Option<i64>,
    pub current_file: Option<String>,
}

/// Partial update for the run-status columns; only `Some` fields are written.
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    pub last_indexed_commit: Option<String>,
    pub status: Option<String>,
    pub mode: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub error: Option<String>,
    pub total_files: Option<i64>,
    pub processed_files: Option<i64>,
    pub current_file: Option<String>,
}

impl StatusPatch {
    pub fn running(mode: &str) -> Self {
        Self {
            status: Some("running".into()),
            mode: Some(mode.into()),
            started_at: Some(now()),
            ..Self::default()
        }
    }

    pub fn progress(mode: &str, processed: usize, total: usize, file: &str) -> Self {
        Self {
            status: Some("running".into()),
            mode: Some(mode.into()),
            processed_files: Some(processed as i64),
            total_files: Some(total as i64),
            current_file: Some(file.into()),
            ..Self::default()
        }
    }

    pub fn completed(mode: &str, commit: &str, processed: usize, total: usize) -> Self {
        Self {
            status: Some("completed".into()),
            mode: Some(mode.into()),
            last_indexed_commit: Some(commit.into()),
            finished_at: Some(now()),
            processed_files: Some(processed as i64),
            total_files: Some(total as i64),
            ..Self::default()
        }
    }

    pub fn noop(mode: &str) -> Self {
        Self {
            status: Some("noop".into()),
            mode: Some(mode.into()),
            finished_at: Some(now()),
            ..Self::default()
        }
    }

    pub fn error(mode: &str, message: &str) -> Self {
        Self {
            status: Some("error".into()),
            mode: Some(mode.into()),
            error: Some(message.into()),
            finished_at: Some(now()),
            ..Self::default()
        }
    }
}

/// Defaults used when a repo id is seen for the first time.
#[derive(Debug, Clone)]
pub struct RepoDefaults {
    pub name: String,
    pub collection_name: String,
    pub embedding_model: String,
    pub stack_type: Option<String>,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// SQLite-backed repository registry. The sole system-of-record for per-repo
/// metadata and run status; indexed content lives in the vector store.
pub struct Registry {
    conn: Connection,
}

impl Registry {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating registry dir {}", parent.display()))?;
            }
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("opening registry at {}", db_path.display()))?;
        schema::run_migrations(&conn)?;
        Ok(Self { conn })
    }

    pub fn get(&self, repo_id: &str) -> Result<Option<RepoEntry>> {
        self.conn
            .query_row(
                "SELECT repo_id, name, stack_type, collection_name, embedding_model,
                        last_indexed_commit, archived
                 FROM repos WHERE repo_id = ?1",
                params![repo_id],
                |row| {
                    Ok(RepoEntry {
                        repo_id: row.get(0)?,
                        name: row.get(1)?,
                        stack_type: row.get(2)?,
                        collection_name: row.get(3)?,
                        embedding_model: row.get(4)?,
                        last_indexed_commit: row.get(5)?,
                        archived: row.get::<_, i64>(6)? != 0,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    /// Fetch the repo, creating it with the given defaults on first touch.
    pub fn ensure(&self, repo_id: &str, defaults: &RepoDefaults) -> Result<RepoEntry> {
        if let Some(existing) = self.get(repo_id)? {
            return Ok(existing);
        }
        let ts = now();
        self.conn.execute(
            "INSERT OR IGNORE INTO repos
                (repo_id, name, stack_type, collection_name, embedding_model, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                repo_id,
                defaults.name,
                defaults.stack_type,
                defaults.collection_name,
                defaults.embedding_model,
                ts
            ],
        )?;
        self.get(repo_id)?.context("repo row missing after insert")
    }

    pub fn set_stack_type(&self, repo_id: &str, stack_type: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE repos SET stack_type = ?2, updated_at = ?3 WHERE repo_id = ?1",
            params![repo_id, stack_type, now()],
        )?;
        Ok(())
    }

    pub fn set_archived(&self, repo_id: &str, archived: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE repos SET archived = ?2, updated_at = ?3 WHERE repo_id = ?1",
            params![repo_id, archived as i64, now()],
        )?;
        Ok(())
    }

    pub fn delete(&self, repo_id: &str) -> Result<()> {
        self.conn.execute("DELETE FROM repos WHERE repo_id = ?1", params![repo_id])?;
        Ok(())
    }

    pub fn list(&self, include_archived: bool) -> Result<Vec<RepoEntry>> {
        let sql = if include_archived {
            "SELECT repo_id, name, stack_type, collection_name, embedding_model,
                    last_indexed_commit, archived
             FROM repos ORDER BY repo_id"
        } else {
            "SELECT repo_id, name, stack_type, collection_name, embedding_model,
                    last_indexed_commit, archived
             FROM repos WHERE archived = 0 ORDER BY repo_id"
        };
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| {
            Ok(RepoEntry {
                repo_id: row.get(0)?,
                name: row.get(1)?,
                stack_type: row.get(2)?,
                collection_name: row.get(3)?,
                embedding_model: row.get(4)?,
                last_indexed_commit: row.get(5)?,
                archived: row.get::<_, i64>(6)? != 0,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Apply a partial run-status update. A finish timestamp also stamps
    /// `last_indexed_at`, matching the run's terminal transition.
    pub fn update_status(&self, repo_id: &str, patch: &StatusPatch) -> Result<()> {
        let mut updates: Vec<(&str, Box<dyn rusqlite::types::ToSql>)> = Vec::new();

        if let Some(v) = &patch.last_indexed_commit {
            updates.push(("last_indexed_commit", Box::new(v.clone())));
        }
        if let Some(v) = &patch.status {
            updates.push(("last_index_status", Box::new(v.clone())));
        }
        if let Some(v) = &patch.mode {
            updates.push(("last_index_mode", Box::new(v.clone())));
        }
        if let Some(v) = &patch.started_at {
            updates.push(("last_index_started_at", Box::new(v.clone())));
        }
        if let Some(v) = &patch.finished_at {
            updates.push(("last_index_finished_at", Box::new(v.clone())));
            updates.push(("last_indexed_at", Box::new(v.clone())));
        }
        if let Some(v) = &patch.error {
            updates.push(("last_index_error", Box::new(v.clone())));
        }
        if let Some(v) = patch.total_files {
            updates.push(("last_index_total_files", Box::new(v)));
        }
        if let Some(v) = patch.processed_files {
            updates.push(("last_index_processed_files", Box::new(v)));
        }
        if let Some(v) = &patch.current_file {
            updates.push(("last_index_current_file", Box::new(v.clone())));
        }

        if updates.is_empty() {
            return Ok(());
        }
        updates.push(("updated_at", Box::new(now())));

        // ?1 is the repo id; value placeholders start at ?2.
        let sets: Vec<String> = updates
            .iter()
            .enumerate()
            .map(|(i, (column, _))| format!("{column} = ?{}", i + 2))
            .collect();
        let sql = format!("UPDATE repos SET {} WHERE repo_id = ?1", sets.join(", "));

        let mut bound: Vec<&dyn rusqlite::types::ToSql> =
            vec![&repo_id as &dyn rusqlite::types::ToSql];
        bound.extend(updates.iter().map(|(_, v)| v.as_ref()));
        self.conn.execute(&sql, bound.as_slice())?;
        Ok(())
    }

    pub fn run_status(&self, repo_id: &str) -> Result<Option<RunStatus>> {
        self.conn
            .query_row(
                "SELECT last_indexed_commit, last_indexed_at, last_index_mode, last_index_status,
                        last_index_error, last_index_started_at, last_index_finished_at,
                        last_index_total_files, last_index_processed_files, last_index_current_file
                 FROM repos WHERE repo_id = ?1",
                params![repo_id],
                |row| {
                    Ok(RunStatus {
                        last_indexed_commit: row.get(0)?,
                        last_indexed_at: row.get(1)?,
                        mode: row.get(2)?,
                        status: row.get(3)?,
                        error: row.get(4)?,
                        started_at: row.get(5)?,
                        finished_at: row.get(6)?,
                        total_files: row.get(7)?,
                        processed_files: row.get(8)?,
                        current_file: row.get(9)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_registry() -> (TempDir, Registry) {
        let dir = TempDir::new().unwrap();
        let registry = Registry::open(&dir.path().join("registry.db")).unwrap();
        (dir, registry)
    }

    fn defaults() -> RepoDefaults {
        RepoDefaults {
            name: "demo".into(),
            collection_name: "burrow-dev-model".into(),
            embedding_model: "model".into(),
            stack_type: None,
        }
    }

    #[test]
    fn ensure_creates_then_returns_existing() {
        let (_dir, registry) = test_registry();
        let created = registry.ensure("demo", &defaults()).unwrap();
        assert_eq!(created.repo_id, "demo");
        assert_eq!(created.collection_name, "burrow-dev-model");
        assert!(!created.archived);

        let again = registry
            .ensure("demo", &RepoDefaults { collection_name: "other".into(), ..defaults() })
            .unwrap();
        // First write wins; defaults never clobber an existing row.
        assert_eq!(again.collection_name, "burrow-dev-model");
    }

    #[test]
    fn get_missing_returns_none() {
        let (_dir, registry) = test_registry();
        assert!(registry.get("nope").unwrap().is_none());
    }

    #[test]
    fn status_patch_round_trip() {
        let (_dir, registry) = test_registry();
        registry.ensure("demo", &defaults()).unwrap();

        registry.update_status("demo", &StatusPatch::running("full")).unwrap();
        let status = registry.run_status("demo").unwrap().unwrap();
        assert_eq!(status.status.as_deref(), Some("running"));
        assert_eq!(status.mode.as_deref(), Some("full"));
        assert!(status.started_at.is_some());
        assert!(status.finished_at.is_none());

        registry.update_status("demo", &StatusPatch::progress("full", 3, 10, "src/a.py")).unwrap();
        let status = registry.run_status("demo").unwrap().unwrap();
        assert_eq!(status.processed_files, Some(3));
        assert_eq!(status.total_files, Some(10));
        assert_eq!(status.current_file.as_deref(), Some("src/a.py"));

        registry.update_status("demo", &StatusPatch::completed("full", "abc123", 10, 10)).unwrap();
        let status = registry.run_status("demo").unwrap().unwrap();
        assert_eq!(status.status.as_deref(), Some("completed"));
        assert_eq!(status.last_indexed_commit.as_deref(), Some("abc123"));
        assert!(status.finished_at.is_some());
        assert!(status.last_indexed_at.is_some());
    }

    #[test]
    fn error_status_records_message() {
        let (_dir, registry) = test_registry();
        registry.ensure("demo", &defaults()).unwrap();
        registry.update_status("demo", &StatusPatch::error("update", "embedding timeout")).unwrap();
        let status = registry.run_status("demo").unwrap().unwrap();
        assert_eq!(status.status.as_deref(), Some("error"));
        assert_eq!(status.error.as_deref(), Some("embedding timeout"));
    }

    #[test]
    fn archive_and_list() {
        let (_dir, registry) = test_registry();
        registry.ensure("a", &defaults()).unwrap();
        registry.ensure("b", &defaults()).unwrap();
        registry.set_archived("a", true).unwrap();

        let active = registry.list(false).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].repo_id, "b");

        let all = registry.list(true).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn set_stack_type_updates_row() {
        let (_dir, registry) = test_registry();
        registry.ensure("demo", &defaults()).unwrap();
        registry.set_stack_type("demo", "android_app").unwrap();
        assert_eq!(registry.get("demo").unwrap().unwrap().stack_type.as_deref(), Some("android_app"));
    }

    #[test]
    fn delete_removes_row() {
        let (_dir, registry) = test_registry();
        registry.ensure("demo", &defaults()).unwrap();
        registry.delete("demo").unwrap();
        assert!(registry.get("demo").unwrap().is_none());
    }
}
