use anyhow::Result;
use rusqlite::Connection;

pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;

        CREATE TABLE IF NOT EXISTS repos (
            id                         INTEGER PRIMARY KEY,
            repo_id                    TEXT NOT NULL UNIQUE,
            name                       TEXT NOT NULL,
            stack_type                 TEXT,
            collection_name            TEXT NOT NULL,
            embedding_model            TEXT NOT NULL,
            last_indexed_commit        TEXT,
            last_indexed_at            TEXT,
            last_index_mode            TEXT,
            last_index_status          TEXT,
            last_index_error           TEXT,
            last_index_started_at      TEXT,
            last_index_finished_at     TEXT,
            last_index_total_files     INTEGER,
            last_index_processed_files INTEGER,
            last_index_current_file    TEXT,
            archived                   INTEGER NOT NULL DEFAULT 0,
            created_at                 TEXT NOT NULL,
            updated_at                 TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_repos_repo_id ON repos(repo_id);
        CREATE INDEX IF NOT EXISTS idx_repos_stack_type ON repos(stack_type);
    ",
    )?;
    Ok(())
}
