use std::path::Path;

use rusqlite::Connection;
use tracing::info;

use crate::error::Result;

pub fn open(path: &Path) -> Result<Connection> {
    info!("opening knowledge database at {}", path.display());
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;

    conn.execute_batch("PRAGMA journal_mode = WAL;")?;

    migrate(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    migrate(&conn)?;
    Ok(conn)
}

/// Run schema migrations.  Idempotent.
pub(crate) fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS knowledge_entries (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            title       TEXT NOT NULL,
            content     TEXT NOT NULL,
            summary     TEXT,
            tags        TEXT NOT NULL DEFAULT '',
            source      TEXT NOT NULL DEFAULT '',
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE VIRTUAL TABLE IF NOT EXISTS knowledge_entries_fts USING fts5(
            title,
            content,
            summary,
            tags,
            content='knowledge_entries',
            content_rowid='id'
        );

        CREATE TRIGGER IF NOT EXISTS knowledge_ai AFTER INSERT ON knowledge_entries BEGIN
            INSERT INTO knowledge_entries_fts(rowid, title, content, summary, tags)
            VALUES (new.id, new.title, new.content, new.summary, new.tags);
        END;

        CREATE TRIGGER IF NOT EXISTS knowledge_ad AFTER DELETE ON knowledge_entries BEGIN
            INSERT INTO knowledge_entries_fts(knowledge_entries_fts, rowid, title, content, summary, tags)
            VALUES ('delete', old.id, old.title, old.content, old.summary, old.tags);
        END;

        CREATE TRIGGER IF NOT EXISTS knowledge_au AFTER UPDATE ON knowledge_entries BEGIN
            INSERT INTO knowledge_entries_fts(knowledge_entries_fts, rowid, title, content, summary, tags)
            VALUES ('delete', old.id, old.title, old.content, old.summary, old.tags);
            INSERT INTO knowledge_entries_fts(rowid, title, content, summary, tags)
            VALUES (new.id, new.title, new.content, new.summary, new.tags);
        END;
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_idempotent() {
        let conn = open_in_memory().unwrap();
        migrate(&conn).unwrap();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM knowledge_entries", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("knowledge.db");
        open(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn fts_index_follows_inserts() {
        let conn = open_in_memory().unwrap();
        conn.execute(
            "INSERT INTO knowledge_entries (title, content) VALUES ('Tokio', 'async runtime')",
            [],
        )
        .unwrap();
        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM knowledge_entries_fts WHERE knowledge_entries_fts MATCH 'runtime'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);
    }
}
