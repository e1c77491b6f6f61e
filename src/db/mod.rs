use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::arch::paths;
use crate::document::{Document, DocumentPatch, DocumentUri};
use crate::error::StoreError;
use crate::services::DocumentStore;

pub const DB_FILE_NAME: &str = "opspad.db";

/// Workspace documents persisted as JSON bodies, in tab order.
pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    /// Opens the workspace database under the per-user app data dir.
    pub fn open_default() -> Result<(Self, PathBuf), StoreError> {
        let path = paths::app_data_dir().join(DB_FILE_NAME);
        let db = Self::open(&path)?;
        Ok((db, path))
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> rusqlite::Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            r#"
            create table if not exists documents (
              uri text primary key,
              kind text not null,
              body text not null,
              sort_order integer null,
              updated_at integer not null
            );
            "#,
        )?;

        // Older workspaces were created before tabs could be reordered.
        if !Self::column_exists(&conn, "documents", "sort_order")? {
            conn.execute("alter table documents add column sort_order integer null", [])?;
        }

        Ok(())
    }

    fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
        let mut stmt = conn.prepare(&format!("pragma table_info({table})"))?;
        let mut rows = stmt.query([])?;
        while let Some(r) = rows.next()? {
            let name: String = r.get(1)?;
            if name == column {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn documents_list(&self) -> Result<Vec<Document>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "select body from documents order by sort_order asc nulls last, updated_at asc",
        )?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    pub fn document_get(&self, uri: &DocumentUri) -> Result<Option<Document>, StoreError> {
        let conn = self.lock();
        let body: Option<String> = conn
            .query_row(
                "select body from documents where uri = ?1",
                params![uri.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
    }

    /// Inserts a new document at the end of the tab order, or replaces an existing one in place.
    pub fn document_upsert(&self, document: &Document) -> Result<(), StoreError> {
        let body = serde_json::to_string(document)?;
        let conn = self.lock();
        let next: i64 = conn
            .query_row("select coalesce(max(sort_order), 0) + 1 from documents", [], |r| r.get(0))?;
        conn.execute(
            "insert into documents (uri, kind, body, sort_order, updated_at) values (?1, ?2, ?3, ?4, ?5)\n            on conflict(uri) do update set kind = excluded.kind, body = excluded.body, updated_at = excluded.updated_at",
            params![
                document.uri().as_str(),
                document.kind(),
                body,
                next,
                Self::now_epoch_secs()
            ],
        )?;
        Ok(())
    }

    /// Merges `patch` into the stored document and returns the result.
    pub fn document_patch(&self, uri: &DocumentUri, patch: &DocumentPatch) -> Result<Document, StoreError> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        let body: Option<String> = tx
            .query_row(
                "select body from documents where uri = ?1",
                params![uri.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        let Some(body) = body else {
            return Err(StoreError::NotFound(uri.clone()));
        };

        let current: Document = serde_json::from_str(&body)?;
        let updated = current.apply_patch(patch)?;
        tx.execute(
            "update documents set kind = ?2, body = ?3, updated_at = ?4 where uri = ?1",
            params![
                uri.as_str(),
                updated.kind(),
                serde_json::to_string(&updated)?,
                Self::now_epoch_secs()
            ],
        )?;
        tx.commit()?;
        Ok(updated)
    }

    pub fn document_delete(&self, uri: &DocumentUri) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute("delete from documents where uri = ?1", params![uri.as_str()])?;
        Ok(())
    }

    pub fn documents_reorder(&self, uris: &[DocumentUri]) -> Result<(), StoreError> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        for (i, uri) in uris.iter().enumerate() {
            tx.execute(
                "update documents set sort_order = ?2 where uri = ?1",
                params![uri.as_str(), (i as i64) + 1],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now_epoch_secs() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

impl DocumentStore for Db {
    fn update(&self, uri: &DocumentUri, patch: DocumentPatch) {
        match self.document_patch(uri, &patch) {
            Ok(_) => debug!(%uri, "document updated"),
            Err(err) => warn!(%uri, %err, "failed to persist document update"),
        }
    }

    fn close(&self, uri: &DocumentUri) {
        if let Err(err) = self.document_delete(uri) {
            warn!(%uri, %err, "failed to remove closed document");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentStatus, LoginHostDocument, ShellDocument};

    fn shell(uri: &str, title: &str) -> Document {
        Document::Shell(ShellDocument {
            uri: DocumentUri::from(uri),
            root_cluster_id: None,
            leaf_cluster_id: None,
            cwd: None,
            init_command: Some("make dev".into()),
            status: None,
            title: title.into(),
        })
    }

    fn login_host(uri: &str) -> Document {
        Document::SshLoginHost(LoginHostDocument {
            uri: DocumentUri::from(uri),
            login_host: "root@webserver1".into(),
            root_cluster_id: "teleport.example.com".into(),
            leaf_cluster_id: None,
            status: DocumentStatus::Connecting,
            title: "root@webserver1".into(),
        })
    }

    #[test]
    fn upsert_then_list_keeps_insertion_order() {
        let db = Db::open_in_memory().unwrap();
        db.document_upsert(&shell("/docs/b", "second")).unwrap();
        db.document_upsert(&shell("/docs/a", "first")).unwrap();
        db.document_upsert(&shell("/docs/b", "renamed")).unwrap();

        let titles: Vec<String> = db
            .documents_list()
            .unwrap()
            .iter()
            .map(|d| d.title().to_string())
            .collect();
        assert_eq!(titles, vec!["renamed", "first"]);
    }

    #[test]
    fn reorder_changes_list_order() {
        let db = Db::open_in_memory().unwrap();
        db.document_upsert(&shell("/docs/a", "a")).unwrap();
        db.document_upsert(&shell("/docs/b", "b")).unwrap();

        db.documents_reorder(&[DocumentUri::from("/docs/b"), DocumentUri::from("/docs/a")])
            .unwrap();

        let uris: Vec<String> = db
            .documents_list()
            .unwrap()
            .iter()
            .map(|d| d.uri().to_string())
            .collect();
        assert_eq!(uris, vec!["/docs/b", "/docs/a"]);
    }

    #[test]
    fn patch_merges_and_can_switch_kind() {
        let db = Db::open_in_memory().unwrap();
        let uri = DocumentUri::from("/docs/ssh");
        db.document_upsert(&login_host(uri.as_str())).unwrap();

        let patch = DocumentPatch::new()
            .set("kind", "doc.ssh.resolved")
            .set("serverId", "webserver1")
            .set("serverUri", "/clusters/teleport.example.com/servers/webserver1")
            .set("login", "root")
            .remove("loginHost");
        let updated = db.document_patch(&uri, &patch).unwrap();

        assert_eq!(updated.kind(), "doc.ssh.resolved");
        assert_eq!(db.document_get(&uri).unwrap(), Some(updated));
    }

    #[test]
    fn patch_of_missing_document_is_not_found() {
        let db = Db::open_in_memory().unwrap();
        let err = db
            .document_patch(&"/docs/gone".into(), &DocumentPatch::status(DocumentStatus::Error))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(uri) if uri.as_str() == "/docs/gone"));
    }

    #[test]
    fn store_trait_updates_and_closes() {
        let db = Db::open_in_memory().unwrap();
        let uri = DocumentUri::from("/docs/shell");
        db.document_upsert(&shell(uri.as_str(), "Terminal")).unwrap();

        DocumentStore::update(&db, &uri, DocumentPatch::clear_init_command());
        assert_eq!(db.document_get(&uri).unwrap().unwrap().init_command(), None);

        DocumentStore::close(&db, &uri);
        assert!(db.document_get(&uri).unwrap().is_none());
        // A patch for a closed document is logged and dropped.
        DocumentStore::update(&db, &uri, DocumentPatch::clear_init_command());
    }

    #[test]
    fn upsert_reports_sqlite_failures() {
        let db = Db::open_in_memory().unwrap();
        db.lock().execute_batch("drop table documents").unwrap();

        let err = db.document_upsert(&shell("/docs/a", "lost")).unwrap_err();

        assert!(matches!(err, StoreError::Sqlite(_)));
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(DB_FILE_NAME);

        {
            let db = Db::open(&path).unwrap();
            db.document_upsert(&shell("/docs/a", "kept")).unwrap();
        }

        let db = Db::open(&path).unwrap();
        let docs = db.documents_list().unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].title(), "kept");
    }
}
