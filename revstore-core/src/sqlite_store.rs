//! SQLite-backed store implementation
//!
//! All tables live in one database, named with a configurable prefix. The
//! connection sits behind a mutex together with the transaction depth, and
//! every statement runs synchronously while the lock is held. The store's
//! gate keeps other callers out while a transaction is open on the shared
//! connection.

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::config::StoreConfig;
use crate::digest::{digest, ContentHash};
use crate::error::{Result, VcsError};
use crate::model::{
    now_millis, Blob, BlobId, BlobRef, Changeset, NewRevision, PathId, PathQuery, Revision,
    RevisionId, Version, VersionId, VersionUpdate,
};
use crate::store::{
    dedup_parents, TxAction, TxDepth, TxGate, TxMode, TxOutcome, VersionStore,
};

/// Prefixed table names
#[derive(Debug, Clone)]
struct Tables {
    blob: String,
    path: String,
    revision: String,
    version: String,
    version_revisions: String,
    version_parents: String,
}

impl Tables {
    fn new(prefix: &str) -> Self {
        Self {
            blob: format!("{}blob", prefix),
            path: format!("{}path", prefix),
            revision: format!("{}revision", prefix),
            version: format!("{}version", prefix),
            version_revisions: format!("{}version_revisions", prefix),
            version_parents: format!("{}version_parents", prefix),
        }
    }

    fn schema(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {blob} (
                blobId INTEGER PRIMARY KEY,
                length INTEGER NOT NULL,
                hash TEXT NOT NULL UNIQUE,
                content BLOB NOT NULL,
                CHECK( length(hash) == 40 AND blobId > 0 )
            );
            CREATE TABLE IF NOT EXISTS {path} (
                pathId INTEGER PRIMARY KEY,
                path TEXT NOT NULL UNIQUE,
                CHECK( pathId > 0 )
            );
            CREATE TABLE IF NOT EXISTS {revision} (
                revisionId INTEGER PRIMARY KEY,
                length INTEGER NOT NULL,
                hash TEXT NOT NULL UNIQUE,
                contentId INTEGER NOT NULL,
                diffId INTEGER,
                CHECK( length(hash) == 40 AND revisionId > 0 AND contentId > 0 ),
                FOREIGN KEY(contentId) REFERENCES {blob}(blobId),
                FOREIGN KEY(diffId) REFERENCES {blob}(blobId)
            );
            CREATE TABLE IF NOT EXISTS {version} (
                versionId INTEGER PRIMARY KEY,
                stamp INTEGER NOT NULL,
                metadataId INTEGER,
                CHECK( versionId > 0 ),
                FOREIGN KEY(metadataId) REFERENCES {blob}(blobId)
            );
            CREATE TABLE IF NOT EXISTS {version_revisions} (
                versionId INTEGER NOT NULL,
                pathId INTEGER NOT NULL,
                revisionId INTEGER NOT NULL,
                FOREIGN KEY(versionId) REFERENCES {version}(versionId),
                FOREIGN KEY(pathId) REFERENCES {path}(pathId),
                FOREIGN KEY(revisionId) REFERENCES {revision}(revisionId),
                PRIMARY KEY(versionId, pathId)
            );
            CREATE TABLE IF NOT EXISTS {version_parents} (
                versionId INTEGER NOT NULL,
                parentId INTEGER NOT NULL,
                FOREIGN KEY(versionId) REFERENCES {version}(versionId),
                FOREIGN KEY(parentId) REFERENCES {version}(versionId),
                PRIMARY KEY(versionId, parentId)
            );
            CREATE INDEX IF NOT EXISTS {version_parents}_parent
                ON {version_parents}(parentId);
            CREATE INDEX IF NOT EXISTS {version}_metadata
                ON {version}(metadataId);",
            blob = self.blob,
            path = self.path,
            revision = self.revision,
            version = self.version,
            version_revisions = self.version_revisions,
            version_parents = self.version_parents,
        )
    }
}

fn parse_hash(hex_str: &str) -> Result<ContentHash> {
    ContentHash::from_hex(hex_str)
}

fn blob_ref_from_row(row: &Row) -> rusqlite::Result<(i64, i64, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn into_blob_ref((id, length, hash): (i64, i64, String)) -> Result<BlobRef> {
    Ok(BlobRef {
        id: BlobId(id),
        hash: parse_hash(&hash)?,
        length: length as u64,
    })
}

/// Raw revision columns, converted outside the row callback
struct RevisionRow {
    id: i64,
    length: i64,
    hash: String,
    content_id: i64,
    diff_id: Option<i64>,
}

impl RevisionRow {
    const COLUMNS: &'static str = "revisionId, length, hash, contentId, diffId";

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            length: row.get(1)?,
            hash: row.get(2)?,
            content_id: row.get(3)?,
            diff_id: row.get(4)?,
        })
    }

    fn into_revision(self) -> Result<Revision> {
        Ok(Revision {
            id: RevisionId(self.id),
            length: self.length as u64,
            hash: parse_hash(&self.hash)?,
            base_blob_id: BlobId(self.content_id),
            diff_blob_id: self.diff_id.map(BlobId),
        })
    }
}

fn conn_find_blob(conn: &Connection, t: &Tables, hash: &ContentHash) -> Result<Option<BlobRef>> {
    let row = conn
        .query_row(
            &format!("SELECT blobId, length, hash FROM {} WHERE hash = ?1", t.blob),
            params![hash.to_hex()],
            blob_ref_from_row,
        )
        .optional()?;
    row.map(into_blob_ref).transpose()
}

fn conn_blob_exists(conn: &Connection, t: &Tables, id: BlobId) -> Result<bool> {
    let found = conn
        .query_row(
            &format!("SELECT 1 FROM {} WHERE blobId = ?1", t.blob),
            params![id.get()],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn conn_revision_by_hash(
    conn: &Connection,
    t: &Tables,
    hash: &ContentHash,
) -> Result<Option<Revision>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM {} WHERE hash = ?1", RevisionRow::COLUMNS, t.revision),
            params![hash.to_hex()],
            RevisionRow::from_row,
        )
        .optional()?;
    row.map(RevisionRow::into_revision).transpose()
}

fn conn_version(conn: &Connection, t: &Tables, id: VersionId) -> Result<Option<Version>> {
    let row: Option<(i64, i64, Option<i64>, Option<String>)> = conn
        .query_row(
            &format!(
                "SELECT v.versionId, v.stamp, v.metadataId, b.hash
                 FROM {} v LEFT JOIN {} b ON b.blobId = v.metadataId
                 WHERE v.versionId = ?1",
                t.version, t.blob
            ),
            params![id.get()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;
    row.map(|(id, stamp, metadata_id, seal)| {
        Ok(Version {
            id: VersionId(id),
            stamp,
            metadata_id: metadata_id.map(BlobId),
            seal: seal.as_deref().map(parse_hash).transpose()?,
        })
    })
    .transpose()
}

fn conn_blob_in_use(conn: &Connection, t: &Tables, id: BlobId) -> Result<bool> {
    let found = conn
        .query_row(
            &format!(
                "SELECT 1 FROM {} WHERE contentId = ?1 OR diffId = ?1
                 UNION ALL SELECT 1 FROM {} WHERE metadataId = ?1
                 LIMIT 1",
                t.revision, t.version
            ),
            params![id.get()],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn conn_require_version(conn: &Connection, t: &Tables, id: VersionId) -> Result<()> {
    let found = conn
        .query_row(
            &format!("SELECT 1 FROM {} WHERE versionId = ?1", t.version),
            params![id.get()],
            |_| Ok(()),
        )
        .optional()?;
    found.ok_or(VcsError::VersionNotFound(id))
}

fn conn_changeset(conn: &Connection, t: &Tables, version: VersionId) -> Result<Changeset> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT pathId, revisionId FROM {} WHERE versionId = ?1",
        t.version_revisions
    ))?;
    let rows = stmt.query_map(params![version.get()], |row| {
        Ok((PathId(row.get(0)?), RevisionId(row.get(1)?)))
    })?;
    let mut changeset = Changeset::new();
    for row in rows {
        let (path, revision) = row?;
        changeset.insert(path, revision);
    }
    Ok(changeset)
}

fn conn_version_links(
    conn: &Connection,
    sql: &str,
    version: VersionId,
) -> Result<Vec<VersionId>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params![version.get()], |row| row.get::<_, i64>(0))?;
    let mut result = Vec::new();
    for row in rows {
        result.push(VersionId(row?));
    }
    Ok(result)
}

struct SqliteInner {
    conn: Connection,
    tx: TxDepth,
}

/// Version store persisted in a SQLite database
pub struct SqliteVersionStore {
    inner: Mutex<SqliteInner>,
    tables: Tables,
    gate: TxGate,
}

impl SqliteVersionStore {
    /// Open (or create) a database file
    pub fn open(path: &Path, config: &StoreConfig) -> Result<Self> {
        let conn = Connection::open(path)?;
        if config.wal {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
        }
        tracing::info!("Opened SQLite version store at {:?}", path);
        Self::with_connection(conn, config)
    }

    /// Open a private in-memory database
    pub fn open_in_memory(config: &StoreConfig) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, config)
    }

    fn with_connection(conn: Connection, config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let tables = Tables::new(&config.table_prefix);
        conn.execute_batch(&tables.schema())?;
        tracing::debug!("Schema ready with table prefix {:?}", config.table_prefix);
        Ok(Self {
            inner: Mutex::new(SqliteInner {
                conn,
                tx: TxDepth::default(),
            }),
            tables,
            gate: TxGate::new(),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, SqliteInner>> {
        self.inner
            .lock()
            .map_err(|_| VcsError::Transaction("connection lock poisoned".to_string()))
    }
}

#[async_trait]
impl VersionStore for SqliteVersionStore {
    fn gate(&self) -> &TxGate {
        &self.gate
    }

    async fn begin(&self, mode: TxMode) -> Result<()> {
        let _gate = self.gate.enter().await;
        let mut inner = self.lock()?;
        if inner.tx.enter() == TxAction::Begin {
            let sql = match mode {
                TxMode::Read => "BEGIN DEFERRED",
                TxMode::Write => "BEGIN IMMEDIATE",
            };
            if let Err(e) = inner.conn.execute_batch(sql) {
                // Undo the depth bump so the next begin starts fresh.
                let _ = inner.tx.leave(TxOutcome::Rollback);
                return Err(e.into());
            }
        }
        Ok(())
    }

    async fn end(&self, outcome: TxOutcome) -> Result<()> {
        let _gate = self.gate.enter().await;
        let mut inner = self.lock()?;
        match inner.tx.leave(outcome)? {
            TxAction::Nested | TxAction::Begin => Ok(()),
            TxAction::Commit => {
                if let Err(e) = inner.conn.execute_batch("COMMIT") {
                    tracing::warn!("Commit failed, rolling back: {}", e);
                    let _ = inner.conn.execute_batch("ROLLBACK");
                    return Err(e.into());
                }
                Ok(())
            }
            TxAction::Rollback => {
                inner.conn.execute_batch("ROLLBACK")?;
                tracing::debug!("SQLite transaction rolled back");
                Ok(())
            }
            TxAction::RollbackPoisoned => {
                inner.conn.execute_batch("ROLLBACK")?;
                Err(VcsError::Transaction(
                    "transaction rolled back after a nested scope failed".to_string(),
                ))
            }
        }
    }

    async fn put_blob(&self, content: Bytes) -> Result<BlobRef> {
        let _gate = self.gate.enter().await;
        let hash = digest(&content);
        let inner = self.lock()?;
        let t = &self.tables;
        inner.conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {}(length, hash, content) VALUES (?1, ?2, ?3)",
                t.blob
            ),
            params![content.len() as i64, hash.to_hex(), &content[..]],
        )?;
        conn_find_blob(&inner.conn, t, &hash)?
            .ok_or_else(|| VcsError::Transaction(format!("blob {} vanished after insert", hash)))
    }

    async fn get_blob(&self, id: BlobId) -> Result<Option<Blob>> {
        let _gate = self.gate.enter().await;
        let inner = self.lock()?;
        let row: Option<(i64, String, Vec<u8>)> = inner
            .conn
            .query_row(
                &format!("SELECT length, hash, content FROM {} WHERE blobId = ?1", self.tables.blob),
                params![id.get()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        row.map(|(length, hash, content)| {
            Ok(Blob {
                id,
                hash: parse_hash(&hash)?,
                length: length as u64,
                content: Bytes::from(content),
            })
        })
        .transpose()
    }

    async fn find_blob(&self, hash: &ContentHash) -> Result<Option<BlobRef>> {
        let _gate = self.gate.enter().await;
        let inner = self.lock()?;
        conn_find_blob(&inner.conn, &self.tables, hash)
    }

    async fn delete_blob(&self, id: BlobId) -> Result<()> {
        let _gate = self.gate.enter().await;
        let inner = self.lock()?;
        if conn_blob_in_use(&inner.conn, &self.tables, id)? {
            return Err(VcsError::BlobInUse(id));
        }
        inner.conn.execute(
            &format!("DELETE FROM {} WHERE blobId = ?1", self.tables.blob),
            params![id.get()],
        )?;
        Ok(())
    }

    async fn intern_paths(&self, paths: &[String]) -> Result<BTreeMap<String, PathId>> {
        let _gate = self.gate.enter().await;
        let mut inner = self.lock()?;
        let t = &self.tables;
        let sp = inner.conn.savepoint()?;
        let mut result = BTreeMap::new();
        {
            let mut insert =
                sp.prepare_cached(&format!("INSERT OR IGNORE INTO {}(path) VALUES (?1)", t.path))?;
            let mut select =
                sp.prepare_cached(&format!("SELECT pathId FROM {} WHERE path = ?1", t.path))?;
            for path in paths {
                insert.execute(params![path])?;
                let id: i64 = select.query_row(params![path], |row| row.get(0))?;
                result.insert(path.clone(), PathId(id));
            }
        }
        sp.commit()?;
        Ok(result)
    }

    async fn resolve_paths(&self, query: PathQuery) -> Result<BTreeMap<String, PathId>> {
        let _gate = self.gate.enter().await;
        let inner = self.lock()?;
        let t = &self.tables;
        let mut result = BTreeMap::new();
        match query {
            PathQuery::Paths(paths) => {
                let mut stmt = inner
                    .conn
                    .prepare_cached(&format!("SELECT pathId FROM {} WHERE path = ?1", t.path))?;
                for path in paths {
                    let id: Option<i64> =
                        stmt.query_row(params![path], |row| row.get(0)).optional()?;
                    if let Some(id) = id {
                        result.insert(path, PathId(id));
                    }
                }
            }
            PathQuery::Ids(ids) => {
                let mut stmt = inner
                    .conn
                    .prepare_cached(&format!("SELECT path FROM {} WHERE pathId = ?1", t.path))?;
                for id in ids {
                    let path: Option<String> =
                        stmt.query_row(params![id.get()], |row| row.get(0)).optional()?;
                    if let Some(path) = path {
                        result.insert(path, id);
                    }
                }
            }
        }
        Ok(result)
    }

    async fn list_paths_with_prefix(&self, prefix: &str) -> Result<BTreeMap<String, PathId>> {
        let _gate = self.gate.enter().await;
        let inner = self.lock()?;
        // BINARY collation orders like Rust strings, so matches are contiguous.
        let mut stmt = inner.conn.prepare_cached(&format!(
            "SELECT path, pathId FROM {} WHERE path >= ?1 ORDER BY path",
            self.tables.path
        ))?;
        let rows = stmt.query_map(params![prefix], |row| {
            Ok((row.get::<_, String>(0)?, PathId(row.get(1)?)))
        })?;
        let mut result = BTreeMap::new();
        for row in rows {
            let (path, id) = row?;
            if !path.starts_with(prefix) {
                break;
            }
            result.insert(path, id);
        }
        Ok(result)
    }

    async fn put_revision(&self, revision: NewRevision) -> Result<Revision> {
        let _gate = self.gate.enter().await;
        let inner = self.lock()?;
        let t = &self.tables;
        if let Some(existing) = conn_revision_by_hash(&inner.conn, t, &revision.hash)? {
            if existing.length != revision.length {
                return Err(VcsError::RevisionLengthMismatch {
                    hash: revision.hash,
                    existing: existing.length,
                    requested: revision.length,
                });
            }
            return Ok(existing);
        }
        for blob_id in std::iter::once(revision.base_blob_id).chain(revision.diff_blob_id) {
            if !conn_blob_exists(&inner.conn, t, blob_id)? {
                return Err(VcsError::BlobNotFound(blob_id));
            }
        }
        inner.conn.execute(
            &format!(
                "INSERT INTO {}(length, hash, contentId, diffId) VALUES (?1, ?2, ?3, ?4)",
                t.revision
            ),
            params![
                revision.length as i64,
                revision.hash.to_hex(),
                revision.base_blob_id.get(),
                revision.diff_blob_id.map(BlobId::get),
            ],
        )?;
        Ok(Revision {
            id: RevisionId(inner.conn.last_insert_rowid()),
            length: revision.length,
            hash: revision.hash,
            base_blob_id: revision.base_blob_id,
            diff_blob_id: revision.diff_blob_id,
        })
    }

    async fn get_revision(&self, id: RevisionId) -> Result<Option<Revision>> {
        let _gate = self.gate.enter().await;
        let inner = self.lock()?;
        let row = inner
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM {} WHERE revisionId = ?1",
                    RevisionRow::COLUMNS,
                    self.tables.revision
                ),
                params![id.get()],
                RevisionRow::from_row,
            )
            .optional()?;
        row.map(RevisionRow::into_revision).transpose()
    }

    async fn get_revision_by_hash(&self, hash: &ContentHash) -> Result<Option<Revision>> {
        let _gate = self.gate.enter().await;
        let inner = self.lock()?;
        conn_revision_by_hash(&inner.conn, &self.tables, hash)
    }

    async fn put_version(&self, update: VersionUpdate) -> Result<Version> {
        let _gate = self.gate.enter().await;
        let inner = self.lock()?;
        let t = &self.tables;
        let id = match update.id {
            Some(id) => {
                conn_require_version(&inner.conn, t, id)?;
                inner.conn.execute(
                    &format!(
                        "UPDATE {} SET stamp = COALESCE(?2, stamp),
                         metadataId = COALESCE(?3, metadataId) WHERE versionId = ?1",
                        t.version
                    ),
                    params![id.get(), update.stamp, update.metadata_id.map(BlobId::get)],
                )?;
                id
            }
            None => {
                inner.conn.execute(
                    &format!("INSERT INTO {}(stamp, metadataId) VALUES (?1, ?2)", t.version),
                    params![
                        update.stamp.unwrap_or_else(now_millis),
                        update.metadata_id.map(BlobId::get)
                    ],
                )?;
                VersionId(inner.conn.last_insert_rowid())
            }
        };
        conn_version(&inner.conn, t, id)?.ok_or(VcsError::VersionNotFound(id))
    }

    async fn get_version(&self, id: VersionId) -> Result<Option<Version>> {
        let _gate = self.gate.enter().await;
        let inner = self.lock()?;
        conn_version(&inner.conn, &self.tables, id)
    }

    async fn get_version_by_metadata(&self, metadata_id: BlobId) -> Result<Option<Version>> {
        let _gate = self.gate.enter().await;
        let inner = self.lock()?;
        let id: Option<i64> = inner
            .conn
            .query_row(
                &format!(
                    "SELECT versionId FROM {} WHERE metadataId = ?1 ORDER BY versionId LIMIT 1",
                    self.tables.version
                ),
                params![metadata_id.get()],
                |row| row.get(0),
            )
            .optional()?;
        match id {
            Some(id) => conn_version(&inner.conn, &self.tables, VersionId(id)),
            None => Ok(None),
        }
    }

    async fn list_versions(&self) -> Result<Vec<VersionId>> {
        let _gate = self.gate.enter().await;
        let inner = self.lock()?;
        let mut stmt = inner.conn.prepare_cached(&format!(
            "SELECT versionId FROM {} ORDER BY versionId",
            self.tables.version
        ))?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(VersionId(row?));
        }
        Ok(ids)
    }

    async fn put_changeset(
        &self,
        version: VersionId,
        mapping: &Changeset,
        replace: bool,
    ) -> Result<Changeset> {
        let _gate = self.gate.enter().await;
        let mut inner = self.lock()?;
        let t = &self.tables;
        let sp = inner.conn.savepoint()?;
        conn_require_version(&sp, t, version)?;
        if replace {
            sp.execute(
                &format!("DELETE FROM {} WHERE versionId = ?1", t.version_revisions),
                params![version.get()],
            )?;
        }
        {
            let mut stmt = sp.prepare_cached(&format!(
                "INSERT OR REPLACE INTO {}(versionId, pathId, revisionId) VALUES (?1, ?2, ?3)",
                t.version_revisions
            ))?;
            for (path, revision) in mapping {
                stmt.execute(params![version.get(), path.get(), revision.get()])?;
            }
        }
        let changeset = conn_changeset(&sp, t, version)?;
        sp.commit()?;
        Ok(changeset)
    }

    async fn get_changeset(&self, version: VersionId) -> Result<Changeset> {
        let _gate = self.gate.enter().await;
        let inner = self.lock()?;
        conn_changeset(&inner.conn, &self.tables, version)
    }

    async fn put_version_parents(
        &self,
        version: VersionId,
        parents: &[VersionId],
    ) -> Result<Vec<VersionId>> {
        let _gate = self.gate.enter().await;
        let parents = dedup_parents(parents);
        let mut inner = self.lock()?;
        let t = &self.tables;
        let sp = inner.conn.savepoint()?;
        conn_require_version(&sp, t, version)?;
        for parent in &parents {
            conn_require_version(&sp, t, *parent)?;
        }
        sp.execute(
            &format!("DELETE FROM {} WHERE versionId = ?1", t.version_parents),
            params![version.get()],
        )?;
        {
            let mut stmt = sp.prepare_cached(&format!(
                "INSERT INTO {}(versionId, parentId) VALUES (?1, ?2)",
                t.version_parents
            ))?;
            for parent in &parents {
                stmt.execute(params![version.get(), parent.get()])?;
            }
        }
        sp.commit()?;
        Ok(parents)
    }

    async fn get_version_parents(&self, version: VersionId) -> Result<Vec<VersionId>> {
        let _gate = self.gate.enter().await;
        let inner = self.lock()?;
        conn_version_links(
            &inner.conn,
            &format!(
                "SELECT parentId FROM {} WHERE versionId = ?1 ORDER BY rowid",
                self.tables.version_parents
            ),
            version,
        )
    }

    async fn get_version_children(&self, version: VersionId) -> Result<Vec<VersionId>> {
        let _gate = self.gate.enter().await;
        let inner = self.lock()?;
        conn_version_links(
            &inner.conn,
            &format!(
                "SELECT versionId FROM {} WHERE parentId = ?1 ORDER BY versionId",
                self.tables.version_parents
            ),
            version,
        )
    }
}
