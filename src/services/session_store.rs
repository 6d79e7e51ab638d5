//! Shared upload-session storage backed by SQLite.
//!
//! Every state change is a single conditional statement (or one short
//! transaction), so concurrent requests against the same session serialize
//! inside SQLite and never hold a lock across an object-store call.

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{collections::BTreeMap, sync::Arc};
use uuid::Uuid;

use crate::models::{
    tree::TreeId,
    upload::{CompletedPart, SessionState, UploadSession},
};

const SESSION_COLUMNS: &str = "upload_id, owner_id, tree_id, node_id, file_name, storage_key, \
     content_type, is_root, state, created_at, updated_at";

#[derive(sqlx::FromRow, Debug)]
struct SessionRow {
    upload_id: String,
    owner_id: Uuid,
    tree_id: Uuid,
    node_id: Uuid,
    file_name: String,
    storage_key: String,
    content_type: String,
    is_root: bool,
    state: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Debug)]
struct PartRow {
    part_number: i64,
    etag: String,
}

#[derive(Clone)]
pub struct SessionStore {
    db: Arc<SqlitePool>,
}

impl SessionStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn insert(&self, session: &UploadSession) -> sqlx::Result<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query(
            "INSERT INTO upload_sessions (
                upload_id, owner_id, tree_id, node_id, file_name, storage_key,
                content_type, is_root, state, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.upload_id)
        .bind(session.owner_id)
        .bind(session.tree_id)
        .bind(session.node_id)
        .bind(&session.file_name)
        .bind(&session.storage_key)
        .bind(&session.content_type)
        .bind(session.is_root)
        .bind(session.state.as_str())
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&mut *tx)
        .await?;

        for (part_number, etag) in &session.parts {
            insert_part(&mut tx, &session.upload_id, *part_number, etag).await?;
        }
        tx.commit().await
    }

    pub async fn get(&self, upload_id: &str) -> sqlx::Result<Option<UploadSession>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM upload_sessions WHERE upload_id = ?"
        ))
        .bind(upload_id)
        .fetch_optional(&*self.db)
        .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    /// Move a session to `to` if its current state is one of `from`.
    ///
    /// Returns false when no row matched (unknown id or wrong state).
    pub async fn transition(
        &self,
        upload_id: &str,
        from: &[SessionState],
        to: SessionState,
    ) -> sqlx::Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }

        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE upload_sessions SET state = ");
        builder.push_bind(to.as_str());
        builder.push(", updated_at = ");
        builder.push_bind(Utc::now());
        builder.push(" WHERE upload_id = ");
        builder.push_bind(upload_id);
        builder.push(" AND state IN (");
        let mut states = builder.separated(", ");
        for state in from {
            states.push_bind(state.as_str());
        }
        states.push_unseparated(")");

        let result = builder.build().execute(&*self.db).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record (or overwrite) the integrity tag of one part.
    ///
    /// The write only lands while the session is open; returns false
    /// otherwise.
    pub async fn record_part(
        &self,
        upload_id: &str,
        part_number: u32,
        etag: &str,
    ) -> sqlx::Result<bool> {
        let result = sqlx::query(
            "INSERT INTO upload_parts (upload_id, part_number, etag, acknowledged_at)
             SELECT ?, ?, ?, ?
             WHERE EXISTS (
                 SELECT 1 FROM upload_sessions
                 WHERE upload_id = ? AND state IN ('initiated', 'parts_in_flight')
             )
             ON CONFLICT (upload_id, part_number) DO UPDATE SET
                 etag = excluded.etag,
                 acknowledged_at = excluded.acknowledged_at",
        )
        .bind(upload_id)
        .bind(i64::from(part_number))
        .bind(etag)
        .bind(Utc::now())
        .bind(upload_id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark an open session completed and store the final part list.
    ///
    /// Returns false (and changes nothing) if the session was no longer open.
    pub async fn mark_completed(
        &self,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> sqlx::Result<bool> {
        let mut tx = self.db.begin().await?;
        let updated = sqlx::query(
            "UPDATE upload_sessions SET state = ?, updated_at = ?
             WHERE upload_id = ? AND state IN ('initiated', 'parts_in_flight')",
        )
        .bind(SessionState::Completed.as_str())
        .bind(Utc::now())
        .bind(upload_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM upload_parts WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;
        for part in parts {
            insert_part(&mut tx, upload_id, part.part_number, &part.etag).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Sessions still `Initiated` or `PartsInFlight` that were created
    /// before `cutoff`, oldest first.
    pub async fn list_open_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> sqlx::Result<Vec<UploadSession>> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM upload_sessions
             WHERE state IN ('initiated', 'parts_in_flight') AND created_at < ?
             ORDER BY created_at ASC"
        ))
        .bind(cutoff)
        .fetch_all(&*self.db)
        .await?;
        self.hydrate_all(rows).await
    }

    /// Whether the same node has a completed session, finished after this
    /// one, that produced a different object.
    pub async fn superseded(&self, upload_id: &str) -> sqlx::Result<bool> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (
                 SELECT 1 FROM upload_sessions later
                 JOIN upload_sessions this
                   ON later.tree_id = this.tree_id AND later.node_id = this.node_id
                 WHERE this.upload_id = ?
                   AND later.upload_id <> this.upload_id
                   AND later.state = 'completed'
                   AND later.updated_at > this.updated_at
                   AND later.storage_key <> this.storage_key
             )",
        )
        .bind(upload_id)
        .fetch_one(&*self.db)
        .await
    }

    /// Distinct object keys of the tree's completed sessions.
    pub async fn list_completed_keys_for_tree(&self, tree_id: TreeId) -> sqlx::Result<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT storage_key FROM upload_sessions
             WHERE tree_id = ? AND state = 'completed'
             ORDER BY storage_key",
        )
        .bind(tree_id)
        .fetch_all(&*self.db)
        .await
    }

    pub async fn list_open_for_tree(&self, tree_id: TreeId) -> sqlx::Result<Vec<UploadSession>> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM upload_sessions
             WHERE tree_id = ? AND state IN ('initiated', 'parts_in_flight')
             ORDER BY created_at ASC"
        ))
        .bind(tree_id)
        .fetch_all(&*self.db)
        .await?;
        self.hydrate_all(rows).await
    }

    async fn hydrate_all(&self, rows: Vec<SessionRow>) -> sqlx::Result<Vec<UploadSession>> {
        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows {
            sessions.push(self.hydrate(row).await?);
        }
        Ok(sessions)
    }

    async fn hydrate(&self, row: SessionRow) -> sqlx::Result<UploadSession> {
        let state = SessionState::parse(&row.state).ok_or_else(|| {
            sqlx::Error::Decode(
                format!(
                    "upload session `{}` has unknown state `{}`",
                    row.upload_id, row.state
                )
                .into(),
            )
        })?;

        let part_rows = sqlx::query_as::<_, PartRow>(
            "SELECT part_number, etag FROM upload_parts
             WHERE upload_id = ? ORDER BY part_number ASC",
        )
        .bind(&row.upload_id)
        .fetch_all(&*self.db)
        .await?;

        let mut parts = BTreeMap::new();
        for part in part_rows {
            let part_number =
                u32::try_from(part.part_number).map_err(|err| sqlx::Error::Decode(Box::new(err)))?;
            parts.insert(part_number, part.etag);
        }

        Ok(UploadSession {
            upload_id: row.upload_id,
            owner_id: row.owner_id,
            tree_id: row.tree_id,
            node_id: row.node_id,
            file_name: row.file_name,
            storage_key: row.storage_key,
            content_type: row.content_type,
            is_root: row.is_root,
            state,
            parts,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

async fn insert_part(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    upload_id: &str,
    part_number: u32,
    etag: &str,
) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO upload_parts (upload_id, part_number, etag, acknowledged_at)
         VALUES (?, ?, ?, ?)",
    )
    .bind(upload_id)
    .bind(i64::from(part_number))
    .bind(etag)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    Ok(())
}
