use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use draftsync_common::types::{ActorInfo, EventKind};
use sqlx::PgPool;
use tracing::{info_span, Instrument};
use uuid::Uuid;

use super::{
    page_offset, AccessLevel, DocumentRecord, EventRecord, SharePermission, VersionInsert,
    VersionListing, VersionRecord,
};

const UNIQUE_VIOLATION: &str = "23505";

#[derive(sqlx::FromRow)]
struct DocumentRow {
    id: Uuid,
    owner_id: Uuid,
    title: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DocumentRow> for DocumentRecord {
    fn from(row: DocumentRow) -> Self {
        Self {
            id: row.id,
            owner_id: row.owner_id,
            title: row.title,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct VersionRow {
    id: Uuid,
    document_id: Uuid,
    version_number: i64,
    actor_id: Uuid,
    actor_name: String,
    content: Vec<u8>,
    created_at: DateTime<Utc>,
}

impl From<VersionRow> for VersionRecord {
    fn from(row: VersionRow) -> Self {
        Self {
            id: row.id,
            document_id: row.document_id,
            version_number: row.version_number,
            actor: ActorInfo { id: row.actor_id, name: row.actor_name },
            content: row.content,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    document_id: Uuid,
    actor_id: Uuid,
    event_type: String,
    payload: Vec<u8>,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for EventRecord {
    type Error = anyhow::Error;

    fn try_from(row: EventRow) -> Result<Self> {
        let kind = EventKind::parse(&row.event_type)
            .ok_or_else(|| anyhow!("invalid event type '{}' in database", row.event_type))?;
        Ok(Self {
            id: row.id,
            document_id: row.document_id,
            actor_id: row.actor_id,
            kind,
            payload: row.payload,
            created_at: row.created_at,
        })
    }
}

pub(super) async fn upsert_user(pool: &PgPool, user_id: Uuid, display_name: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO users (id, display_name)
        VALUES ($1, $2)
        ON CONFLICT (id) DO UPDATE
            SET display_name = EXCLUDED.display_name,
                updated_at = now()
            WHERE users.display_name IS DISTINCT FROM EXCLUDED.display_name
        "#,
    )
    .bind(user_id)
    .bind(display_name)
    .execute(pool)
    .instrument(info_span!("relay.db.query", query = "upsert_user"))
    .await
    .context("failed to upsert user")?;

    Ok(())
}

pub(super) async fn create_document(
    pool: &PgPool,
    owner_id: Uuid,
    title: &str,
) -> Result<DocumentRecord> {
    let row = sqlx::query_as::<_, DocumentRow>(
        r#"
        INSERT INTO documents (id, owner_id, title)
        VALUES ($1, $2, $3)
        RETURNING id, owner_id, title, created_at, updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(owner_id)
    .bind(title)
    .fetch_one(pool)
    .instrument(info_span!("relay.db.query", query = "create_document"))
    .await
    .context("failed to create document")?;

    Ok(row.into())
}

pub(super) async fn find_document(pool: &PgPool, document_id: Uuid) -> Result<Option<DocumentRecord>> {
    let row = sqlx::query_as::<_, DocumentRow>(
        r#"
        SELECT id, owner_id, title, created_at, updated_at
        FROM documents
        WHERE id = $1
        "#,
    )
    .bind(document_id)
    .fetch_optional(pool)
    .instrument(info_span!("relay.db.query", query = "find_document"))
    .await
    .context("failed to load document")?;

    Ok(row.map(DocumentRecord::from))
}

pub(super) async fn document_content(pool: &PgPool, document_id: Uuid) -> Result<Option<Vec<u8>>> {
    let content = sqlx::query_scalar::<_, Option<Vec<u8>>>(
        "SELECT content FROM documents WHERE id = $1",
    )
    .bind(document_id)
    .fetch_optional(pool)
    .instrument(info_span!("relay.db.query", query = "document_content"))
    .await
    .context("failed to load document content")?;

    Ok(content.flatten())
}

pub(super) async fn access_level(
    pool: &PgPool,
    document_id: Uuid,
    user_id: Uuid,
) -> Result<Option<AccessLevel>> {
    let row = sqlx::query_as::<_, (Uuid, Option<String>)>(
        r#"
        SELECT d.owner_id, s.permission
        FROM documents AS d
        LEFT JOIN document_shares AS s
            ON s.document_id = d.id
           AND s.user_id = $2
        WHERE d.id = $1
        "#,
    )
    .bind(document_id)
    .bind(user_id)
    .fetch_optional(pool)
    .instrument(info_span!("relay.db.query", query = "document_access_level"))
    .await
    .context("failed to resolve document access")?;

    let Some((owner_id, permission)) = row else {
        return Ok(None);
    };
    if owner_id == user_id {
        return Ok(Some(AccessLevel::Owner));
    }

    permission
        .map(|value| {
            SharePermission::from_db_value(&value)
                .map(AccessLevel::Shared)
                .ok_or_else(|| anyhow!("invalid share permission '{value}' in database"))
        })
        .transpose()
}

pub(super) async fn grant_share(
    pool: &PgPool,
    document_id: Uuid,
    user_id: Uuid,
    permission: SharePermission,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO document_shares (document_id, user_id, permission)
        VALUES ($1, $2, $3)
        ON CONFLICT (document_id, user_id) DO UPDATE SET permission = EXCLUDED.permission
        "#,
    )
    .bind(document_id)
    .bind(user_id)
    .bind(permission.as_str())
    .execute(pool)
    .instrument(info_span!("relay.db.query", query = "grant_document_share"))
    .await
    .context("failed to grant document share")?;

    Ok(())
}

pub(super) async fn record_save(
    pool: &PgPool,
    document_id: Uuid,
    actor_id: Uuid,
    payload: &[u8],
) -> Result<()> {
    write_content_with_event(pool, document_id, actor_id, EventKind::Update, payload).await
}

pub(super) async fn record_restore(
    pool: &PgPool,
    document_id: Uuid,
    actor_id: Uuid,
    content: &[u8],
) -> Result<()> {
    write_content_with_event(pool, document_id, actor_id, EventKind::Restore, content).await
}

async fn write_content_with_event(
    pool: &PgPool,
    document_id: Uuid,
    actor_id: Uuid,
    kind: EventKind,
    payload: &[u8],
) -> Result<()> {
    let mut tx = pool
        .begin()
        .instrument(info_span!("relay.db.query", query = "begin_content_write_tx"))
        .await
        .context("failed to open transaction for content write")?;

    sqlx::query(
        r#"
        INSERT INTO document_events (document_id, actor_id, event_type, payload)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(document_id)
    .bind(actor_id)
    .bind(kind.as_str())
    .bind(payload)
    .execute(&mut *tx)
    .instrument(info_span!("relay.db.query", query = "insert_document_event"))
    .await
    .context("failed to append document event")?;

    let updated = sqlx::query(
        r#"
        UPDATE documents
        SET content = $2, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(document_id)
    .bind(payload)
    .execute(&mut *tx)
    .instrument(info_span!("relay.db.query", query = "overwrite_document_content"))
    .await
    .context("failed to overwrite document content")?
    .rows_affected();

    if updated == 0 {
        return Err(anyhow!("document {document_id} does not exist"));
    }

    tx.commit()
        .instrument(info_span!("relay.db.query", query = "commit_content_write_tx"))
        .await
        .context("failed to commit content write transaction")?;

    Ok(())
}

pub(super) async fn latest_version_number(pool: &PgPool, document_id: Uuid) -> Result<i64> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COALESCE(MAX(version_number), 0) FROM document_versions WHERE document_id = $1",
    )
    .bind(document_id)
    .fetch_one(pool)
    .instrument(info_span!("relay.db.query", query = "latest_version_number"))
    .await
    .context("failed to read latest version number")
}

pub(super) async fn insert_next_version(
    pool: &PgPool,
    document_id: Uuid,
    actor_id: Uuid,
) -> Result<VersionInsert> {
    let mut tx = pool
        .begin()
        .instrument(info_span!("relay.db.query", query = "begin_version_tx"))
        .await
        .context("failed to open transaction for version insert")?;

    // Row lock serializes numbering across relay instances.
    let locked = sqlx::query_scalar::<_, Option<Vec<u8>>>(
        "SELECT content FROM documents WHERE id = $1 FOR UPDATE",
    )
    .bind(document_id)
    .fetch_optional(&mut *tx)
    .instrument(info_span!("relay.db.query", query = "lock_document_for_version"))
    .await
    .context("failed to lock document for version insert")?;

    let content = match locked {
        None => return Ok(VersionInsert::DocumentMissing),
        Some(None) => return Ok(VersionInsert::EmptyContent),
        Some(Some(content)) if content.is_empty() => return Ok(VersionInsert::EmptyContent),
        Some(Some(content)) => content,
    };

    let inserted = sqlx::query_as::<_, VersionRow>(
        r#"
        WITH next AS (
            SELECT COALESCE(MAX(version_number), 0) + 1 AS version_number
            FROM document_versions
            WHERE document_id = $2
        ),
        inserted AS (
            INSERT INTO document_versions (id, document_id, actor_id, version_number, content)
            SELECT $1, $2, $3, next.version_number, $4
            FROM next
            RETURNING id, document_id, actor_id, version_number, content, created_at
        )
        SELECT
            i.id,
            i.document_id,
            i.version_number,
            i.actor_id,
            COALESCE(u.display_name, '') AS actor_name,
            i.content,
            i.created_at
        FROM inserted AS i
        LEFT JOIN users AS u
            ON u.id = i.actor_id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(document_id)
    .bind(actor_id)
    .bind(content)
    .fetch_one(&mut *tx)
    .instrument(info_span!("relay.db.query", query = "insert_next_version"))
    .await;

    let row = match inserted {
        Ok(row) => row,
        Err(error) if is_unique_violation(&error) => return Ok(VersionInsert::Conflict),
        Err(error) => return Err(error).context("failed to insert document version"),
    };

    tx.commit()
        .instrument(info_span!("relay.db.query", query = "commit_version_tx"))
        .await
        .context("failed to commit version transaction")?;

    Ok(VersionInsert::Created(row.into()))
}

pub(super) async fn list_versions(
    pool: &PgPool,
    document_id: Uuid,
    page: u32,
    per_page: u32,
) -> Result<VersionListing> {
    let total = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM document_versions WHERE document_id = $1",
    )
    .bind(document_id)
    .fetch_one(pool)
    .instrument(info_span!("relay.db.query", query = "count_versions"))
    .await
    .context("failed to count document versions")?;

    // Content is not needed for listings; select an empty blob in its place.
    let rows = sqlx::query_as::<_, VersionRow>(
        r#"
        SELECT
            v.id,
            v.document_id,
            v.version_number,
            v.actor_id,
            COALESCE(u.display_name, '') AS actor_name,
            ''::bytea AS content,
            v.created_at
        FROM document_versions AS v
        LEFT JOIN users AS u
            ON u.id = v.actor_id
        WHERE v.document_id = $1
        ORDER BY v.version_number DESC
        LIMIT $2
        OFFSET $3
        "#,
    )
    .bind(document_id)
    .bind(i64::from(per_page))
    .bind(page_offset(page, per_page))
    .fetch_all(pool)
    .instrument(info_span!("relay.db.query", query = "list_versions"))
    .await
    .context("failed to list document versions")?;

    let items = rows.into_iter().map(|row| VersionRecord::from(row).summary()).collect();
    Ok(VersionListing { items, total })
}

pub(super) async fn find_version(
    pool: &PgPool,
    document_id: Uuid,
    version_number: i64,
) -> Result<Option<VersionRecord>> {
    let row = sqlx::query_as::<_, VersionRow>(
        r#"
        SELECT
            v.id,
            v.document_id,
            v.version_number,
            v.actor_id,
            COALESCE(u.display_name, '') AS actor_name,
            v.content,
            v.created_at
        FROM document_versions AS v
        LEFT JOIN users AS u
            ON u.id = v.actor_id
        WHERE v.document_id = $1
          AND v.version_number = $2
        "#,
    )
    .bind(document_id)
    .bind(version_number)
    .fetch_optional(pool)
    .instrument(info_span!("relay.db.query", query = "find_version"))
    .await
    .context("failed to load document version")?;

    Ok(row.map(VersionRecord::from))
}

pub(super) async fn list_events(pool: &PgPool, document_id: Uuid) -> Result<Vec<EventRecord>> {
    sqlx::query_as::<_, EventRow>(
        r#"
        SELECT id, document_id, actor_id, event_type, payload, created_at
        FROM document_events
        WHERE document_id = $1
        ORDER BY created_at ASC, id ASC
        "#,
    )
    .bind(document_id)
    .fetch_all(pool)
    .instrument(info_span!("relay.db.query", query = "list_document_events"))
    .await
    .context("failed to list document events")?
    .into_iter()
    .map(EventRecord::try_from)
    .collect()
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(database_error)
            if database_error.code().as_deref() == Some(UNIQUE_VIOLATION)
    )
}
