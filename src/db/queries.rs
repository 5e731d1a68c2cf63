use anyhow::Result;
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, Sqlite, SqlitePool};

use super::{ReconcileTx, Store};
use crate::error::{StoreError, StoreResult};
use crate::models::{
    AccountHealth, BounceRecord, Conversation, ConversationMessage, ConversationType, Direction,
    EmailAccount, Lead, LeadCorrelation, Organization, ScanCursor, ScheduledSend, ServiceStatus,
    SystemHealthRecord,
};

const ACCOUNT_COLUMNS: &str = "id, organization_id, email, provider, imap_host, imap_port, credential_ref, enabled, daily_sent, daily_quota, last_reset_at, health_status, consecutive_failures, created_at, updated_at";

const LEAD_COLUMNS: &str = "l.id, l.organization_id, l.email, l.status, l.bounced_at, l.replied_at";

const CONVERSATION_COLUMNS: &str = "id, organization_id, participant_key, conversation_type, last_activity_at, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, organization_id, account_id, conversation_id, message_id_header, thread_id, direction, subject, sent_at, scheduled_send_id, created_at";

/// SQLite-backed store. Atomicity comes from single conditional statements and
/// unique constraints, never from checks done in memory.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Private in-memory database on a single connection that never idles out.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        super::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn organizations(&self, limit: i64, offset: i64) -> StoreResult<Vec<Organization>> {
        let rows = sqlx::query_as::<_, Organization>(
            "SELECT id, name, created_at FROM organizations ORDER BY created_at, id LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn accounts_for_org(&self, organization_id: &str) -> StoreResult<Vec<EmailAccount>> {
        let rows = sqlx::query_as::<_, EmailAccount>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM email_accounts WHERE organization_id = ? ORDER BY created_at, id"
        ))
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn account(&self, account_id: &str) -> StoreResult<Option<EmailAccount>> {
        let row = sqlx::query_as::<_, EmailAccount>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM email_accounts WHERE id = ?"
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn scan_cursor(&self, account_id: &str) -> StoreResult<Option<ScanCursor>> {
        let row = sqlx::query_as::<_, ScanCursor>(
            "SELECT account_id, last_uid, uid_validity, updated_at FROM scan_cursors WHERE account_id = ?",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn set_scan_cursor(&self, cursor: &ScanCursor) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO scan_cursors (account_id, last_uid, uid_validity, updated_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(account_id) DO UPDATE SET
                 last_uid = excluded.last_uid,
                 uid_validity = excluded.uid_validity,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&cursor.account_id)
        .bind(cursor.last_uid)
        .bind(cursor.uid_validity)
        .bind(cursor.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_bounce_record(&self, record: &BounceRecord) -> StoreResult<bool> {
        let inserted = sqlx::query(
            r#"INSERT INTO bounce_records (
                 account_id, message_id, organization_id, lead_id,
                 bounce_type, reason, failed_recipient, detected_at
               ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(account_id, message_id) DO NOTHING"#,
        )
        .bind(&record.account_id)
        .bind(&record.message_id)
        .bind(&record.organization_id)
        .bind(&record.lead_id)
        .bind(record.bounce_type)
        .bind(&record.reason)
        .bind(&record.failed_recipient)
        .bind(record.detected_at)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(inserted == 1)
    }

    async fn bounce_records(&self, account_id: &str) -> StoreResult<Vec<BounceRecord>> {
        let rows = sqlx::query_as::<_, BounceRecord>(
            r#"SELECT account_id, message_id, organization_id, lead_id, bounce_type,
                      reason, failed_recipient, detected_at
               FROM bounce_records WHERE account_id = ? ORDER BY detected_at, message_id"#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn resolve_lead(
        &self,
        organization_id: &str,
        correlation: &LeadCorrelation,
    ) -> StoreResult<Option<Lead>> {
        for message_id in &correlation.referenced_message_ids {
            let via_send = sqlx::query_as::<_, Lead>(&format!(
                r#"SELECT {LEAD_COLUMNS} FROM scheduled_sends s
                   JOIN leads l ON l.id = s.lead_id
                   WHERE s.organization_id = ? AND trim(s.message_id_header, '<> ') = ?
                   LIMIT 1"#
            ))
            .bind(organization_id)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
            if via_send.is_some() {
                return Ok(via_send);
            }

            let via_conversation = sqlx::query_as::<_, Lead>(&format!(
                r#"SELECT {LEAD_COLUMNS} FROM conversation_messages m
                   JOIN conversations c ON c.id = m.conversation_id
                   JOIN leads l ON l.organization_id = c.organization_id
                               AND lower(l.email) = c.participant_key
                   WHERE m.organization_id = ? AND m.message_id_header = ? AND m.direction = 'sent'
                   LIMIT 1"#
            ))
            .bind(organization_id)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
            if via_conversation.is_some() {
                return Ok(via_conversation);
            }
        }

        if let Some(address) = &correlation.address {
            let by_address = sqlx::query_as::<_, Lead>(&format!(
                "SELECT {LEAD_COLUMNS} FROM leads l WHERE l.organization_id = ? AND lower(l.email) = lower(?) LIMIT 1"
            ))
            .bind(organization_id)
            .bind(address)
            .fetch_optional(&self.pool)
            .await?;
            return Ok(by_address);
        }
        Ok(None)
    }

    async fn lead(&self, lead_id: &str) -> StoreResult<Option<Lead>> {
        let row = sqlx::query_as::<_, Lead>(&format!(
            "SELECT {LEAD_COLUMNS} FROM leads l WHERE l.id = ?"
        ))
        .bind(lead_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn set_lead_bounced(&self, lead_id: &str, at: i64) -> StoreResult<bool> {
        let changed = sqlx::query(
            "UPDATE leads SET status = 'bounced', bounced_at = ? WHERE id = ? AND status != 'bounced'",
        )
        .bind(at)
        .bind(lead_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(changed == 1)
    }

    async fn set_lead_replied(&self, lead_id: &str, at: i64) -> StoreResult<bool> {
        let changed = sqlx::query(
            "UPDATE leads SET status = 'replied', replied_at = ? WHERE id = ? AND status = 'active'",
        )
        .bind(at)
        .bind(lead_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(changed == 1)
    }

    async fn find_conversation_message(
        &self,
        organization_id: &str,
        message_id_header: &str,
    ) -> StoreResult<Option<ConversationMessage>> {
        let row = sqlx::query_as::<_, ConversationMessage>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM conversation_messages WHERE organization_id = ? AND message_id_header = ?"
        ))
        .bind(organization_id)
        .bind(message_id_header)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn conversation(&self, conversation_id: &str) -> StoreResult<Option<Conversation>> {
        let row = sqlx::query_as::<_, Conversation>(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?"
        ))
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn conversation_messages(
        &self,
        conversation_id: &str,
    ) -> StoreResult<Vec<ConversationMessage>> {
        let rows = sqlx::query_as::<_, ConversationMessage>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM conversation_messages WHERE conversation_id = ? ORDER BY sent_at, id"
        ))
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn begin_reconcile(&self) -> StoreResult<Box<dyn ReconcileTx>> {
        let mut conn = self.pool.acquire().await?;
        // Take the write lock up front so concurrent reconcilers queue on the
        // busy timeout instead of failing a read-to-write lock upgrade.
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(Box::new(SqliteReconcileTx { conn: Some(conn) }))
    }

    async fn sent_history(
        &self,
        organization_id: Option<&str>,
        after: Option<(i64, String)>,
        limit: i64,
    ) -> StoreResult<Vec<ScheduledSend>> {
        let (after_at, after_id) = match after {
            Some((at, id)) => (Some(at), id),
            None => (None, String::new()),
        };
        let rows = sqlx::query_as::<_, ScheduledSend>(
            r#"SELECT id, organization_id, account_id, lead_id, recipient, message_id_header,
                      thread_id, subject, status, sent_at
               FROM scheduled_sends
               WHERE status = 'sent'
                 AND message_id_header IS NOT NULL
                 AND sent_at IS NOT NULL
                 AND (?1 IS NULL OR organization_id = ?1)
                 AND (?2 IS NULL OR sent_at > ?2 OR (sent_at = ?2 AND id > ?3))
               ORDER BY sent_at, id
               LIMIT ?4"#,
        )
        .bind(organization_id)
        .bind(after_at)
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn increment_daily_sent(&self, account_id: &str) -> StoreResult<bool> {
        let changed = sqlx::query(
            r#"UPDATE email_accounts
               SET daily_sent = daily_sent + 1, updated_at = strftime('%s','now')
               WHERE id = ? AND daily_sent < daily_quota"#,
        )
        .bind(account_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(changed == 1)
    }

    async fn decrement_daily_sent(&self, account_id: &str) -> StoreResult<bool> {
        let changed = sqlx::query(
            r#"UPDATE email_accounts
               SET daily_sent = daily_sent - 1, updated_at = strftime('%s','now')
               WHERE id = ? AND daily_sent > 0"#,
        )
        .bind(account_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(changed == 1)
    }

    async fn accounts_due_for_reset(&self, boundary: i64) -> StoreResult<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT id FROM email_accounts WHERE last_reset_at < ? ORDER BY id",
        )
        .bind(boundary)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn reset_daily_counter(
        &self,
        account_id: &str,
        boundary: i64,
        now: i64,
    ) -> StoreResult<bool> {
        let changed = sqlx::query(
            r#"UPDATE email_accounts
               SET daily_sent = 0, last_reset_at = ?, updated_at = ?
               WHERE id = ? AND last_reset_at < ?"#,
        )
        .bind(now)
        .bind(now)
        .bind(account_id)
        .bind(boundary)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(changed == 1)
    }

    async fn record_account_result(
        &self,
        account_id: &str,
        ok: bool,
        now: i64,
    ) -> StoreResult<AccountHealth> {
        let status = if ok {
            sqlx::query_scalar::<_, AccountHealth>(
                r#"UPDATE email_accounts
                   SET consecutive_failures = 0, health_status = 'healthy', updated_at = ?
                   WHERE id = ?
                   RETURNING health_status"#,
            )
            .bind(now)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?
        } else {
            sqlx::query_scalar::<_, AccountHealth>(
                r#"UPDATE email_accounts
                   SET consecutive_failures = consecutive_failures + 1,
                       health_status = CASE WHEN consecutive_failures + 1 >= ? THEN 'failing' ELSE 'degraded' END,
                       updated_at = ?
                   WHERE id = ?
                   RETURNING health_status"#,
            )
            .bind(AccountHealth::FAILING_THRESHOLD)
            .bind(now)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?
        };
        status.ok_or_else(|| StoreError::Corrupt(format!("unknown account {account_id}")))
    }

    async fn upsert_health_record(&self, record: &SystemHealthRecord) -> StoreResult<()> {
        let metadata = serde_json::to_string(&record.metadata)?;
        sqlx::query(
            r#"INSERT INTO system_health (service, status, last_heartbeat, metadata)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(service) DO UPDATE SET
                 status = excluded.status,
                 last_heartbeat = excluded.last_heartbeat,
                 metadata = excluded.metadata"#,
        )
        .bind(&record.service)
        .bind(record.status)
        .bind(record.last_heartbeat)
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn health_records(&self) -> StoreResult<Vec<SystemHealthRecord>> {
        let rows = sqlx::query(
            "SELECT service, status, last_heartbeat, metadata FROM system_health ORDER BY service",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let metadata: String = row.try_get("metadata")?;
            out.push(SystemHealthRecord {
                service: row.try_get("service")?,
                status: row.try_get::<ServiceStatus, _>("status")?,
                last_heartbeat: row.try_get("last_heartbeat")?,
                metadata: serde_json::from_str(&metadata)?,
            });
        }
        Ok(out)
    }

    async fn mark_service_stale(&self, service: &str, older_than: i64) -> StoreResult<bool> {
        let changed = sqlx::query(
            "UPDATE system_health SET status = 'stale' WHERE service = ? AND last_heartbeat < ? AND status != 'stale'",
        )
        .bind(service)
        .bind(older_than)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(changed == 1)
    }

    async fn maintain(&self, vacuum: bool) -> StoreResult<()> {
        sqlx::query("PRAGMA optimize").execute(&self.pool).await?;
        sqlx::query("ANALYZE").execute(&self.pool).await?;
        if vacuum {
            sqlx::query("VACUUM").execute(&self.pool).await?;
        }
        Ok(())
    }
}

/// `BEGIN IMMEDIATE` held on one pooled connection until commit or rollback.
struct SqliteReconcileTx {
    conn: Option<PoolConnection<Sqlite>>,
}

impl SqliteReconcileTx {
    fn conn(&mut self) -> StoreResult<&mut PoolConnection<Sqlite>> {
        self.conn
            .as_mut()
            .ok_or_else(|| StoreError::Corrupt("reconcile transaction already finished".into()))
    }
}

#[async_trait]
impl ReconcileTx for SqliteReconcileTx {
    async fn find_message(
        &mut self,
        organization_id: &str,
        message_id_header: &str,
    ) -> StoreResult<Option<ConversationMessage>> {
        let conn = self.conn()?;
        let row = sqlx::query_as::<_, ConversationMessage>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM conversation_messages WHERE organization_id = ? AND message_id_header = ?"
        ))
        .bind(organization_id)
        .bind(message_id_header)
        .fetch_optional(&mut **conn)
        .await?;
        Ok(row)
    }

    async fn conversation(&mut self, conversation_id: &str) -> StoreResult<Option<Conversation>> {
        let conn = self.conn()?;
        let row = sqlx::query_as::<_, Conversation>(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?"
        ))
        .bind(conversation_id)
        .fetch_optional(&mut **conn)
        .await?;
        Ok(row)
    }

    async fn find_or_create_conversation(
        &mut self,
        organization_id: &str,
        thread_id: Option<&str>,
        participant_key: &str,
        initial_type: ConversationType,
        at: i64,
    ) -> StoreResult<Conversation> {
        let conn = self.conn()?;

        if let Some(thread_id) = thread_id {
            let by_thread = sqlx::query_as::<_, Conversation>(
                r#"SELECT c.id, c.organization_id, c.participant_key, c.conversation_type,
                          c.last_activity_at, c.created_at, c.updated_at
                   FROM conversation_threads t
                   JOIN conversations c ON c.id = t.conversation_id
                   WHERE t.organization_id = ? AND t.thread_id = ?"#,
            )
            .bind(organization_id)
            .bind(thread_id)
            .fetch_optional(&mut **conn)
            .await?;
            if let Some(conversation) = by_thread {
                return Ok(conversation);
            }
        }

        let now = super::now_epoch();
        let conversation = sqlx::query_as::<_, Conversation>(&format!(
            r#"INSERT INTO conversations (
                 id, organization_id, participant_key, conversation_type,
                 last_activity_at, created_at, updated_at
               ) VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(organization_id, participant_key)
                 DO UPDATE SET participant_key = excluded.participant_key
               RETURNING {CONVERSATION_COLUMNS}"#
        ))
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(organization_id)
        .bind(participant_key)
        .bind(initial_type)
        .bind(at)
        .bind(now)
        .bind(now)
        .fetch_one(&mut **conn)
        .await?;

        if let Some(thread_id) = thread_id {
            sqlx::query(
                r#"INSERT INTO conversation_threads (organization_id, thread_id, conversation_id)
                   VALUES (?, ?, ?)
                   ON CONFLICT(organization_id, thread_id) DO NOTHING"#,
            )
            .bind(organization_id)
            .bind(thread_id)
            .bind(&conversation.id)
            .execute(&mut **conn)
            .await?;
        }

        Ok(conversation)
    }

    async fn insert_message(&mut self, message: &ConversationMessage) -> StoreResult<bool> {
        let conn = self.conn()?;
        let inserted = sqlx::query(
            r#"INSERT INTO conversation_messages (
                 id, organization_id, account_id, conversation_id, message_id_header,
                 thread_id, direction, subject, sent_at, scheduled_send_id, created_at
               ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(organization_id, message_id_header) DO NOTHING"#,
        )
        .bind(&message.id)
        .bind(&message.organization_id)
        .bind(&message.account_id)
        .bind(&message.conversation_id)
        .bind(&message.message_id_header)
        .bind(&message.thread_id)
        .bind(message.direction)
        .bind(&message.subject)
        .bind(message.sent_at)
        .bind(&message.scheduled_send_id)
        .bind(message.created_at)
        .execute(&mut **conn)
        .await?
        .rows_affected();
        Ok(inserted == 1)
    }

    async fn advance_activity(
        &mut self,
        conversation_id: &str,
        at: i64,
        direction: Direction,
    ) -> StoreResult<Conversation> {
        let conn = self.conn()?;
        let row = sqlx::query_as::<_, Conversation>(&format!(
            r#"UPDATE conversations
               SET last_activity_at = MAX(last_activity_at, ?),
                   conversation_type = CASE WHEN conversation_type = ? THEN conversation_type ELSE 'mixed' END,
                   updated_at = ?
               WHERE id = ?
               RETURNING {CONVERSATION_COLUMNS}"#
        ))
        .bind(at)
        .bind(ConversationType::from(direction))
        .bind(super::now_epoch())
        .bind(conversation_id)
        .fetch_optional(&mut **conn)
        .await?;
        row.ok_or_else(|| StoreError::Corrupt(format!("conversation {conversation_id} vanished")))
    }

    async fn commit(mut self: Box<Self>) -> StoreResult<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        if let Err(e) = sqlx::query("COMMIT").execute(&mut *conn).await {
            // A failed COMMIT can leave the transaction open on this connection.
            if let Err(rollback) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                tracing::warn!(error = %rollback, "rollback after failed commit failed, closing connection");
                drop(conn.detach());
            }
            return Err(e.into());
        }
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                tracing::warn!(error = %e, "reconcile rollback failed, closing connection");
                drop(conn.detach());
            }
        }
    }
}

impl Drop for SqliteReconcileTx {
    fn drop(&mut self) {
        // Abandoned mid-flight: closing the connection makes SQLite discard the transaction.
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}
