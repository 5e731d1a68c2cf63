use std::sync::Arc;

use tracing::{debug, warn};

use crate::db::{now_epoch, ReconcileTx, Store};
use crate::error::{StoreError, StoreResult};
use crate::models::conversation::{normalize_message_id, participant_key};
use crate::models::{Conversation, ConversationMessage, Direction, EmailEnvelope, ScheduledSend};

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub conversation: Conversation,
    /// False when the message was already present and nothing was written
    pub created_message: bool,
}

/// Thread hint for inbound mail: the root of `References`, else `In-Reply-To`.
pub fn received_thread_hint(references: &[String], in_reply_to: Option<&str>) -> Option<String> {
    references
        .first()
        .map(|r| normalize_message_id(r))
        .or_else(|| in_reply_to.map(normalize_message_id))
        .filter(|s| !s.is_empty())
}

/// Folds every message, in either direction, into exactly one conversation.
pub struct InboxReconciler {
    store: Arc<dyn Store>,
}

impl InboxReconciler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Idempotent on (organization_id, Message-ID): a repeat returns the
    /// conversation the first call produced and writes nothing.
    pub async fn ingest_email(
        &self,
        envelope: &EmailEnvelope,
        direction: Direction,
    ) -> StoreResult<IngestOutcome> {
        let header = normalize_message_id(&envelope.message_id_header);
        if header.is_empty() {
            return Err(StoreError::Corrupt("message has no Message-ID".into()));
        }

        let mut tx = self.store.begin_reconcile().await?;
        match ingest_in(tx.as_mut(), envelope, &header, direction).await {
            Ok(outcome) => {
                tx.commit().await?;
                debug!(
                    org_id = %envelope.organization_id,
                    conversation_id = %outcome.conversation.id,
                    created = outcome.created_message,
                    direction = direction.as_str(),
                    "message reconciled"
                );
                Ok(outcome)
            }
            Err(e) => {
                tx.rollback().await;
                if e.is_conflict() {
                    // The dedup key was taken between our read and our write.
                    if let Some(existing) = self
                        .store
                        .find_conversation_message(&envelope.organization_id, &header)
                        .await?
                    {
                        if let Some(conversation) =
                            self.store.conversation(&existing.conversation_id).await?
                        {
                            return Ok(IngestOutcome {
                                conversation,
                                created_message: false,
                            });
                        }
                    }
                }
                warn!(org_id = %envelope.organization_id, message_id = %header, error = %e, "reconcile failed");
                Err(e)
            }
        }
    }

    /// Ingests a row written by the send path as an outbound message.
    pub async fn record_outbound(&self, send: &ScheduledSend) -> StoreResult<IngestOutcome> {
        let header = send
            .message_id_header
            .as_deref()
            .map(normalize_message_id)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| StoreError::Corrupt(format!("scheduled send {} has no Message-ID", send.id)))?;
        let thread_id = send
            .thread_id
            .as_deref()
            .map(normalize_message_id)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| header.clone());

        let envelope = EmailEnvelope {
            organization_id: send.organization_id.clone(),
            account_id: send.account_id.clone(),
            message_id_header: header,
            thread_id: Some(thread_id),
            counterpart: send.recipient.clone(),
            subject: send.subject.clone(),
            sent_at: send.sent_at.unwrap_or_else(now_epoch),
            scheduled_send_id: Some(send.id.clone()),
        };
        self.ingest_email(&envelope, Direction::Sent).await
    }
}

async fn ingest_in(
    tx: &mut dyn ReconcileTx,
    envelope: &EmailEnvelope,
    header: &str,
    direction: Direction,
) -> StoreResult<IngestOutcome> {
    let org = envelope.organization_id.as_str();

    if let Some(existing) = tx.find_message(org, header).await? {
        return existing_outcome(tx, &existing).await;
    }

    let thread_id = envelope
        .thread_id
        .as_deref()
        .map(normalize_message_id)
        .filter(|t| !t.is_empty());
    let participant = participant_key(&envelope.counterpart);
    let conversation = tx
        .find_or_create_conversation(
            org,
            thread_id.as_deref(),
            &participant,
            direction.into(),
            envelope.sent_at,
        )
        .await?;

    let message = ConversationMessage {
        id: uuid::Uuid::new_v4().to_string(),
        organization_id: envelope.organization_id.clone(),
        account_id: envelope.account_id.clone(),
        conversation_id: conversation.id.clone(),
        message_id_header: header.to_string(),
        thread_id,
        direction,
        subject: envelope.subject.clone(),
        sent_at: envelope.sent_at,
        scheduled_send_id: envelope.scheduled_send_id.clone(),
        created_at: now_epoch(),
    };
    if !tx.insert_message(&message).await? {
        if let Some(existing) = tx.find_message(org, header).await? {
            return existing_outcome(tx, &existing).await;
        }
        return Err(StoreError::Conflict(format!("message {header} vanished after conflict")));
    }

    let conversation = tx
        .advance_activity(&conversation.id, envelope.sent_at, direction)
        .await?;
    Ok(IngestOutcome {
        conversation,
        created_message: true,
    })
}

async fn existing_outcome(
    tx: &mut dyn ReconcileTx,
    existing: &ConversationMessage,
) -> StoreResult<IngestOutcome> {
    let conversation = tx
        .conversation(&existing.conversation_id)
        .await?
        .ok_or_else(|| {
            StoreError::Corrupt(format!(
                "message {} points at missing conversation {}",
                existing.id, existing.conversation_id
            ))
        })?;
    Ok(IngestOutcome {
        conversation,
        created_message: false,
    })
}
