use chrono::Utc;
use futures::TryStreamExt;

use super::conn::ImapSession;
use crate::error::ProviderError;
use crate::models::{MessagePage, RawMessage, ScanPosition};

/// IMAP SEARCH criterion for a scan position.
pub fn search_query(position: ScanPosition) -> String {
    match position {
        ScanPosition::AfterUid(last_uid) => format!("UID {}:*", last_uid.saturating_add(1)),
        ScanPosition::Since(date) => format!("SINCE {}", date.format("%d-%b-%Y")),
    }
}

/// `UID n:*` always matches the highest message even when it is below n,
/// so the result is filtered again before paging.
pub fn select_page(found: impl IntoIterator<Item = u32>, position: ScanPosition, page_size: usize) -> Vec<u32> {
    let mut uids: Vec<u32> = found
        .into_iter()
        .filter(|uid| match position {
            ScanPosition::AfterUid(last_uid) => *uid > last_uid,
            ScanPosition::Since(_) => true,
        })
        .collect();
    uids.sort_unstable();
    uids.dedup();
    uids.truncate(page_size);
    uids
}

pub async fn fetch_page(
    session: &mut ImapSession,
    mailbox: &str,
    position: ScanPosition,
    page_size: usize,
) -> Result<MessagePage, ProviderError> {
    let selected = session.select(mailbox).await?;
    let uid_validity = selected.uid_validity.unwrap_or(0);

    let query = search_query(position);
    let found = session.uid_search(&query).await?;
    let uids = select_page(found, position, page_size);
    tracing::debug!(mailbox = %mailbox, %query, count = uids.len(), uid_validity, "imap page selected");
    if uids.is_empty() {
        return Ok(MessagePage {
            uid_validity,
            messages: Vec::new(),
        });
    }

    let set = uids
        .iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let fetches: Vec<_> = session
        .uid_fetch(&set, "(UID INTERNALDATE BODY.PEEK[])")
        .await?
        .try_collect()
        .await?;

    let mut messages = Vec::with_capacity(fetches.len());
    for fetch in &fetches {
        let Some(uid) = fetch.uid else { continue };
        let Some(body) = fetch.body() else {
            tracing::warn!(uid, "fetched message has no body, skipping");
            continue;
        };
        messages.push(RawMessage {
            uid,
            internal_date: fetch.internal_date().map(|d| d.with_timezone(&Utc)),
            raw: body.to_vec(),
        });
    }
    messages.sort_by_key(|m| m.uid);
    Ok(MessagePage {
        uid_validity,
        messages,
    })
}
