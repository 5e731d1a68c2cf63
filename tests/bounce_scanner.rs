mod common;

use outreach_worker::db::Store;
use outreach_worker::models::{BounceType, Direction, LeadStatus, ScanPosition, ServiceStatus};
use outreach_worker::services::{JobContext, ScannerSettings};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use common::{
    ambiguous, count, hard_bounce, harness, harness_with, reply, seed_account, seed_lead,
    seed_org, seed_sent, soft_bounce, Harness,
};

fn ctx() -> JobContext {
    JobContext::new("bounce-scanner", CancellationToken::new())
}

/// One organization, one account, one lead who was sent `orig-1@ours.example`.
async fn single_account() -> Harness {
    let h = harness().await;
    seed_org(&h.store, "org-1").await;
    seed_account(&h.store, "acc-1", "org-1", 50, 0).await;
    seed_lead(&h.store, "lead-jane", "org-1", "jane@lead.example").await;
    seed_sent(&h.store, "send-1", "org-1", "acc-1", Some("lead-jane"), "jane@lead.example", "orig-1@ours.example", 100).await;
    h
}

#[tokio::test]
async fn hard_bounce_marks_lead_and_advances_cursor() {
    let h = single_account().await;
    h.provider.deliver("acc-1", 1, hard_bounce("b1@mx.example.net", "orig-1@ours.example", "jane@lead.example"));

    let stats = h.scanner.run_scan(&ctx()).await;

    assert_eq!(stats.bounces_found, 1);
    assert_eq!(stats.hard_bounces, 1);
    assert_eq!(stats.leads_bounced, 1);
    assert_eq!(stats.errors, 0);

    let lead = h.store.lead("lead-jane").await.unwrap().unwrap();
    assert_eq!(lead.status, LeadStatus::Bounced);
    assert!(lead.bounced_at.is_some());

    let records = h.store.bounce_records("acc-1").await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].bounce_type, BounceType::Hard);
    assert_eq!(records[0].lead_id.as_deref(), Some("lead-jane"));
    assert_eq!(records[0].message_id, "b1@mx.example.net");

    let cursor = h.store.scan_cursor("acc-1").await.unwrap().unwrap();
    assert_eq!(cursor.last_uid, 1);

    let health = h.health.snapshot().await.unwrap();
    let scanner = health.iter().find(|r| r.service == "bounce-scanner").unwrap();
    assert_eq!(scanner.status, ServiceStatus::Ok);
    assert_eq!(scanner.metadata["bounces_found"], 1);
}

#[tokio::test]
async fn second_run_resumes_after_cursor() {
    let h = single_account().await;
    h.provider.deliver("acc-1", 1, hard_bounce("b1@mx.example.net", "orig-1@ours.example", "jane@lead.example"));
    h.scanner.run_scan(&ctx()).await;

    let stats = h.scanner.run_scan(&ctx()).await;
    assert_eq!(stats.messages_examined, 0);
    let calls = h.provider.calls();
    assert!(matches!(calls[0].1, ScanPosition::Since(_)));
    assert_eq!(calls.last().unwrap().1, ScanPosition::AfterUid(1));
}

#[tokio::test]
async fn replayed_bounce_is_recorded_once() {
    let h = single_account().await;
    h.provider.deliver("acc-1", 1, hard_bounce("b1@mx.example.net", "orig-1@ours.example", "jane@lead.example"));
    h.scanner.run_scan(&ctx()).await;

    sqlx::query("DELETE FROM scan_cursors").execute(h.store.pool()).await.unwrap();
    let stats = h.scanner.run_scan(&ctx()).await;

    assert_eq!(stats.bounces_found, 1);
    assert_eq!(stats.duplicate_bounces, 1);
    assert_eq!(stats.leads_bounced, 0);
    assert_eq!(count(&h.store, "SELECT COUNT(*) FROM bounce_records").await, 1);
}

#[tokio::test]
async fn lost_cursor_write_replays_without_duplicates() {
    let h = single_account().await;
    h.provider.deliver("acc-1", 1, hard_bounce("b1@mx.example.net", "orig-1@ours.example", "jane@lead.example"));
    sqlx::query(
        "CREATE TRIGGER fail_cursor BEFORE INSERT ON scan_cursors BEGIN SELECT RAISE(ABORT, 'disk full'); END",
    )
    .execute(h.store.pool())
    .await
    .unwrap();

    let crashed = h.scanner.run_scan(&ctx()).await;
    assert_eq!(crashed.errors, 1);
    assert!(h.store.scan_cursor("acc-1").await.unwrap().is_none());
    assert_eq!(count(&h.store, "SELECT COUNT(*) FROM bounce_records").await, 1);

    sqlx::query("DROP TRIGGER fail_cursor").execute(h.store.pool()).await.unwrap();
    let replay = h.scanner.run_scan(&ctx()).await;

    assert_eq!(replay.errors, 0);
    assert_eq!(replay.duplicate_bounces, 1);
    assert_eq!(count(&h.store, "SELECT COUNT(*) FROM bounce_records").await, 1);
    assert_eq!(h.store.scan_cursor("acc-1").await.unwrap().unwrap().last_uid, 1);
}

#[tokio::test]
async fn failing_organization_does_not_stop_the_others() {
    let h = harness().await;
    seed_org(&h.store, "org-a").await;
    seed_org(&h.store, "org-b").await;
    seed_account(&h.store, "acc-a", "org-a", 50, 0).await;
    seed_account(&h.store, "acc-b", "org-b", 50, 0).await;
    h.provider.fail("acc-a");
    h.provider.deliver("acc-b", 1, soft_bounce("s1@mx.example.net", "someone@else.example"));

    let stats = h.scanner.run_scan(&ctx()).await;

    assert_eq!(stats.errors, 1);
    assert_eq!(stats.organizations_processed, 2);
    assert_eq!(stats.organizations_failed, 1);
    assert_eq!(stats.bounces_found, 1);
    assert_eq!(stats.soft_bounces, 1);
    assert_eq!(stats.unmatched_bounces, 1);
    assert_eq!(h.store.bounce_records("acc-b").await.unwrap().len(), 1);

    let health = h.health.snapshot().await.unwrap();
    let scanner = health.iter().find(|r| r.service == "bounce-scanner").unwrap();
    assert_eq!(scanner.status, ServiceStatus::Degraded);
}

#[tokio::test]
async fn errors_count_failing_organizations_not_accounts() {
    let h = harness().await;
    seed_org(&h.store, "org-a").await;
    seed_account(&h.store, "acc-a1", "org-a", 50, 0).await;
    seed_account(&h.store, "acc-a2", "org-a", 50, 0).await;
    h.provider.fail("acc-a1");
    h.provider.fail("acc-a2");

    let stats = h.scanner.run_scan(&ctx()).await;

    assert_eq!(stats.errors, 1);
    assert_eq!(stats.accounts_failed, 2);
    assert_eq!(stats.organizations_failed, 1);
    assert_eq!(stats.organizations_processed, 1);
    assert_eq!(stats.accounts_scanned, 0);
}

#[tokio::test]
async fn repeated_failures_mark_the_account_failing() {
    let h = harness().await;
    seed_org(&h.store, "org-a").await;
    seed_account(&h.store, "acc-a", "org-a", 50, 0).await;
    h.provider.fail("acc-a");

    for _ in 0..3 {
        h.scanner.run_scan(&ctx()).await;
    }
    let account = h.store.account("acc-a").await.unwrap().unwrap();
    assert_eq!(account.consecutive_failures, 3);
    assert_eq!(account.health_status.as_str(), "failing");
}

#[tokio::test]
async fn missing_credentials_skip_the_account() {
    let h = single_account().await;
    sqlx::query("UPDATE email_accounts SET credential_ref = '' WHERE id = 'acc-1'")
        .execute(h.store.pool())
        .await
        .unwrap();

    let stats = h.scanner.run_scan(&ctx()).await;

    assert_eq!(stats.accounts_skipped, 1);
    assert_eq!(stats.accounts_failed, 1);
    assert_eq!(stats.errors, 1);
    assert!(h.provider.calls().is_empty());
}

#[tokio::test]
async fn soft_bounce_matched_by_address_marks_the_lead() {
    let h = single_account().await;
    h.provider.deliver("acc-1", 1, soft_bounce("s1@mx.example.net", "jane@lead.example"));

    let stats = h.scanner.run_scan(&ctx()).await;

    assert_eq!(stats.soft_bounces, 1);
    assert_eq!(stats.leads_bounced, 1);
    let records = h.store.bounce_records("acc-1").await.unwrap();
    assert_eq!(records[0].bounce_type, BounceType::Soft);
    assert_eq!(records[0].failed_recipient.as_deref(), Some("jane@lead.example"));
}

#[tokio::test]
async fn uid_validity_change_rescans_the_lookback_window() {
    let h = single_account().await;
    h.provider.deliver("acc-1", 5, hard_bounce("b1@mx.example.net", "orig-1@ours.example", "jane@lead.example"));
    h.scanner.run_scan(&ctx()).await;
    assert_eq!(h.store.scan_cursor("acc-1").await.unwrap().unwrap().uid_validity, 1);

    h.provider.set_uid_validity("acc-1", 2);
    h.provider.deliver("acc-1", 1, hard_bounce("b2@mx.example.net", "other@ours.example", "nobody@lead.example"));
    let stats = h.scanner.run_scan(&ctx()).await;

    assert_eq!(stats.bounces_found, 2);
    assert_eq!(stats.duplicate_bounces, 1);
    assert_eq!(count(&h.store, "SELECT COUNT(*) FROM bounce_records").await, 2);
    let cursor = h.store.scan_cursor("acc-1").await.unwrap().unwrap();
    assert_eq!(cursor.uid_validity, 2);

    let calls = h.provider.calls();
    let second_run = &calls[1..];
    assert_eq!(second_run[0].1, ScanPosition::AfterUid(5));
    assert!(matches!(second_run[1].1, ScanPosition::Since(_)));
}

#[tokio::test]
async fn reply_is_ingested_and_marks_the_lead_replied() {
    let h = single_account().await;
    h.provider.deliver("acc-1", 1, reply("r1@lead.example", "Jane <jane@lead.example>", "orig-1@ours.example"));

    let stats = h.scanner.run_scan(&ctx()).await;

    assert_eq!(stats.replies_ingested, 1);
    assert_eq!(stats.bounces_found, 0);
    let lead = h.store.lead("lead-jane").await.unwrap().unwrap();
    assert_eq!(lead.status, LeadStatus::Replied);

    let message = h
        .store
        .find_conversation_message("org-1", "r1@lead.example")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.direction, Direction::Received);
    assert_eq!(message.thread_id.as_deref(), Some("orig-1@ours.example"));
}

#[tokio::test]
async fn reply_from_bounced_lead_keeps_bounced_status() {
    let h = single_account().await;
    h.provider.deliver("acc-1", 1, hard_bounce("b1@mx.example.net", "orig-1@ours.example", "jane@lead.example"));
    h.provider.deliver("acc-1", 2, reply("r1@lead.example", "jane@lead.example", "orig-1@ours.example"));

    let stats = h.scanner.run_scan(&ctx()).await;

    assert_eq!(stats.replies_ingested, 1);
    let lead = h.store.lead("lead-jane").await.unwrap().unwrap();
    assert_eq!(lead.status, LeadStatus::Bounced);
}

#[tokio::test]
async fn ambiguous_notice_is_counted_not_recorded() {
    let h = single_account().await;
    h.provider.deliver("acc-1", 1, ambiguous("n1@mx.example.net"));

    let stats = h.scanner.run_scan(&ctx()).await;

    assert_eq!(stats.ambiguous, 1);
    assert_eq!(stats.bounces_found, 0);
    assert_eq!(count(&h.store, "SELECT COUNT(*) FROM bounce_records").await, 0);
    assert_eq!(h.store.scan_cursor("acc-1").await.unwrap().unwrap().last_uid, 1);
}

#[tokio::test]
async fn shutdown_mid_run_keeps_finished_pages() {
    let h = harness().await;
    seed_org(&h.store, "org-1").await;
    seed_account(&h.store, "acc-1", "org-1", 50, 0).await;
    seed_account(&h.store, "acc-2", "org-1", 50, 0).await;
    h.provider.deliver("acc-1", 1, soft_bounce("s1@mx.example.net", "someone@else.example"));
    h.provider.deliver("acc-2", 1, soft_bounce("s2@mx.example.net", "someone@else.example"));

    let token = CancellationToken::new();
    let trigger = token.clone();
    h.provider.on_list(move |account_id| {
        if account_id == "acc-1" {
            trigger.cancel();
        }
    });
    let stats = h.scanner.run_scan(&JobContext::new("bounce-scanner", token)).await;

    assert!(stats.interrupted);
    assert_eq!(stats.accounts_scanned, 1);
    assert_eq!(h.store.scan_cursor("acc-1").await.unwrap().unwrap().last_uid, 1);
    assert!(h.store.scan_cursor("acc-2").await.unwrap().is_none());
    assert!(h.provider.calls().iter().all(|(id, _)| id == "acc-1"));

    let health = h.health.snapshot().await.unwrap();
    let scanner = health.iter().find(|r| r.service == "bounce-scanner").unwrap();
    assert_eq!(scanner.status, ServiceStatus::Interrupted);
}

#[tokio::test]
async fn pages_are_bounded_per_account() {
    let h = harness_with(ScannerSettings {
        message_page_size: 2,
        max_pages_per_account: 2,
        account_pacing: Duration::ZERO,
        ..ScannerSettings::default()
    })
    .await;
    seed_org(&h.store, "org-1").await;
    seed_account(&h.store, "acc-1", "org-1", 50, 0).await;
    for uid in 1..=5 {
        h.provider.deliver("acc-1", uid, ambiguous(&format!("n{uid}@mx.example.net")));
    }

    let first = h.scanner.run_scan(&ctx()).await;
    assert_eq!(first.messages_examined, 4);
    assert_eq!(h.store.scan_cursor("acc-1").await.unwrap().unwrap().last_uid, 4);

    let second = h.scanner.run_scan(&ctx()).await;
    assert_eq!(second.messages_examined, 1);
    assert_eq!(h.store.scan_cursor("acc-1").await.unwrap().unwrap().last_uid, 5);
}

#[tokio::test]
async fn organization_window_rotates_between_runs() {
    let h = harness_with(ScannerSettings {
        org_page_size: 1,
        max_org_pages_per_run: 1,
        account_pacing: Duration::ZERO,
        ..ScannerSettings::default()
    })
    .await;
    for (org, account) in [("org-a", "acc-a"), ("org-b", "acc-b"), ("org-c", "acc-c")] {
        seed_org(&h.store, org).await;
        seed_account(&h.store, account, org, 50, 0).await;
    }

    for _ in 0..3 {
        let stats = h.scanner.run_scan(&ctx()).await;
        assert_eq!(stats.organizations_processed, 1);
    }
    let mut scanned: Vec<String> = h.provider.calls().into_iter().map(|(id, _)| id).collect();
    scanned.sort();
    assert_eq!(scanned, vec!["acc-a", "acc-b", "acc-c"]);
}
