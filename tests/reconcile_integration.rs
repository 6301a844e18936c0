//! End-to-end reconciliation passes against a scripted content store

mod common;

use common::*;
use ledger_reconciler::{ErrorKind, FetchedContent, LedgerEntry, ReconcileError, ReconcileOptions};
use std::time::Duration;

/// Connection failures stay retryable; unreadable and oversize content is quarantined
#[tokio::test]
async fn test_mixed_batch_resolves_only_valid_content() {
    let h = harness(mixed_store());

    let resolved = h.reconciler.reconcile(mixed_batch(), 5, 1).await.unwrap();

    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].id, "hOk");
    assert_eq!(&resolved[0].content[..], b"ok");
    assert_eq!(resolved[0].size, 2);
    assert_eq!(resolved[0].provenance, provenance(10));

    // one attempt plus one in-pass retry for the connection failure only
    assert_eq!(h.store.calls("hConnErr"), 2);
    assert_eq!(h.store.calls("hBad"), 1);
    assert_eq!(h.store.calls("hBig"), 1);

    let ignored = h.ledger.data_ids_with_reasons().unwrap();
    assert_eq!(ignored.len(), 3);

    let conn = &ignored["hConnErr"];
    assert!(conn.to_retry);
    assert_eq!(conn.iteration, 1);
    assert_eq!(conn.last_try_timestamp, 0);
    assert_eq!(conn.entry.error.as_ref().unwrap().kind, ErrorKind::Connection);

    let bad = &ignored["hBad"];
    assert!(!bad.to_retry);
    assert_eq!(bad.iteration, 1);
    assert_eq!(bad.entry.error.as_ref().unwrap().kind, ErrorKind::InvalidContent);

    let big = &ignored["hBig"];
    assert!(!big.to_retry);
    assert_eq!(big.iteration, 1);
    assert_eq!(big.entry.error.as_ref().unwrap().kind, ErrorKind::SizeMismatch);
    assert_eq!(h.ledger.reason("hBig").unwrap().as_deref(), Some("Incorrect declared size"));

    assert!(h.ledger.record("hOk").unwrap().is_none());
}

#[tokio::test]
async fn test_zero_retries_means_single_attempt() {
    let h = harness(mixed_store());

    let outcome = h
        .reconciler
        .reconcile_pass(
            mixed_batch(),
            ReconcileOptions {
                concurrency: 5,
                max_in_pass_retries: 0,
            },
        )
        .await
        .unwrap();

    assert_eq!(h.store.calls("hConnErr"), 1);
    assert_eq!(outcome.summary.total, 4);
    assert_eq!(outcome.summary.resolved, 1);
    assert_eq!(outcome.summary.resolved_after_retry, 0);
    assert_eq!(outcome.summary.connection_errors, 1);
    assert_eq!(outcome.summary.invalid_content, 1);
    assert_eq!(outcome.summary.size_mismatch, 1);
}

#[tokio::test]
async fn test_in_pass_retry_recovers_connection_failure() {
    let store = mixed_store();
    store.script(
        "hConnErr",
        vec![connection_error(), Ok(FetchedContent::new("ok"))],
    );
    let h = harness(store);

    let outcome = h
        .reconciler
        .reconcile_pass(mixed_batch(), ReconcileOptions::default())
        .await
        .unwrap();

    let ids: Vec<_> = outcome.resolved.iter().map(|c| c.id.as_str()).collect();
    // first-attempt successes come before retry successes
    assert_eq!(ids, vec!["hOk", "hConnErr"]);
    assert!(outcome.resolved.iter().all(|c| &c.content[..] == b"ok"));
    assert_eq!(outcome.summary.resolved_after_retry, 1);
    assert_eq!(outcome.summary.connection_errors, 0);

    assert!(h.ledger.record("hConnErr").unwrap().is_none());
    assert_eq!(h.ledger.data_ids().unwrap(), vec!["hBad", "hBig"]);
}

#[tokio::test]
async fn test_unresolved_entry_resolves_on_later_pass() {
    let store = ScriptedStore::new();
    store.script("hConnErr", vec![connection_error()]);
    let h = harness(store);

    let resolved = h
        .reconciler
        .reconcile(vec![entry("hConnErr", 3)], 5, 1)
        .await
        .unwrap();
    assert!(resolved.is_empty());
    assert_eq!(h.ledger.record("hConnErr").unwrap().unwrap().iteration, 1);

    // Not due yet
    assert!(h.ledger.data_ids_to_retry().unwrap().is_empty());

    h.clock.advance(2 * 60 * 1000);
    let due = h.ledger.data_ids_to_retry().unwrap();
    assert_eq!(due.len(), 1);

    h.store.serve("hConnErr", "ok");
    let resolved = h.reconciler.reconcile(due, 5, 1).await.unwrap();

    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].verified_at, 2 * 60 * 1000);
    assert!(h.ledger.data_ids().unwrap().is_empty());
}

#[tokio::test]
async fn test_repeated_pass_failure_bumps_iteration() {
    let store = ScriptedStore::new();
    store.script("hConnErr", vec![connection_error()]);
    let h = harness(store);

    h.reconciler.reconcile(vec![entry("hConnErr", 3)], 1, 0).await.unwrap();
    h.clock.advance(10);
    h.reconciler.reconcile(vec![entry("hConnErr", 3)], 1, 0).await.unwrap();

    let record = h.ledger.record("hConnErr").unwrap().unwrap();
    assert_eq!(record.iteration, 2);
    assert_eq!(record.last_try_timestamp, 10);
}

#[tokio::test]
async fn test_resolution_is_idempotent() {
    let store = ScriptedStore::new();
    store.serve("hOk", "ok");
    let h = harness(store);

    for _ in 0..2 {
        let resolved = h.reconciler.reconcile(vec![entry("hOk", 3)], 5, 1).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert!(h.ledger.data_ids().unwrap().is_empty());
    }
    assert_eq!(h.reconciler.stats().resolved, 2);
    assert_eq!(h.reconciler.stats().passes, 2);
}

#[tokio::test]
async fn test_size_policy() {
    let store = ScriptedStore::new();
    store.serve("exact", "abc");
    store.serve("smaller", "a");
    store.serve("larger", "abcd");
    let h = harness(store);

    let resolved = h
        .reconciler
        .reconcile(
            vec![entry("exact", 3), entry("smaller", 3), entry("larger", 3)],
            5,
            0,
        )
        .await
        .unwrap();

    let ids: Vec<_> = resolved.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["exact", "smaller"]);
    let larger = h.ledger.record("larger").unwrap().unwrap();
    assert_eq!(larger.entry.error.unwrap().kind, ErrorKind::SizeMismatch);
    assert_eq!(h.reconciler.stats().size_mismatch, 1);
}

#[tokio::test]
async fn test_concurrency_bound() {
    let store = ScriptedStore::with_delay(Duration::from_millis(20));
    let entries: Vec<_> = (0..12)
        .map(|i| {
            let id = format!("h{}", i);
            store.serve(&id, "ok");
            entry(&id, 3)
        })
        .collect();
    let h = harness(store);

    let resolved = h.reconciler.reconcile(entries, 3, 0).await.unwrap();

    assert_eq!(resolved.len(), 12);
    // the cap is reached and never exceeded
    assert_eq!(h.store.peak_in_flight(), 3);
}

#[tokio::test]
async fn test_zero_concurrency_still_fetches() {
    let store = ScriptedStore::new();
    store.serve("hOk", "ok");
    let h = harness(store);

    let resolved = h.reconciler.reconcile(vec![entry("hOk", 3)], 0, 0).await.unwrap();
    assert_eq!(resolved.len(), 1);
    assert_eq!(h.store.peak_in_flight(), 1);
}

#[tokio::test]
async fn test_malformed_entry_aborts_without_side_effects() {
    let h = harness(mixed_store());
    let mut batch = mixed_batch();
    batch.push(LedgerEntry {
        hash: "hNoSize".to_string(),
        declared_size: None,
        provenance: Some(provenance(1)),
        error: None,
    });

    let err = h.reconciler.reconcile(batch, 5, 1).await.unwrap_err();

    assert!(matches!(
        err,
        ReconcileError::MalformedEntry { field: "declaredSize", .. }
    ));
    assert_eq!(h.store.calls("hOk"), 0);
    assert!(h.ledger.data_ids().unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_ids_emit_one_result() {
    let store = ScriptedStore::new();
    store.serve("hOk", "ok");
    let h = harness(store);

    let resolved = h
        .reconciler
        .reconcile(vec![entry("hOk", 3), entry("hOk", 5)], 5, 0)
        .await
        .unwrap();

    assert_eq!(resolved.len(), 1);
    assert_eq!(h.store.calls("hOk"), 2);
}

#[tokio::test]
async fn test_slow_fetch_times_out_as_connection_failure() {
    let store = ScriptedStore::with_delay(Duration::from_millis(200));
    store.serve("hSlow", "ok");
    let mut h = harness(store);
    h.reconciler = ledger_reconciler::Reconciler::new(h.store.clone(), h.ledger.clone(), h.clock.clone())
        .with_fetch_timeout(Duration::from_millis(20));

    let resolved = h.reconciler.reconcile(vec![entry("hSlow", 3)], 1, 0).await.unwrap();

    assert!(resolved.is_empty());
    let record = h.ledger.record("hSlow").unwrap().unwrap();
    assert!(record.to_retry);
    assert_eq!(record.entry.error.unwrap().kind, ErrorKind::Connection);
}
