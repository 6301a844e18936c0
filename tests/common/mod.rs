//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use ledger_reconciler::{
    BackoffPolicy, ContentStore, FetchError, FetchedContent, LedgerEntry, ManualClock,
    MemoryStore, Provenance, Reconciler, RetryLedger,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Response = Result<FetchedContent, FetchError>;

/// Content store answering from per-id scripts.
///
/// Each id has a queue of responses; the last one repeats forever. Tracks
/// call counts and the peak number of concurrent fetches.
#[derive(Default)]
pub struct ScriptedStore {
    scripts: Mutex<HashMap<String, VecDeque<Response>>>,
    calls: Mutex<HashMap<String, usize>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn script(&self, id: &str, responses: Vec<Response>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(id.to_string(), responses.into());
    }

    pub fn serve(&self, id: &str, content: &str) {
        self.script(id, vec![Ok(FetchedContent::new(content.to_string()))]);
    }

    pub fn calls(&self, id: &str) -> usize {
        self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn next_response(&self, id: &str) -> Response {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(id) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap(),
            None => Err(FetchError::InvalidContent(format!("no link named {}", id))),
        }
    }
}

#[async_trait]
impl ContentStore for ScriptedStore {
    async fn fetch(&self, id: &str, _max_bytes: u64) -> Result<FetchedContent, FetchError> {
        *self.calls.lock().unwrap().entry(id.to_string()).or_default() += 1;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let response = self.next_response(id);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        response
    }
}

pub fn connection_error() -> Response {
    Err(FetchError::Connection("Ipfs read request timeout".to_string()))
}

pub fn provenance(block_number: u64) -> Provenance {
    Provenance {
        network_name: "private".to_string(),
        block_number,
        block_timestamp: 1_700_000_000 + block_number,
        ..Default::default()
    }
}

pub fn entry(hash: &str, declared_size: u64) -> LedgerEntry {
    LedgerEntry::new(hash, declared_size, provenance(10))
}

pub struct Harness {
    pub store: Arc<ScriptedStore>,
    pub clock: Arc<ManualClock>,
    pub ledger: Arc<RetryLedger>,
    pub reconciler: Reconciler,
}

pub fn harness(store: ScriptedStore) -> Harness {
    let store = Arc::new(store);
    let clock = Arc::new(ManualClock::new(0));
    let ledger = Arc::new(RetryLedger::new(
        Arc::new(MemoryStore::new()),
        clock.clone(),
        BackoffPolicy::default(),
    ));
    let reconciler = Reconciler::new(store.clone(), ledger.clone(), clock.clone());
    Harness {
        store,
        clock,
        ledger,
        reconciler,
    }
}

/// The four-entry batch: connection failure, unreadable, oversize, valid
pub fn mixed_store() -> ScriptedStore {
    let store = ScriptedStore::new();
    store.script("hConnErr", vec![connection_error()]);
    store.script(
        "hBad",
        vec![Err(FetchError::InvalidContent("invalid path".to_string()))],
    );
    store.serve("hBig", "hello");
    store.serve("hOk", "ok");
    store
}

pub fn mixed_batch() -> Vec<LedgerEntry> {
    vec![
        entry("hConnErr", 3),
        entry("hBad", 3),
        entry("hBig", 3),
        entry("hOk", 3),
    ]
}
