//! Exchange store: recorded sequences per fingerprint, with their cursors.
//!
//! The map lock is only held to find or insert a sequence. All per-fingerprint
//! work (lookup, claim, append) runs under that sequence's own mutex, so
//! unrelated fingerprints never contend and operations on one fingerprint are
//! linearizable.

use super::fingerprint::{fingerprint, Fingerprint};
use super::mode::{ConsumptionPolicy, ExhaustionPolicy};
use super::persistence::{ExchangeLog, FileExchangeLog, MemoryExchangeLog, PersistenceError};
use super::types::{Exchange, RecordedRequest, RecordedResponse};
use crate::config::{FingerprintConfig, RecordingConfig};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of looking up a fingerprint.
#[derive(Debug, Clone)]
pub enum Lookup {
    Found(Arc<Exchange>),
    /// Every exchange was consumed and the exhaustion policy is `exhausted`
    Exhausted,
    NotFound,
}

impl Lookup {
    pub fn exchange(&self) -> Option<&Arc<Exchange>> {
        match self {
            Lookup::Found(exchange) => Some(exchange),
            Lookup::Exhausted | Lookup::NotFound => None,
        }
    }
}

#[derive(Debug, Default)]
struct Sequence {
    exchanges: Vec<Arc<Exchange>>,
    /// Index of the next exchange a FIFO replay serves
    cursor: usize,
}

impl Sequence {
    fn current(&self, consumption: ConsumptionPolicy, exhaustion: ExhaustionPolicy) -> Lookup {
        let Some(last) = self.exchanges.last() else {
            return Lookup::NotFound;
        };
        match consumption {
            ConsumptionPolicy::Latest => Lookup::Found(Arc::clone(last)),
            ConsumptionPolicy::Fifo => match self.exchanges.get(self.cursor) {
                Some(exchange) => Lookup::Found(Arc::clone(exchange)),
                None => match exhaustion {
                    ExhaustionPolicy::RepeatLast => Lookup::Found(Arc::clone(last)),
                    ExhaustionPolicy::Exhausted => Lookup::Exhausted,
                },
            },
        }
    }

    fn advance(&mut self) {
        if self.cursor < self.exchanges.len() {
            self.cursor += 1;
        }
    }
}

/// Recording store for proxied exchanges
pub struct ExchangeStore {
    sequences: RwLock<HashMap<Fingerprint, Arc<Mutex<Sequence>>>>,
    consumption: ConsumptionPolicy,
    exhaustion: ExhaustionPolicy,
    log: Arc<dyn ExchangeLog>,
    /// Appends hold this shared, snapshots exclusively, so no append can land
    /// in a log file that a snapshot is about to replace.
    snapshot_gate: RwLock<()>,
}

impl ExchangeStore {
    pub fn new(
        consumption: ConsumptionPolicy,
        exhaustion: ExhaustionPolicy,
        log: Arc<dyn ExchangeLog>,
    ) -> Self {
        Self {
            sequences: RwLock::new(HashMap::new()),
            consumption,
            exhaustion,
            log,
            snapshot_gate: RwLock::new(()),
        }
    }

    /// Store with no durable backing.
    pub fn in_memory(consumption: ConsumptionPolicy, exhaustion: ExhaustionPolicy) -> Self {
        Self::new(consumption, exhaustion, Arc::new(MemoryExchangeLog::new()))
    }

    /// Build the store described by `config` and load whatever it already holds.
    pub fn open(
        config: &RecordingConfig,
        fingerprint_config: &FingerprintConfig,
    ) -> Result<Self, PersistenceError> {
        let log: Arc<dyn ExchangeLog> = match config.path {
            Some(ref path) => Arc::new(FileExchangeLog::new(path, config.fsync)),
            None => Arc::new(MemoryExchangeLog::new()),
        };
        let store = Self::new(config.consumption, config.exhaustion, log);
        store.load(fingerprint_config)?;
        Ok(store)
    }

    /// Where recordings are persisted.
    pub fn location(&self) -> String {
        self.log.describe()
    }

    fn entry(&self, fingerprint: &Fingerprint) -> Option<Arc<Mutex<Sequence>>> {
        self.sequences.read().get(fingerprint).cloned()
    }

    fn entry_or_insert(&self, fingerprint: &Fingerprint) -> Arc<Mutex<Sequence>> {
        if let Some(entry) = self.entry(fingerprint) {
            return entry;
        }
        let mut sequences = self.sequences.write();
        Arc::clone(sequences.entry(fingerprint.clone()).or_default())
    }

    /// The exchange a replay would serve right now. Does not move the cursor.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Lookup {
        match self.entry(fingerprint) {
            Some(entry) => entry.lock().current(self.consumption, self.exhaustion),
            None => Lookup::NotFound,
        }
    }

    /// Move the FIFO cursor forward by one. No-op at the end of the sequence.
    pub fn advance_cursor(&self, fingerprint: &Fingerprint) {
        if let Some(entry) = self.entry(fingerprint) {
            entry.lock().advance();
        }
    }

    /// Lookup and advance as one step, so concurrent replays never share a slot.
    pub fn claim(&self, fingerprint: &Fingerprint) -> Lookup {
        let Some(entry) = self.entry(fingerprint) else {
            return Lookup::NotFound;
        };
        let mut sequence = entry.lock();
        let found = sequence.current(self.consumption, self.exhaustion);
        if matches!(found, Lookup::Found(_)) && self.consumption == ConsumptionPolicy::Fifo {
            sequence.advance();
        }
        found
    }

    /// Record a new exchange at the tail of its sequence.
    ///
    /// The record is written to the log before it becomes visible; if the
    /// write fails nothing is published.
    pub fn append(
        &self,
        fingerprint: Fingerprint,
        request: RecordedRequest,
        response: RecordedResponse,
    ) -> Result<Arc<Exchange>, PersistenceError> {
        self.push(fingerprint, request, response, false)
    }

    /// Like [`ExchangeStore::append`], for an exchange already served live.
    ///
    /// The FIFO cursor moves past the new exchange under the same sequence
    /// lock that publishes it, so no concurrent claim can replay it.
    pub fn append_consumed(
        &self,
        fingerprint: Fingerprint,
        request: RecordedRequest,
        response: RecordedResponse,
    ) -> Result<Arc<Exchange>, PersistenceError> {
        self.push(fingerprint, request, response, true)
    }

    fn push(
        &self,
        fingerprint: Fingerprint,
        request: RecordedRequest,
        response: RecordedResponse,
        consumed: bool,
    ) -> Result<Arc<Exchange>, PersistenceError> {
        let _gate = self.snapshot_gate.read();
        let entry = self.entry_or_insert(&fingerprint);
        let mut sequence = entry.lock();

        let exchange = Exchange {
            sequence_index: sequence.exchanges.len(),
            fingerprint,
            recorded_at: Utc::now(),
            request,
            response,
        };

        // A failed write leaves at most an empty sequence behind, which reads as NotFound.
        self.log.append(&exchange)?;

        let exchange = Arc::new(exchange);
        sequence.exchanges.push(Arc::clone(&exchange));
        if consumed {
            sequence.cursor = sequence.cursor.max(sequence.exchanges.len());
        }
        debug!(
            "Recorded exchange {}#{} ({} {})",
            exchange.fingerprint.short(),
            exchange.sequence_index,
            exchange.request.method,
            exchange.request.target
        );
        Ok(exchange)
    }

    /// Replace the in-memory state with the contents of the log.
    ///
    /// Fingerprints are re-derived from each stored request under `config`, so
    /// recordings stay reachable after the allow-list changes. Sequence indices
    /// are renumbered in log order and every cursor starts at zero.
    pub fn load(&self, config: &FingerprintConfig) -> Result<usize, PersistenceError> {
        let exchanges = self.log.load()?;
        let total = exchanges.len();

        let mut rebuilt: HashMap<Fingerprint, Sequence> = HashMap::new();
        let mut rekeyed = 0usize;
        for mut exchange in exchanges {
            let current = fingerprint(&exchange.request, config);
            if current != exchange.fingerprint {
                rekeyed += 1;
                exchange.fingerprint = current.clone();
            }
            let sequence = rebuilt.entry(current).or_default();
            exchange.sequence_index = sequence.exchanges.len();
            sequence.exchanges.push(Arc::new(exchange));
        }

        if rekeyed > 0 {
            info!(
                "Re-keyed {} of {} recorded exchanges under the current fingerprint settings",
                rekeyed, total
            );
        }

        let fingerprints = rebuilt.len();
        *self.sequences.write() = rebuilt
            .into_iter()
            .map(|(fp, sequence)| (fp, Arc::new(Mutex::new(sequence))))
            .collect();

        info!(
            "Exchange store ready: {} exchanges across {} fingerprints ({})",
            total,
            fingerprints,
            self.log.describe()
        );
        Ok(total)
    }

    /// Rewrite the log as a compacted snapshot grouped by fingerprint.
    pub fn flush(&self) -> Result<usize, PersistenceError> {
        let _gate = self.snapshot_gate.write();
        let all = self.all_exchanges();
        self.log.snapshot(&all)?;
        Ok(all.len())
    }

    /// Every exchange, ordered by fingerprint then sequence index.
    pub fn all_exchanges(&self) -> Vec<Arc<Exchange>> {
        let sequences = self.sequences.read();
        let mut fingerprints: Vec<&Fingerprint> = sequences.keys().collect();
        fingerprints.sort();
        fingerprints
            .into_iter()
            .flat_map(|fp| sequences[fp].lock().exchanges.clone())
            .collect()
    }

    /// Recorded sequence for one fingerprint (empty when unknown).
    pub fn sequence(&self, fingerprint: &Fingerprint) -> Vec<Arc<Exchange>> {
        self.entry(fingerprint)
            .map(|entry| entry.lock().exchanges.clone())
            .unwrap_or_default()
    }

    /// Current FIFO cursor for a fingerprint.
    pub fn cursor(&self, fingerprint: &Fingerprint) -> Option<usize> {
        self.entry(fingerprint).map(|entry| entry.lock().cursor)
    }

    /// Number of fingerprints with at least one exchange.
    pub fn len(&self) -> usize {
        self.sequences
            .read()
            .values()
            .filter(|entry| !entry.lock().exchanges.is_empty())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn exchange_count(&self) -> usize {
        self.sequences
            .read()
            .values()
            .map(|entry| entry.lock().exchanges.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::persistence::FileExchangeLog;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn request(target: &str) -> RecordedRequest {
        RecordedRequest::new("GET", target)
    }

    fn response(body: &str) -> RecordedResponse {
        RecordedResponse::new(200).with_body(body.to_string())
    }

    fn fp(target: &str) -> Fingerprint {
        fingerprint(&request(target), &FingerprintConfig::default())
    }

    fn body_of(lookup: &Lookup) -> Option<String> {
        lookup
            .exchange()
            .map(|e| String::from_utf8(e.response.body.to_vec()).unwrap())
    }

    fn store(consumption: ConsumptionPolicy, exhaustion: ExhaustionPolicy) -> ExchangeStore {
        ExchangeStore::in_memory(consumption, exhaustion)
    }

    /// Log that refuses writes while `failing` is set.
    #[derive(Default)]
    struct FlakyLog {
        failing: AtomicBool,
        inner: MemoryExchangeLog,
    }

    impl ExchangeLog for FlakyLog {
        fn append(&self, exchange: &Exchange) -> Result<(), PersistenceError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(PersistenceError::Io {
                    path: "flaky".into(),
                    source: std::io::Error::other("disk full"),
                });
            }
            self.inner.append(exchange)
        }

        fn load(&self) -> Result<Vec<Exchange>, PersistenceError> {
            self.inner.load()
        }

        fn snapshot(&self, exchanges: &[Arc<Exchange>]) -> Result<(), PersistenceError> {
            self.inner.snapshot(exchanges)
        }

        fn describe(&self) -> String {
            "flaky".to_string()
        }
    }

    #[test]
    fn test_lookup_unknown_is_not_found() {
        let store = store(ConsumptionPolicy::Fifo, ExhaustionPolicy::RepeatLast);
        assert!(matches!(store.lookup(&fp("/nope")), Lookup::NotFound));
        assert!(matches!(store.claim(&fp("/nope")), Lookup::NotFound));
        assert!(store.is_empty());
    }

    #[test]
    fn test_append_assigns_sequence_indices() {
        let store = store(ConsumptionPolicy::Fifo, ExhaustionPolicy::RepeatLast);
        let a = store.append(fp("/a"), request("/a"), response("1")).unwrap();
        let b = store.append(fp("/a"), request("/a"), response("2")).unwrap();
        let other = store.append(fp("/b"), request("/b"), response("x")).unwrap();

        assert_eq!(a.sequence_index, 0);
        assert_eq!(b.sequence_index, 1);
        assert_eq!(other.sequence_index, 0);
        assert_eq!(store.len(), 2);
        assert_eq!(store.exchange_count(), 3);
    }

    #[test]
    fn test_lookup_does_not_advance() {
        let store = store(ConsumptionPolicy::Fifo, ExhaustionPolicy::RepeatLast);
        store.append(fp("/a"), request("/a"), response("1")).unwrap();
        store.append(fp("/a"), request("/a"), response("2")).unwrap();

        assert_eq!(body_of(&store.lookup(&fp("/a"))).as_deref(), Some("1"));
        assert_eq!(body_of(&store.lookup(&fp("/a"))).as_deref(), Some("1"));
        assert_eq!(store.cursor(&fp("/a")), Some(0));
    }

    #[test]
    fn test_fifo_consumes_in_order_then_repeats_last() {
        let store = store(ConsumptionPolicy::Fifo, ExhaustionPolicy::RepeatLast);
        for body in ["1", "2", "3"] {
            store.append(fp("/poll"), request("/poll"), response(body)).unwrap();
        }

        let served: Vec<_> = (0..5)
            .map(|_| body_of(&store.claim(&fp("/poll"))).unwrap())
            .collect();
        assert_eq!(served, vec!["1", "2", "3", "3", "3"]);
        assert_eq!(store.cursor(&fp("/poll")), Some(3));
    }

    #[test]
    fn test_fifo_exhausted_after_n_claims() {
        let store = store(ConsumptionPolicy::Fifo, ExhaustionPolicy::Exhausted);
        store.append(fp("/a"), request("/a"), response("1")).unwrap();
        store.append(fp("/a"), request("/a"), response("2")).unwrap();

        assert!(matches!(store.claim(&fp("/a")), Lookup::Found(_)));
        assert!(matches!(store.claim(&fp("/a")), Lookup::Found(_)));
        assert!(matches!(store.claim(&fp("/a")), Lookup::Exhausted));
        assert!(matches!(store.lookup(&fp("/a")), Lookup::Exhausted));
    }

    #[test]
    fn test_advance_cursor_is_noop_at_end() {
        let store = store(ConsumptionPolicy::Fifo, ExhaustionPolicy::Exhausted);
        store.append(fp("/a"), request("/a"), response("1")).unwrap();
        store.advance_cursor(&fp("/a"));
        store.advance_cursor(&fp("/a"));
        assert_eq!(store.cursor(&fp("/a")), Some(1));

        // Appending after exhaustion makes the new exchange available.
        store.append(fp("/a"), request("/a"), response("2")).unwrap();
        assert_eq!(body_of(&store.claim(&fp("/a"))).as_deref(), Some("2"));
    }

    #[test]
    fn test_latest_policy_always_serves_newest() {
        let store = store(ConsumptionPolicy::Latest, ExhaustionPolicy::Exhausted);
        store.append(fp("/a"), request("/a"), response("old")).unwrap();
        store.append(fp("/a"), request("/a"), response("new")).unwrap();

        for _ in 0..3 {
            assert_eq!(body_of(&store.claim(&fp("/a"))).as_deref(), Some("new"));
        }
        assert_eq!(store.cursor(&fp("/a")), Some(0));
    }

    #[test]
    fn test_append_consumed_moves_cursor_past_new_exchange() {
        let store = store(ConsumptionPolicy::Fifo, ExhaustionPolicy::Exhausted);
        let first = store
            .append_consumed(fp("/a"), request("/a"), response("1"))
            .unwrap();
        assert_eq!(first.sequence_index, 0);
        assert_eq!(store.cursor(&fp("/a")), Some(1));
        assert!(matches!(store.claim(&fp("/a")), Lookup::Exhausted));

        // A plain append after it is still replayable.
        store.append(fp("/a"), request("/a"), response("2")).unwrap();
        assert_eq!(body_of(&store.claim(&fp("/a"))), Some("2".to_string()));
    }

    #[test]
    fn test_append_consumed_is_never_claimed_concurrently() {
        let store = Arc::new(store(ConsumptionPolicy::Fifo, ExhaustionPolicy::Exhausted));
        let done = Arc::new(AtomicBool::new(false));

        let claimers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    let mut served = Vec::new();
                    while !done.load(Ordering::SeqCst) {
                        if let Lookup::Found(ex) = store.claim(&fp("/live")) {
                            served.push(ex.sequence_index);
                        }
                    }
                    served
                })
            })
            .collect();

        for i in 0..200 {
            store
                .append_consumed(fp("/live"), request("/live"), response(&i.to_string()))
                .unwrap();
        }
        done.store(true, Ordering::SeqCst);

        for claimer in claimers {
            assert!(claimer.join().unwrap().is_empty());
        }
        assert_eq!(store.sequence(&fp("/live")).len(), 200);
    }

    #[test]
    fn test_failed_append_publishes_nothing() {
        let log = Arc::new(FlakyLog::default());
        let store = ExchangeStore::new(
            ConsumptionPolicy::Fifo,
            ExhaustionPolicy::RepeatLast,
            Arc::clone(&log) as Arc<dyn ExchangeLog>,
        );

        log.failing.store(true, Ordering::SeqCst);
        let result = store.append(fp("/a"), request("/a"), response("lost"));
        assert!(matches!(result, Err(PersistenceError::Io { .. })));
        assert!(store.is_empty());
        assert!(matches!(store.lookup(&fp("/a")), Lookup::NotFound));

        log.failing.store(false, Ordering::SeqCst);
        let saved = store.append(fp("/a"), request("/a"), response("kept")).unwrap();
        assert_eq!(saved.sequence_index, 0);
    }

    #[test]
    fn test_concurrent_claims_never_share_a_slot() {
        let store = Arc::new(store(ConsumptionPolicy::Fifo, ExhaustionPolicy::Exhausted));
        for i in 0..64 {
            store
                .append(fp("/a"), request("/a"), response(&i.to_string()))
                .unwrap();
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let mut served = Vec::new();
                    while let Lookup::Found(ex) = store.claim(&fp("/a")) {
                        served.push(ex.sequence_index);
                    }
                    served
                })
            })
            .collect();

        let mut all: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn test_concurrent_appends_get_distinct_indices() {
        let store = Arc::new(store(ConsumptionPolicy::Fifo, ExhaustionPolicy::RepeatLast));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store
                        .append(fp("/a"), request("/a"), response(&i.to_string()))
                        .unwrap()
                        .sequence_index
                })
            })
            .collect();

        let mut indices: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        indices.sort_unstable();
        assert_eq!(indices, (0..16).collect::<Vec<_>>());
        assert_eq!(store.sequence(&fp("/a")).len(), 16);
    }

    #[test]
    fn test_round_trip_through_file_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.jsonl");
        let cfg = FingerprintConfig::default();

        let req = RecordedRequest::new("POST", "/upload?b=2&a=1")
            .with_header("Content-Type", "application/octet-stream")
            .with_header("X-Dup", "first")
            .with_header("x-dup", vec![0xc3, 0x28])
            .with_body(vec![0u8, 1, 2, 0xff, b'\n']);
        let resp = RecordedResponse::new(201)
            .with_header("set-cookie", "a=1")
            .with_header("set-cookie", "b=2")
            .with_header("x-bin", vec![0x80])
            .with_body(vec![0xde, 0xad, 0xbe, 0xef, 0x00]);

        let writer = ExchangeStore::new(
            ConsumptionPolicy::Fifo,
            ExhaustionPolicy::RepeatLast,
            Arc::new(FileExchangeLog::new(&path, true)),
        );
        let key = fingerprint(&req, &cfg);
        let original = writer.append(key.clone(), req.clone(), resp.clone()).unwrap();

        let reader = ExchangeStore::new(
            ConsumptionPolicy::Fifo,
            ExhaustionPolicy::RepeatLast,
            Arc::new(FileExchangeLog::new(&path, true)),
        );
        assert_eq!(reader.load(&cfg).unwrap(), 1);

        let loaded = reader.lookup(&key).exchange().cloned().unwrap();
        assert_eq!(loaded.request, req);
        assert_eq!(loaded.response, resp);
        assert_eq!(loaded.request.body, original.request.body);
        assert_eq!(loaded.response.headers, original.response.headers);
        assert_eq!(loaded.recorded_at, original.recorded_at);
    }

    #[test]
    fn test_load_rekeys_under_new_fingerprint_config() {
        let log: Arc<dyn ExchangeLog> = Arc::new(MemoryExchangeLog::new());
        let req = request("/Widgets");

        let writer = ExchangeStore::new(
            ConsumptionPolicy::Fifo,
            ExhaustionPolicy::RepeatLast,
            Arc::clone(&log),
        );
        let strict = FingerprintConfig::default();
        writer
            .append(fingerprint(&req, &strict), req.clone(), response("w"))
            .unwrap();

        let relaxed = FingerprintConfig {
            case_sensitive_path: false,
            ..FingerprintConfig::default()
        };
        let reader = ExchangeStore::new(ConsumptionPolicy::Fifo, ExhaustionPolicy::RepeatLast, log);
        reader.load(&relaxed).unwrap();

        let lower = fingerprint(&request("/widgets"), &relaxed);
        assert_eq!(body_of(&reader.lookup(&lower)).as_deref(), Some("w"));
    }

    #[test]
    fn test_flush_groups_by_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.jsonl");
        let store = ExchangeStore::new(
            ConsumptionPolicy::Fifo,
            ExhaustionPolicy::RepeatLast,
            Arc::new(FileExchangeLog::new(&path, false)),
        );
        store.append(fp("/a"), request("/a"), response("a0")).unwrap();
        store.append(fp("/b"), request("/b"), response("b0")).unwrap();
        store.append(fp("/a"), request("/a"), response("a1")).unwrap();

        assert_eq!(store.flush().unwrap(), 3);

        let reloaded = FileExchangeLog::new(&path, false).load().unwrap();
        let keys: Vec<_> = reloaded
            .iter()
            .map(|e| (e.fingerprint.clone(), e.sequence_index))
            .collect();
        let mut expected = keys.clone();
        expected.sort();
        assert_eq!(keys, expected);
        assert_eq!(reloaded.len(), 3);
    }

    #[test]
    fn test_open_in_memory_when_no_path() {
        let config = RecordingConfig::default();
        let store = ExchangeStore::open(&config, &FingerprintConfig::default()).unwrap();
        assert_eq!(store.location(), "memory");
        assert!(store.is_empty());
    }
}
