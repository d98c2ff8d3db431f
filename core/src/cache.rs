//! Three-tier cache for accumulated-state and attribution artifacts.
//!
//! ```text
//!   get(fp)
//!     ├─ tier 1  hot, small, in-process        ── hit → return
//!     ├─ tier 2  warm, larger, in-process      ── hit → promote if access_count ≥ threshold
//!     └─ tier 3  durable, zstd-compressed file ── hit → load into tier 2 (or tier 1)
//! ```
//!
//! RULE: The cache is a non-owning, evictable view. Losing an entry only
//! costs a recompute; it never changes a result.
//! RULE: Identical fingerprint ⇒ byte-identical payload.
//! RULE: An invalidation happens-before every later `get`. A computation
//! that started before an invalidation is never inserted.
//!
//! Lock order is tier 1 → tier 2 → tier 3 → in-flight map. Disk I/O runs
//! with the memory tiers unlocked. Concurrent computations of the same
//! fingerprint are collapsed (single-flight); unrelated fingerprints never
//! wait on each other's computation.

use crate::{
    config::{sha256_hex, CacheConfig},
    error::{SimError, SimResult},
    types::Fingerprint,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

const DURABLE_EXT: &str = "zst";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    Hot,
    Warm,
    Durable,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fingerprint:     Fingerprint,
    pub tier:            CacheTier,
    pub payload:         Arc<Vec<u8>>,
    pub size:            usize,
    pub last_access:     u64,
    pub access_count:    u64,
    pub dependency_keys: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub tier1_hits:      u64,
    pub tier2_hits:      u64,
    pub tier3_hits:      u64,
    pub misses:          u64,
    pub puts:            u64,
    pub promotions:      u64,
    pub demotions:       u64,
    pub evictions:       u64,
    pub corruptions:     u64,
    pub invalidated:     u64,
    pub flight_waits:    u64,
}

impl CacheStats {
    pub fn lookups(&self) -> u64 {
        self.tier1_hits + self.tier2_hits + self.tier3_hits + self.misses
    }

    /// Fraction of lookups served from tier 1.
    pub fn tier1_hit_rate(&self) -> f64 {
        match self.lookups() {
            0 => 0.0,
            n => self.tier1_hits as f64 / n as f64,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Memory tiers ─────────────────────────────────────────────────────────

struct MemoryTier {
    tier:     CacheTier,
    capacity: usize,
    entries:  HashMap<Fingerprint, CacheEntry>,
}

impl MemoryTier {
    fn new(tier: CacheTier, capacity: usize) -> Self {
        Self { tier, capacity, entries: HashMap::new() }
    }

    fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Least-recently-used fingerprint; ties go to the smaller fingerprint.
    fn lru_victim(&self) -> Option<Fingerprint> {
        self.entries
            .values()
            .min_by(|a, b| {
                a.last_access
                    .cmp(&b.last_access)
                    .then_with(|| a.fingerprint.cmp(&b.fingerprint))
            })
            .map(|e| e.fingerprint.clone())
    }

    fn insert(&mut self, mut entry: CacheEntry) {
        entry.tier = self.tier;
        self.entries.insert(entry.fingerprint.clone(), entry);
    }

    fn remove_matching(&mut self, key: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.dependency_keys.contains(key));
        before - self.entries.len()
    }
}

// ── Durable tier ─────────────────────────────────────────────────────────

/// Header line written before the payload bytes inside each durable file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DurableHeader {
    fingerprint:     Fingerprint,
    dependency_keys: BTreeSet<String>,
    checksum:        String,
    payload_len:     usize,
}

struct DurableTier {
    dir:               PathBuf,
    compression_level: i32,
    index:             HashMap<Fingerprint, BTreeSet<String>>,
    access_counts:     HashMap<Fingerprint, u64>,
}

impl DurableTier {
    fn open(dir: &Path, compression_level: i32) -> SimResult<(Self, u64)> {
        std::fs::create_dir_all(dir)?;
        let mut tier = Self {
            dir: dir.to_path_buf(),
            compression_level,
            index: HashMap::new(),
            access_counts: HashMap::new(),
        };
        let mut corrupt = 0;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(DURABLE_EXT) {
                continue;
            }
            match read_durable(&path) {
                Ok((header, _)) => {
                    tier.index.insert(header.fingerprint, header.dependency_keys);
                }
                Err(e) => {
                    log::warn!("cache: discarding unreadable durable entry {}: {e}", path.display());
                    let _ = std::fs::remove_file(&path);
                    corrupt += 1;
                }
            }
        }
        log::debug!("cache: durable tier opened with {} entries", tier.index.len());
        Ok((tier, corrupt))
    }

    fn path_for(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{fingerprint}.{DURABLE_EXT}"))
    }

    fn write(&mut self, fingerprint: &str, payload: &[u8], keys: &BTreeSet<String>) -> SimResult<()> {
        let header = DurableHeader {
            fingerprint:     fingerprint.to_string(),
            dependency_keys: keys.clone(),
            checksum:        sha256_hex(payload),
            payload_len:     payload.len(),
        };
        let mut raw = serde_json::to_vec(&header)?;
        raw.push(b'\n');
        raw.extend_from_slice(payload);
        let compressed = zstd::encode_all(&raw[..], self.compression_level)?;

        let path = self.path_for(fingerprint);
        let tmp = path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&compressed)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        self.index.insert(fingerprint.to_string(), keys.clone());
        log::debug!(
            "cache: tier3 write {fingerprint} ({} → {} bytes)",
            raw.len(),
            compressed.len()
        );
        Ok(())
    }

    fn read(&self, fingerprint: &str) -> SimResult<(DurableHeader, Vec<u8>)> {
        let (header, payload) = read_durable(&self.path_for(fingerprint))?;
        if header.fingerprint != fingerprint {
            return Err(SimError::CacheCorruption {
                fingerprint: fingerprint.to_string(),
                reason: format!("file holds fingerprint {}", header.fingerprint),
            });
        }
        Ok((header, payload))
    }

    fn remove(&mut self, fingerprint: &str) {
        self.index.remove(fingerprint);
        self.access_counts.remove(fingerprint);
        let _ = std::fs::remove_file(self.path_for(fingerprint));
    }

    fn remove_matching(&mut self, key: &str) -> usize {
        let doomed: Vec<Fingerprint> = self
            .index
            .iter()
            .filter(|(_, keys)| keys.contains(key))
            .map(|(fp, _)| fp.clone())
            .collect();
        for fp in &doomed {
            self.remove(fp);
        }
        doomed.len()
    }
}

fn read_durable(path: &Path) -> SimResult<(DurableHeader, Vec<u8>)> {
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();
    let corrupt = |reason: String| SimError::CacheCorruption { fingerprint: name.clone(), reason };

    let compressed = std::fs::read(path)?;
    let raw = zstd::decode_all(&compressed[..]).map_err(|e| corrupt(format!("decompress: {e}")))?;
    let split = raw
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| corrupt("missing header".into()))?;
    let header: DurableHeader =
        serde_json::from_slice(&raw[..split]).map_err(|e| corrupt(format!("header: {e}")))?;
    let payload = raw[split + 1..].to_vec();
    if payload.len() != header.payload_len {
        return Err(corrupt(format!(
            "payload is {} bytes, header says {}",
            payload.len(),
            header.payload_len
        )));
    }
    if sha256_hex(&payload) != header.checksum {
        return Err(corrupt("checksum mismatch".into()));
    }
    Ok((header, payload))
}

// ── Single-flight ────────────────────────────────────────────────────────

#[derive(Default)]
struct Flight {
    done: Mutex<Option<Option<Arc<Vec<u8>>>>>,
    cv:   Condvar,
}

impl Flight {
    fn finish(&self, result: Option<Arc<Vec<u8>>>) {
        *lock(&self.done) = Some(result);
        self.cv.notify_all();
    }

    fn wait(&self) -> Option<Arc<Vec<u8>>> {
        let mut done = lock(&self.done);
        while done.is_none() {
            done = self.cv.wait(done).unwrap_or_else(|p| p.into_inner());
        }
        done.clone().flatten()
    }
}

// ── Manager ──────────────────────────────────────────────────────────────

pub struct CacheManager {
    tier1:               Mutex<MemoryTier>,
    tier2:               Mutex<MemoryTier>,
    tier3:               Option<Mutex<DurableTier>>,
    promotion_threshold: u64,
    clock:               AtomicU64,
    generation:          AtomicU64,
    inflight:            Mutex<HashMap<Fingerprint, Arc<Flight>>>,
    stats:               Mutex<CacheStats>,
}

impl CacheManager {
    pub fn new(config: &CacheConfig) -> SimResult<Self> {
        let mut stats = CacheStats::default();
        let tier3 = match &config.durable_dir {
            Some(dir) => {
                let (tier, corrupt) = DurableTier::open(dir, config.compression_level)?;
                stats.corruptions += corrupt;
                Some(Mutex::new(tier))
            }
            None => None,
        };
        Ok(Self {
            tier1: Mutex::new(MemoryTier::new(CacheTier::Hot, config.tier1_capacity.max(1))),
            tier2: Mutex::new(MemoryTier::new(CacheTier::Warm, config.tier2_capacity.max(1))),
            tier3,
            promotion_threshold: config.promotion_threshold.max(1),
            clock: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            inflight: Mutex::new(HashMap::new()),
            stats: Mutex::new(stats),
        })
    }

    /// Memory-only cache with default capacities (used in tests).
    pub fn in_memory() -> Self {
        Self {
            tier1: Mutex::new(MemoryTier::new(CacheTier::Hot, 16)),
            tier2: Mutex::new(MemoryTier::new(CacheTier::Warm, 128)),
            tier3: None,
            promotion_threshold: 2,
            clock: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            inflight: Mutex::new(HashMap::new()),
            stats: Mutex::new(CacheStats::default()),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn stats(&self) -> CacheStats {
        lock(&self.stats).clone()
    }

    /// Which tier currently serves `fingerprint`, without counting an access.
    pub fn tier_of(&self, fingerprint: &str) -> Option<CacheTier> {
        if lock(&self.tier1).entries.contains_key(fingerprint) {
            return Some(CacheTier::Hot);
        }
        if lock(&self.tier2).entries.contains_key(fingerprint) {
            return Some(CacheTier::Warm);
        }
        match &self.tier3 {
            Some(t3) if lock(t3).index.contains_key(fingerprint) => Some(CacheTier::Durable),
            _ => None,
        }
    }

    pub fn tier_len(&self, tier: CacheTier) -> usize {
        match tier {
            CacheTier::Hot => lock(&self.tier1).entries.len(),
            CacheTier::Warm => lock(&self.tier2).entries.len(),
            CacheTier::Durable => self.tier3.as_ref().map(|t| lock(t).index.len()).unwrap_or(0),
        }
    }

    /// Location of the durable file for `fingerprint`, if tier 3 is enabled.
    pub fn durable_path(&self, fingerprint: &str) -> Option<PathBuf> {
        self.tier3.as_ref().map(|t| lock(t).path_for(fingerprint))
    }

    // ── get ───────────────────────────────────────────────────

    pub fn get(&self, fingerprint: &str) -> Option<Arc<Vec<u8>>> {
        let now = self.tick();
        if let Some(payload) = self.get_memory(fingerprint, now) {
            return Some(payload);
        }
        let payload = self.get_durable(fingerprint, now);
        if payload.is_none() {
            lock(&self.stats).misses += 1;
        }
        payload
    }

    /// Memory-tier lookup that touches neither recency nor stats.
    fn peek(&self, fingerprint: &str) -> Option<Arc<Vec<u8>>> {
        let t1 = lock(&self.tier1);
        let t2 = lock(&self.tier2);
        t1.entries
            .get(fingerprint)
            .or_else(|| t2.entries.get(fingerprint))
            .map(|e| Arc::clone(&e.payload))
    }

    fn get_memory(&self, fingerprint: &str, now: u64) -> Option<Arc<Vec<u8>>> {
        let mut t1 = lock(&self.tier1);
        if let Some(entry) = t1.entries.get_mut(fingerprint) {
            entry.last_access = now;
            entry.access_count += 1;
            lock(&self.stats).tier1_hits += 1;
            return Some(Arc::clone(&entry.payload));
        }

        let mut t2 = lock(&self.tier2);
        let entry = t2.entries.get_mut(fingerprint)?;
        entry.last_access = now;
        entry.access_count += 1;
        let payload = Arc::clone(&entry.payload);
        let promote = entry.access_count >= self.promotion_threshold;
        lock(&self.stats).tier2_hits += 1;

        if promote {
            if let Some(entry) = t2.entries.remove(fingerprint) {
                log::debug!("cache: promote {fingerprint} tier2 → tier1");
                lock(&self.stats).promotions += 1;
                self.insert_hot(&mut t1, &mut t2, entry);
            }
        }
        Some(payload)
    }

    fn get_durable(&self, fingerprint: &str, now: u64) -> Option<Arc<Vec<u8>>> {
        let t3 = self.tier3.as_ref()?;
        let generation = self.generation.load(Ordering::SeqCst);
        let (header, payload, access_count) = {
            let mut durable = lock(t3);
            if !durable.index.contains_key(fingerprint) {
                return None;
            }
            match durable.read(fingerprint) {
                Ok((header, payload)) => {
                    let count = durable.access_counts.entry(fingerprint.to_string()).or_insert(0);
                    *count += 1;
                    (header, payload, *count)
                }
                Err(e) => {
                    log::warn!("cache: {e}; entry discarded, will recompute");
                    durable.remove(fingerprint);
                    lock(&self.stats).corruptions += 1;
                    return None;
                }
            }
        };
        lock(&self.stats).tier3_hits += 1;

        let payload = Arc::new(payload);
        let entry = CacheEntry {
            fingerprint:     fingerprint.to_string(),
            tier:            CacheTier::Warm,
            size:            payload.len(),
            payload:         Arc::clone(&payload),
            last_access:     now,
            access_count,
            dependency_keys: header.dependency_keys,
        };
        let mut t1 = lock(&self.tier1);
        let mut t2 = lock(&self.tier2);
        if self.generation.load(Ordering::SeqCst) == generation {
            if access_count >= self.promotion_threshold {
                log::debug!("cache: promote {fingerprint} tier3 → tier1");
                lock(&self.stats).promotions += 1;
                self.insert_hot(&mut t1, &mut t2, entry);
            } else {
                log::debug!("cache: load {fingerprint} tier3 → tier2");
                self.insert_warm(&mut t2, entry);
            }
        }
        Some(payload)
    }

    /// Insert into tier 1, demoting its LRU entry to tier 2 when full.
    fn insert_hot(&self, t1: &mut MemoryTier, t2: &mut MemoryTier, entry: CacheEntry) {
        if !t1.entries.contains_key(&entry.fingerprint) && t1.is_full() {
            if let Some(victim) = t1.lru_victim() {
                if let Some(demoted) = t1.entries.remove(&victim) {
                    log::debug!("cache: demote {victim} tier1 → tier2");
                    lock(&self.stats).demotions += 1;
                    self.insert_warm(t2, demoted);
                }
            }
        }
        t1.insert(entry);
    }

    /// Insert into tier 2, dropping its LRU entry when full. Every entry
    /// already has a durable copy when tier 3 is enabled (write-through).
    fn insert_warm(&self, t2: &mut MemoryTier, entry: CacheEntry) {
        if !t2.entries.contains_key(&entry.fingerprint) && t2.is_full() {
            if let Some(victim) = t2.lru_victim() {
                t2.entries.remove(&victim);
                let mut stats = lock(&self.stats);
                if self.tier3.is_some() {
                    log::debug!("cache: demote {victim} tier2 → tier3");
                    stats.demotions += 1;
                } else {
                    log::debug!("cache: evict {victim}");
                    stats.evictions += 1;
                }
            }
        }
        t2.insert(entry);
    }

    // ── put ───────────────────────────────────────────────────

    pub fn put(&self, fingerprint: &str, payload: Vec<u8>, dependency_keys: &[String]) {
        let generation = self.generation.load(Ordering::SeqCst);
        self.put_if_current(fingerprint, Arc::new(payload), dependency_keys, generation);
    }

    /// Insert unless an invalidation happened after `generation` was read.
    fn put_if_current(
        &self,
        fingerprint: &str,
        payload: Arc<Vec<u8>>,
        dependency_keys: &[String],
        generation: u64,
    ) -> bool {
        let keys: BTreeSet<String> = dependency_keys.iter().cloned().collect();
        let now = self.tick();
        {
            let mut t1 = lock(&self.tier1);
            let mut t2 = lock(&self.tier2);
            if self.generation.load(Ordering::SeqCst) != generation {
                log::debug!("cache: skip stale insert of {fingerprint}");
                return false;
            }
            let existing = t1
                .entries
                .get(fingerprint)
                .or_else(|| t2.entries.get(fingerprint))
                .map(|e| Arc::clone(&e.payload));
            if let Some(existing) = existing {
                if *existing != *payload {
                    log::warn!("cache: fingerprint {fingerprint} re-put with different bytes");
                }
            }
            t2.entries.remove(fingerprint);
            let entry = CacheEntry {
                fingerprint:  fingerprint.to_string(),
                tier:         CacheTier::Hot,
                size:         payload.len(),
                payload:      Arc::clone(&payload),
                last_access:  now,
                access_count: 1,
                dependency_keys: keys.clone(),
            };
            self.insert_hot(&mut t1, &mut t2, entry);
            lock(&self.stats).puts += 1;
        }

        if let Some(t3) = &self.tier3 {
            let mut durable = lock(t3);
            if self.generation.load(Ordering::SeqCst) == generation {
                if let Err(e) = durable.write(fingerprint, &payload, &keys) {
                    log::warn!("cache: durable write of {fingerprint} failed: {e}");
                }
            }
        }
        true
    }

    // ── invalidate ────────────────────────────────────────────

    /// Remove every entry whose dependency keys contain `dependency_key`,
    /// from every tier. Returns the number of entries removed.
    pub fn invalidate(&self, dependency_key: &str) -> usize {
        let mut t1 = lock(&self.tier1);
        let mut t2 = lock(&self.tier2);
        let mut removed = t1.remove_matching(dependency_key) + t2.remove_matching(dependency_key);
        // Generation moves before tier 3 is touched: a racing durable write
        // must observe it.
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(t3) = &self.tier3 {
            removed += lock(t3).remove_matching(dependency_key);
        }
        lock(&self.stats).invalidated += removed as u64;
        log::info!("cache: invalidated {removed} entries depending on {dependency_key}");
        removed
    }

    /// Drop one fingerprint everywhere. Used when a payload fails to decode.
    pub fn discard(&self, fingerprint: &str) {
        let mut t1 = lock(&self.tier1);
        let mut t2 = lock(&self.tier2);
        t1.entries.remove(fingerprint);
        t2.entries.remove(fingerprint);
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(t3) = &self.tier3 {
            lock(t3).remove(fingerprint);
        }
    }

    // ── single-flight compute ─────────────────────────────────

    /// Return the cached payload, or compute, store and return it.
    /// A second caller for an in-flight fingerprint waits for the first
    /// instead of recomputing. The flag is true when no computation ran.
    pub fn get_or_compute<F>(
        &self,
        fingerprint: &str,
        dependency_keys: &[String],
        compute: F,
    ) -> SimResult<(Arc<Vec<u8>>, bool)>
    where
        F: FnOnce() -> SimResult<Vec<u8>>,
    {
        let mut compute = Some(compute);
        loop {
            if let Some(payload) = self.get(fingerprint) {
                return Ok((payload, true));
            }

            let (flight, leader) = {
                let mut inflight = lock(&self.inflight);
                match inflight.get(fingerprint) {
                    Some(f) => (Arc::clone(f), false),
                    None => {
                        let f = Arc::new(Flight::default());
                        inflight.insert(fingerprint.to_string(), Arc::clone(&f));
                        (f, true)
                    }
                }
            };

            if !leader {
                lock(&self.stats).flight_waits += 1;
                if let Some(payload) = flight.wait() {
                    return Ok((payload, true));
                }
                // Leader failed; try again (possibly as the new leader).
                continue;
            }

            // A leader that finished between our miss and the in-flight
            // check has already stored its result.
            if let Some(payload) = self.peek(fingerprint) {
                flight.finish(Some(Arc::clone(&payload)));
                lock(&self.inflight).remove(fingerprint);
                return Ok((payload, true));
            }

            let generation = self.generation.load(Ordering::SeqCst);
            let Some(f) = compute.take() else {
                flight.finish(None);
                lock(&self.inflight).remove(fingerprint);
                return Err(SimError::Other(anyhow::anyhow!(
                    "single-flight computation for {fingerprint} ran twice"
                )));
            };
            let result = f();
            let outcome = match result {
                Ok(bytes) => {
                    let payload = Arc::new(bytes);
                    self.put_if_current(fingerprint, Arc::clone(&payload), dependency_keys, generation);
                    flight.finish(Some(Arc::clone(&payload)));
                    Ok((payload, false))
                }
                Err(e) => {
                    flight.finish(None);
                    Err(e)
                }
            };
            lock(&self.inflight).remove(fingerprint);
            return outcome;
        }
    }

    // ── typed helpers ─────────────────────────────────────────

    /// Decode a cached JSON payload. A payload that fails to decode is
    /// treated as corrupt: it is discarded and reported as a miss.
    pub fn get_json<T: DeserializeOwned>(&self, fingerprint: &str) -> Option<T> {
        let bytes = self.get(fingerprint)?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("cache: entry {fingerprint} failed to decode ({e}); discarded");
                lock(&self.stats).corruptions += 1;
                self.discard(fingerprint);
                None
            }
        }
    }

    pub fn put_json<T: Serialize>(
        &self,
        fingerprint: &str,
        value: &T,
        dependency_keys: &[String],
    ) -> SimResult<()> {
        self.put(fingerprint, serde_json::to_vec(value)?, dependency_keys);
        Ok(())
    }

    // ── pre-warming ───────────────────────────────────────────

    /// Load durable entries carrying `dependency_key` into tier 2.
    /// Returns how many entries were loaded.
    pub fn prewarm(&self, dependency_key: &str) -> usize {
        let Some(t3) = &self.tier3 else {
            return 0;
        };
        let candidates: Vec<Fingerprint> = {
            let durable = lock(t3);
            let mut fps: Vec<Fingerprint> = durable
                .index
                .iter()
                .filter(|(_, keys)| keys.contains(dependency_key))
                .map(|(fp, _)| fp.clone())
                .collect();
            fps.sort();
            fps
        };
        let mut loaded = 0;
        for fp in candidates {
            if lock(&self.tier1).entries.contains_key(&fp) || lock(&self.tier2).entries.contains_key(&fp) {
                continue;
            }
            let generation = self.generation.load(Ordering::SeqCst);
            let read = lock(t3).read(&fp);
            match read {
                Ok((header, payload)) => {
                    let payload = Arc::new(payload);
                    let entry = CacheEntry {
                        fingerprint:     fp.clone(),
                        tier:            CacheTier::Warm,
                        size:            payload.len(),
                        payload,
                        last_access:     self.tick(),
                        access_count:    0,
                        dependency_keys: header.dependency_keys,
                    };
                    let _t1 = lock(&self.tier1);
                    let mut t2 = lock(&self.tier2);
                    if self.generation.load(Ordering::SeqCst) == generation {
                        self.insert_warm(&mut t2, entry);
                        loaded += 1;
                    }
                }
                Err(e) => {
                    log::warn!("cache: {e}; entry discarded during prewarm");
                    lock(t3).remove(&fp);
                    lock(&self.stats).corruptions += 1;
                }
            }
        }
        log::debug!("cache: prewarmed {loaded} entries for {dependency_key}");
        loaded
    }
}
