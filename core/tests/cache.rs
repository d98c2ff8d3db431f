//! Three-tier cache: tiers, promotion, durability, corruption,
//! invalidation and single-flight.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;
use workforce_core::{
    cache::{CacheManager, CacheTier},
    config::{CacheConfig, SimConfig},
    orchestrator::{PipelineOrchestrator, RunOptions},
};

fn keys(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn small(tier1: usize, tier2: usize) -> CacheConfig {
    CacheConfig { tier1_capacity: tier1, tier2_capacity: tier2, ..CacheConfig::default() }
}

fn durable(dir: &std::path::Path) -> CacheConfig {
    CacheConfig { durable_dir: Some(dir.to_path_buf()), ..CacheConfig::default() }
}

#[test]
fn put_then_get_hits_tier1() {
    let cache = CacheManager::in_memory();
    cache.put("fp-a", b"payload".to_vec(), &keys(&["year:2025"]));
    assert_eq!(cache.get("fp-a").as_deref().map(|v| v.as_slice()), Some(&b"payload"[..]));
    assert_eq!(cache.tier_of("fp-a"), Some(CacheTier::Hot));
    assert!(cache.get("fp-missing").is_none());

    let stats = cache.stats();
    assert_eq!(stats.tier1_hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.puts, 1);
    assert!((stats.tier1_hit_rate() - 0.5).abs() < 1e-9);
}

#[test]
fn full_tier1_demotes_and_repeated_access_promotes() {
    let cache = CacheManager::new(&small(1, 8)).unwrap();
    cache.put("fp-a", vec![1], &[]);
    cache.put("fp-b", vec![2], &[]);
    assert_eq!(cache.tier_of("fp-a"), Some(CacheTier::Warm));
    assert_eq!(cache.tier_of("fp-b"), Some(CacheTier::Hot));

    // access_count reaches the threshold (2) on this hit.
    assert!(cache.get("fp-a").is_some());
    assert_eq!(cache.tier_of("fp-a"), Some(CacheTier::Hot));
    assert_eq!(cache.tier_of("fp-b"), Some(CacheTier::Warm));

    let stats = cache.stats();
    assert_eq!(stats.tier2_hits, 1);
    assert_eq!(stats.promotions, 1);
    assert_eq!(stats.demotions, 2);
}

#[test]
fn full_tier2_evicts_least_recently_used_without_durable_tier() {
    let cache = CacheManager::new(&small(1, 1)).unwrap();
    cache.put("fp-a", vec![1], &[]);
    cache.put("fp-b", vec![2], &[]);
    cache.put("fp-c", vec![3], &[]);
    assert!(cache.tier_of("fp-a").is_none());
    assert_eq!(cache.stats().evictions, 1);
}

#[test]
fn durable_tier_survives_a_new_manager() {
    let dir = tempfile::tempdir().unwrap();
    {
        let cache = CacheManager::new(&durable(dir.path())).unwrap();
        cache.put("fp-d", b"durable bytes".to_vec(), &keys(&["year:2026"]));
        assert!(cache.durable_path("fp-d").unwrap().exists());
    }
    let cache = CacheManager::new(&durable(dir.path())).unwrap();
    assert_eq!(cache.tier_len(CacheTier::Durable), 1);
    assert_eq!(cache.tier_of("fp-d"), Some(CacheTier::Durable));

    let payload = cache.get("fp-d").expect("tier 3 hit");
    assert_eq!(payload.as_slice(), b"durable bytes");
    assert_eq!(cache.stats().tier3_hits, 1);
    assert_eq!(cache.tier_of("fp-d"), Some(CacheTier::Warm));
}

#[test]
fn prewarm_loads_matching_durable_entries() {
    let dir = tempfile::tempdir().unwrap();
    {
        let cache = CacheManager::new(&durable(dir.path())).unwrap();
        cache.put("fp-1", vec![1], &keys(&["year:2026"]));
        cache.put("fp-2", vec![2], &keys(&["year:2027"]));
    }
    let cache = CacheManager::new(&durable(dir.path())).unwrap();
    assert_eq!(cache.prewarm("year:2026"), 1);
    assert_eq!(cache.tier_of("fp-1"), Some(CacheTier::Warm));
    assert_eq!(cache.tier_of("fp-2"), Some(CacheTier::Durable));
}

#[test]
fn corrupt_durable_entry_is_discarded_and_missed() {
    let dir = tempfile::tempdir().unwrap();
    {
        let cache = CacheManager::new(&durable(dir.path())).unwrap();
        cache.put("fp-x", b"good".to_vec(), &[]);
    }
    let cache = CacheManager::new(&durable(dir.path())).unwrap();
    let path = cache.durable_path("fp-x").unwrap();
    std::fs::write(&path, b"not zstd at all").unwrap();

    assert!(cache.get("fp-x").is_none());
    let stats = cache.stats();
    assert_eq!(stats.corruptions, 1);
    assert_eq!(stats.misses, 1);
    assert!(!path.exists(), "corrupt file must be removed");

    // The next computation repopulates it.
    let (bytes, hit) = cache.get_or_compute("fp-x", &[], || Ok(b"good".to_vec())).unwrap();
    assert!(!hit);
    assert_eq!(bytes.as_slice(), b"good");
}

#[test]
fn corrupt_file_found_at_open_is_removed() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("deadbeef.zst"), b"garbage").unwrap();
    let cache = CacheManager::new(&durable(dir.path())).unwrap();
    assert_eq!(cache.stats().corruptions, 1);
    assert_eq!(cache.tier_len(CacheTier::Durable), 0);
}

#[test]
fn undecodable_json_payload_counts_as_corruption() {
    let cache = CacheManager::in_memory();
    cache.put("fp-j", b"{ not json".to_vec(), &[]);
    assert!(cache.get_json::<Vec<u32>>("fp-j").is_none());
    assert_eq!(cache.stats().corruptions, 1);
    assert!(cache.tier_of("fp-j").is_none());
}

#[test]
fn invalidate_removes_dependents_from_every_tier() {
    let dir = tempfile::tempdir().unwrap();
    let cache = CacheManager::new(&durable(dir.path())).unwrap();
    cache.put("fp-1", vec![1], &keys(&["scenario:baseline", "year:2026"]));
    cache.put("fp-2", vec![2], &keys(&["scenario:baseline", "year:2027"]));

    assert_eq!(cache.invalidate("year:2026"), 2, "tier 1 copy and durable copy");
    assert!(cache.get("fp-1").is_none());
    assert!(cache.durable_path("fp-1").map_or(true, |p| !p.exists()));
    assert!(cache.get("fp-2").is_some());
}

#[test]
fn concurrent_computations_of_one_fingerprint_run_once() {
    let cache = Arc::new(CacheManager::in_memory());
    let computed = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let computed = Arc::clone(&computed);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                let (bytes, _) = cache
                    .get_or_compute("fp-flight", &[], || {
                        computed.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(50));
                        Ok(b"once".to_vec())
                    })
                    .unwrap();
                bytes
            })
        })
        .collect();

    for h in handles {
        assert_eq!(h.join().unwrap().as_slice(), b"once");
    }
    assert_eq!(computed.load(Ordering::SeqCst), 1);
}

#[test]
fn failed_computation_is_not_cached() {
    let cache = CacheManager::in_memory();
    let err = cache.get_or_compute("fp-err", &[], || {
        Err(workforce_core::error::SimError::Configuration("boom".into()))
    });
    assert!(err.is_err());
    assert!(cache.tier_of("fp-err").is_none());
}

#[test]
fn rerun_with_shared_cache_hits_every_year() {
    let cache = {
        let mut first = PipelineOrchestrator::build_test(SimConfig::default_test()).unwrap();
        first.run_all(&RunOptions::default()).unwrap();
        Arc::clone(first.cache())
    };
    let mut second = PipelineOrchestrator::build_test(SimConfig::default_test())
        .unwrap()
        .with_cache(cache);
    let summary = second.run_all(&RunOptions::default()).unwrap();
    assert!(summary.years.iter().all(|y| y.cache_hit), "every year should be a cache hit");
    assert!(summary.cache.tier1_hits >= 3);
}

#[test]
fn put_racing_invalidate_never_leaves_a_durable_only_entry() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(CacheManager::new(&durable(dir.path())).unwrap());
    for i in 0..300 {
        let fp = format!("fp-race-{i}");
        let barrier = Arc::new(Barrier::new(2));
        let writer = {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            let fp = fp.clone();
            std::thread::spawn(move || {
                barrier.wait();
                cache.put(&fp, vec![7; 64], &keys(&["plan_design:x"]));
            })
        };
        barrier.wait();
        cache.invalidate("plan_design:x");
        writer.join().unwrap();

        // Either the put landed after the invalidation (memory and disk) or
        // it was removed everywhere. Never on disk alone.
        assert_ne!(cache.tier_of(&fp), Some(CacheTier::Durable), "iteration {i}");
    }
}
