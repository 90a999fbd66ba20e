//! Integration tests for the pool router.
//!
//! These drive the public API end to end: routing, static growth, id
//! ordering and tier-checked deallocation.

use shmalloc::defaults::KIB;
use shmalloc::{BatchGeometry, Error, ManagerConfig, PoolRouter, SegmentTag};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

fn unique_name(prefix: &str) -> String {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    format!(
        "it-{}-{}-{}",
        prefix,
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    )
}

fn stepped_router(prefix: &str) -> PoolRouter {
    let geometry = BatchGeometry::stepped(4 * KIB, 128 * KIB, 8 * KIB, 64).unwrap();
    let config = ManagerConfig::new(unique_name(prefix))
        .with_thresholds(KIB, 2 * 1024 * KIB)
        .with_geometry(geometry);
    PoolRouter::new(config).unwrap()
}

// ============================================================================
// Static tier
// ============================================================================

/// 16K lands in a perfect-fit bin and frees cleanly.
#[test]
fn test_static_perfect_fit_roundtrip() {
    let router = stepped_router("perfect");
    let before = router.static_chunk_left();

    let seg = router.allocate(16 * KIB).unwrap();
    assert_eq!(seg.tag(), SegmentTag::Static);
    assert_eq!(seg.size(), 16 * KIB);
    assert_eq!(seg.static_location(), Some((0, 0)));
    assert_eq!(seg.offset() % (4 * KIB), 0);
    assert_eq!(router.issued_ids(), 1);

    router.deallocate(seg.id()).unwrap();
    assert_eq!(router.static_chunk_left(), before);
    assert_eq!(router.segment_count(), 0);
}

/// More than eight times the largest chunk is never served statically.
#[test]
fn test_static_oversized_rejected() {
    let router = stepped_router("oversized");
    let limit = 8 * router.config().geometry.max_chunk_size();
    assert!(matches!(
        router.static_alloc(limit + 1),
        Err(Error::OversizedRequest { .. })
    ));
    // Rejected before any bin is tried, so no batch grew.
    assert_eq!(router.batch_count(), 1);
    assert_eq!(router.issued_ids(), 0);
}

/// A request that fits no bin still consumes ids.
#[test]
fn test_failed_attempts_consume_ids() {
    let config = ManagerConfig::new(unique_name("consume"))
        .with_thresholds(KIB, 1024 * KIB)
        .with_geometry(BatchGeometry::uniform(vec![4 * KIB], 2));
    let router = PoolRouter::new(config).unwrap();

    assert!(router.static_alloc(3 * 4 * KIB).unwrap_err().is_no_memory());
    let spent = router.issued_ids();
    assert!(spent >= 2);

    let seg = router.static_alloc(4 * KIB).unwrap();
    assert_eq!(seg.id(), spent);
}

/// Exhausting the tier grows it by exactly one batch, even under contention.
#[test]
fn test_concurrent_growth() {
    let config = ManagerConfig::new(unique_name("growth"))
        .with_thresholds(KIB, 1024 * KIB)
        .with_geometry(BatchGeometry::uniform(vec![4 * KIB], 8));
    let router = Arc::new(PoolRouter::new(config).unwrap());

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let router = Arc::clone(&router);
            thread::spawn(move || {
                (0..4)
                    .map(|_| router.static_alloc(4 * KIB).unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut segments = Vec::new();
    for h in handles {
        segments.extend(h.join().unwrap());
    }

    assert_eq!(segments.len(), 16);
    assert_eq!(router.batch_count(), 2);
    assert_eq!(router.static_chunk_left(), 0);

    let mut ids: Vec<_> = segments.iter().map(|s| s.id()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 16);

    for seg in &segments {
        router.deallocate(seg.id()).unwrap();
    }
    assert_eq!(router.static_chunk_left(), 16);
}

// ============================================================================
// Routing and bookkeeping
// ============================================================================

/// Ids grow across tiers and the table tracks exactly the live segments.
#[test]
fn test_ids_strictly_increasing_across_tiers() {
    let router = stepped_router("ids");
    let sizes = [100, 20 * KIB, 3 * 1024 * KIB, 512, 64 * KIB];

    let mut last = None;
    let mut live = Vec::new();
    for &size in sizes.iter().cycle().take(25) {
        let seg = router.allocate(size).unwrap();
        if let Some(prev) = last {
            assert!(seg.id() > prev);
        }
        last = Some(seg.id());
        live.push(seg);
    }
    assert_eq!(router.segment_count(), 25);

    for seg in live.drain(..) {
        assert_eq!(router.get(seg.id()).unwrap(), seg);
        router.deallocate(seg.id()).unwrap();
    }
    assert_eq!(router.segment_count(), 0);
    assert_eq!(router.cache().segment_count(), 0);
    assert_eq!(router.ephemeral().segment_count(), 0);
}

/// Tier-specific frees refuse other tiers and leave the entry intact.
#[test]
fn test_dealloc_wrong_tier_keeps_entry() {
    let router = stepped_router("wrong-tier");
    let cache = router.cache_store(b"small").unwrap();
    let eph = router.instant_alloc(4 * KIB).unwrap();

    assert!(matches!(
        router.static_dealloc(cache.id()),
        Err(Error::TypeMismatch {
            expected: SegmentTag::Static,
            actual: SegmentTag::Cache,
            ..
        })
    ));
    assert!(matches!(
        router.cache_dealloc(eph.id()),
        Err(Error::TypeMismatch { .. })
    ));
    assert_eq!(router.segment_count(), 2);

    router.cache_dealloc(cache.id()).unwrap();
    router.instant_dealloc(eph.id()).unwrap();
    assert!(matches!(
        router.get(eph.id()),
        Err(Error::SegmentNotFound(_))
    ));
}

/// An 800-byte buffer survives a local cache round trip.
#[test]
fn test_cache_local_roundtrip() {
    let router = stepped_router("cache-local");
    let data: Vec<u8> = (0..800u32).map(|i| (i % 251) as u8).collect();

    let seg = router.cache_store(&data).unwrap();
    assert_eq!(seg.size(), 800);
    assert_eq!(router.cache_retrieve(seg.id()).unwrap(), data);

    router.deallocate(seg.id()).unwrap();
    assert_eq!(router.cache().segment_count(), 0);
    assert!(matches!(
        router.cache_store(&[]),
        Err(Error::NullptrBuffer)
    ));
}

/// Invalid configurations fail construction.
#[test]
fn test_invalid_config_rejected() {
    let bad_thresholds = ManagerConfig::new(unique_name("bad")).with_thresholds(KIB, KIB);
    assert!(matches!(
        PoolRouter::new(bad_thresholds),
        Err(Error::InvalidConfig(_))
    ));

    assert!(BatchGeometry::new(vec![4 * KIB, 8 * KIB], vec![1]).is_err());

    let misaligned = ManagerConfig::new(unique_name("misaligned"))
        .with_geometry(BatchGeometry::uniform(vec![4 * KIB + 3], 4));
    assert!(matches!(
        PoolRouter::new(misaligned),
        Err(Error::InvalidConfig(_))
    ));
}
