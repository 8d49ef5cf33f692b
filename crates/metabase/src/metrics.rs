//! Prometheus metrics for metabase operations.

use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for metabase metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static OBJECT_BEGIN: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("vantage_object_begin_total", "Objects begun")
        .expect("metric creation failed")
});

pub static OBJECT_COMMIT: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("vantage_object_commit_total", "Objects committed")
        .expect("metric creation failed")
});

pub static SEGMENT_BEGIN: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("vantage_segment_begin_total", "Segments begun")
        .expect("metric creation failed")
});

pub static SEGMENT_COMMIT: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("vantage_segment_commit_total", "Segments committed")
        .expect("metric creation failed")
});

pub static SEGMENT_UPDATE: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("vantage_segment_update_total", "Segment piece sets replaced")
        .expect("metric creation failed")
});

pub static PRECOMMIT_DELETED_OBJECTS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vantage_precommit_deleted_objects_total",
        "Objects deleted by precommit constraints",
    )
    .expect("metric creation failed")
});

pub static PRECOMMIT_DELETED_SEGMENTS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vantage_precommit_deleted_segments_total",
        "Segments deleted by precommit constraints",
    )
    .expect("metric creation failed")
});

pub static ZOMBIE_DELETED_OBJECTS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vantage_zombie_deleted_objects_total",
        "Pending objects removed by zombie cleanup",
    )
    .expect("metric creation failed")
});

pub static ZOMBIE_DELETED_SEGMENTS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vantage_zombie_deleted_segments_total",
        "Segments removed by zombie cleanup",
    )
    .expect("metric creation failed")
});

pub static OBJECT_COMMIT_SEGMENTS: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "vantage_object_commit_segments",
            "Segments per committed object",
        )
        .buckets(vec![0.0, 1.0, 2.0, 4.0, 8.0, 16.0, 64.0, 256.0, 1024.0]),
    )
    .expect("metric creation failed")
});

pub static OBJECT_COMMIT_ENCRYPTED_SIZE: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "vantage_object_commit_encrypted_size_bytes",
            "Total encrypted size of committed objects",
        )
        .buckets(prometheus::exponential_buckets(1024.0, 4.0, 12).expect("bucket layout")),
    )
    .expect("metric creation failed")
});

pub static SEGMENT_COMMIT_ENCRYPTED_SIZE: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "vantage_segment_commit_encrypted_size_bytes",
            "Encrypted size of committed segments",
        )
        .buckets(prometheus::exponential_buckets(1024.0, 4.0, 10).expect("bucket layout")),
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metabase metrics with the registry. Idempotent.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(OBJECT_BEGIN.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(OBJECT_COMMIT.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SEGMENT_BEGIN.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SEGMENT_COMMIT.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SEGMENT_UPDATE.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(PRECOMMIT_DELETED_OBJECTS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(PRECOMMIT_DELETED_SEGMENTS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(ZOMBIE_DELETED_OBJECTS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(ZOMBIE_DELETED_SEGMENTS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(OBJECT_COMMIT_SEGMENTS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(OBJECT_COMMIT_ENCRYPTED_SIZE.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SEGMENT_COMMIT_ENCRYPTED_SIZE.clone()))
            .expect("metric registration failed");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_idempotent() {
        register_metrics();
        register_metrics();
    }
}
