use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Counters and gauges describing cache activity.
#[derive(Default)]
pub(crate) struct Metrics {
    /// Lookups satisfied by a slot that already held the block.
    pub hits: Counter,
    /// Lookups that installed the block in a victim slot.
    pub misses: Counter,
    /// Misses whose victim was still holding another block.
    pub evictions: Counter,
    /// Lookups that found no free slot.
    pub exhausted: Counter,
    /// Blocks loaded from the disk.
    pub reads: Counter,
    /// Blocks written through to the disk.
    pub writes: Counter,
    /// Slots on the free list.
    pub free: Gauge,
    /// Slots present in the hash index.
    pub active: Gauge,
}

impl Metrics {
    /// Initialize the `Metrics` struct and register the metrics in the provided registry.
    pub(crate) fn new(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "hits",
            "Number of lookups served by a cached block",
            metrics.hits.clone(),
        );
        registry.register(
            "misses",
            "Number of lookups that required a victim slot",
            metrics.misses.clone(),
        );
        registry.register(
            "evictions",
            "Number of cached blocks displaced by a miss",
            metrics.evictions.clone(),
        );
        registry.register(
            "exhausted",
            "Number of lookups that found no free slot",
            metrics.exhausted.clone(),
        );
        registry.register(
            "reads",
            "Number of blocks loaded from disk",
            metrics.reads.clone(),
        );
        registry.register(
            "writes",
            "Number of blocks written through to disk",
            metrics.writes.clone(),
        );
        registry.register("free", "Number of free slots", metrics.free.clone());
        registry.register(
            "active",
            "Number of slots referenced by at least one holder",
            metrics.active.clone(),
        );
        metrics
    }
}
