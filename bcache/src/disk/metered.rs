use super::Error;
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use std::sync::Arc;

struct Metrics {
    reads: Counter,
    read_bytes: Counter,
    writes: Counter,
    write_bytes: Counter,
}

impl Metrics {
    /// Initialize the `Metrics` struct and register the metrics in the provided registry.
    fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            reads: Counter::default(),
            read_bytes: Counter::default(),
            writes: Counter::default(),
            write_bytes: Counter::default(),
        };

        registry.register("reads", "Total number of block reads", metrics.reads.clone());
        registry.register(
            "read_bytes",
            "Total amount of data read from disk",
            metrics.read_bytes.clone(),
        );
        registry.register(
            "writes",
            "Total number of block writes",
            metrics.writes.clone(),
        );
        registry.register(
            "write_bytes",
            "Total amount of data written to disk",
            metrics.write_bytes.clone(),
        );

        metrics
    }
}

/// A wrapper around a [super::Disk] implementation that tracks metrics.
///
/// Only successful transfers are counted.
#[derive(Clone)]
pub struct Disk<D> {
    inner: D,
    metrics: Arc<Metrics>,
}

impl<D> Disk<D> {
    pub fn new(inner: D, registry: &mut Registry) -> Self {
        Self {
            inner,
            metrics: Metrics::new(registry).into(),
        }
    }

    /// The wrapped disk.
    pub fn inner(&self) -> &D {
        &self.inner
    }

    /// The number of successful block reads.
    pub fn reads(&self) -> u64 {
        self.metrics.reads.get()
    }

    /// The number of successful block writes.
    pub fn writes(&self) -> u64 {
        self.metrics.writes.get()
    }
}

impl<D: super::Disk> super::Disk for Disk<D> {
    fn block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn read_block(&self, dev: u32, block: u64, buf: &mut [u8]) -> Result<(), Error> {
        self.inner.read_block(dev, block, buf)?;
        self.metrics.reads.inc();
        self.metrics.read_bytes.inc_by(buf.len() as u64);
        Ok(())
    }

    fn write_block(&self, dev: u32, block: u64, buf: &[u8]) -> Result<(), Error> {
        self.inner.write_block(dev, block, buf)?;
        self.metrics.writes.inc();
        self.metrics.write_bytes.inc_by(buf.len() as u64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        disk::{memory, tests::run_disk_tests, Disk as _},
        Key,
    };
    use prometheus_client::encoding::text::encode;
    use std::num::NonZeroUsize;

    #[test]
    fn test_metered_disk() {
        let mut registry = Registry::default();
        let inner = memory::Disk::new(NonZeroUsize::new(64).unwrap());
        run_disk_tests(Disk::new(inner, &mut registry));
    }

    #[test]
    fn test_metered_disk_counts_successful_transfers() {
        let mut registry = Registry::default();
        let inner = memory::Disk::new(NonZeroUsize::new(32).unwrap());
        let disk = Disk::new(inner, &mut registry);

        let mut buf = [0; 32];
        disk.write_block(0, 1, &buf).unwrap();
        disk.read_block(0, 1, &mut buf).unwrap();
        disk.read_block(0, 2, &mut buf).unwrap();

        // Failed transfers are not counted
        disk.inner().fail(Key::new(0, 3));
        assert!(disk.read_block(0, 3, &mut buf).is_err());
        assert!(disk.write_block(0, 3, &buf).is_err());

        assert_eq!(disk.reads(), 2);
        assert_eq!(disk.writes(), 1);

        let mut buffer = String::new();
        encode(&mut buffer, &registry).unwrap();
        assert!(buffer.contains("reads_total 2"));
        assert!(buffer.contains("read_bytes_total 64"));
        assert!(buffer.contains("writes_total 1"));
        assert!(buffer.contains("write_bytes_total 32"));
    }
}
