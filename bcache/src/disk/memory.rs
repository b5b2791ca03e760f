use super::{check_len, Error};
use crate::Key;
use std::{
    collections::{BTreeMap, HashSet},
    num::NonZeroUsize,
    sync::{Arc, Mutex, RwLock},
};

/// In-memory block storage.
///
/// Blocks that were never written read as zeros. Individual blocks can be made to fail every
/// transfer with [Disk::fail] to exercise error handling.
#[derive(Clone)]
pub struct Disk {
    block_size: usize,
    blocks: Arc<RwLock<BTreeMap<Key, Box<[u8]>>>>,
    faults: Arc<Mutex<HashSet<Key>>>,
}

impl Disk {
    /// Create an empty disk with blocks of `block_size` bytes.
    pub fn new(block_size: NonZeroUsize) -> Self {
        Self {
            block_size: block_size.get(),
            blocks: Arc::new(RwLock::new(BTreeMap::new())),
            faults: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Make every subsequent transfer of `key` fail with [Error::Injected].
    pub fn fail(&self, key: Key) {
        self.faults.lock().unwrap().insert(key);
    }

    /// Undo [Disk::fail] for `key`.
    pub fn heal(&self, key: Key) {
        self.faults.lock().unwrap().remove(&key);
    }

    /// The number of blocks that have been written at least once.
    pub fn written(&self) -> usize {
        self.blocks.read().unwrap().len()
    }

    fn check_fault(&self, key: Key) -> Result<(), Error> {
        if self.faults.lock().unwrap().contains(&key) {
            return Err(Error::Injected(key.dev, key.block));
        }
        Ok(())
    }
}

impl super::Disk for Disk {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&self, dev: u32, block: u64, buf: &mut [u8]) -> Result<(), Error> {
        check_len(self.block_size, buf.len())?;
        let key = Key::new(dev, block);
        self.check_fault(key)?;

        let blocks = self.blocks.read().unwrap();
        match blocks.get(&key) {
            Some(content) => buf.copy_from_slice(content),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_block(&self, dev: u32, block: u64, buf: &[u8]) -> Result<(), Error> {
        check_len(self.block_size, buf.len())?;
        let key = Key::new(dev, block);
        self.check_fault(key)?;

        let mut blocks = self.blocks.write().unwrap();
        blocks.insert(key, buf.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{tests::run_disk_tests, Disk as _};

    #[test]
    fn test_memory_disk() {
        run_disk_tests(Disk::new(NonZeroUsize::new(64).unwrap()));
    }

    #[test]
    fn test_memory_disk_fault_injection() {
        let disk = Disk::new(NonZeroUsize::new(16).unwrap());
        let key = Key::new(1, 7);
        disk.write_block(1, 7, &[9; 16]).unwrap();

        // Faults affect both directions, and only the chosen block
        disk.fail(key);
        let mut buf = [0; 16];
        assert!(matches!(
            disk.read_block(1, 7, &mut buf),
            Err(Error::Injected(1, 7))
        ));
        assert!(matches!(
            disk.write_block(1, 7, &[1; 16]),
            Err(Error::Injected(1, 7))
        ));
        disk.read_block(1, 8, &mut buf).unwrap();

        // The failed write left the content alone
        disk.heal(key);
        disk.read_block(1, 7, &mut buf).unwrap();
        assert_eq!(buf, [9; 16]);
        assert_eq!(disk.written(), 1);
    }

    #[test]
    fn test_memory_disk_clones_share_blocks() {
        let disk = Disk::new(NonZeroUsize::new(8).unwrap());
        let clone = disk.clone();
        clone.write_block(0, 0, &[3; 8]).unwrap();

        let mut buf = [0; 8];
        disk.read_block(0, 0, &mut buf).unwrap();
        assert_eq!(buf, [3; 8]);
    }
}
