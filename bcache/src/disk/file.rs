use super::{check_len, Error};
use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    num::NonZeroUsize,
    os::unix::fs::FileExt,
    path::PathBuf,
    sync::{Arc, Mutex},
};
use tracing::debug;

/// Configuration for a file-backed [Disk].
#[derive(Clone, Debug)]
pub struct Config {
    /// The directory holding one image file per device (`dev-<n>.img`).
    pub directory: PathBuf,

    /// The size of every block in bytes.
    pub block_size: NonZeroUsize,

    /// The number of blocks on each device.
    pub blocks: u64,

    /// Whether to flush file data to stable storage after every write.
    pub sync: bool,
}

impl Config {
    pub fn new(directory: PathBuf, block_size: NonZeroUsize, blocks: u64) -> Self {
        Self {
            directory,
            block_size,
            blocks,
            sync: false,
        }
    }
}

/// Block storage backed by image files.
///
/// Image files are created on first use and grow as blocks are written. Reading a block past the
/// current end of its image yields zeros.
#[derive(Clone)]
pub struct Disk {
    cfg: Config,
    files: Arc<Mutex<HashMap<u32, Arc<File>>>>,
}

impl Disk {
    /// Create the image directory (if missing) and return a [Disk] serving it.
    pub fn open(cfg: Config) -> Result<Self, Error> {
        fs::create_dir_all(&cfg.directory)?;
        Ok(Self {
            cfg,
            files: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// The path of the image backing `dev`.
    pub fn image(&self, dev: u32) -> PathBuf {
        self.cfg.directory.join(format!("dev-{dev}.img"))
    }

    fn file(&self, dev: u32) -> Result<Arc<File>, Error> {
        let mut files = self.files.lock().unwrap();
        if let Some(file) = files.get(&dev) {
            return Ok(file.clone());
        }
        let path = self.image(dev);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        debug!(dev, path = %path.display(), "opened device image");
        let file = Arc::new(file);
        files.insert(dev, file.clone());
        Ok(file)
    }

    fn offset(&self, dev: u32, block: u64) -> Result<u64, Error> {
        if block >= self.cfg.blocks {
            return Err(Error::OutOfRange(dev, block));
        }
        block
            .checked_mul(self.cfg.block_size.get() as u64)
            .ok_or(Error::OutOfRange(dev, block))
    }
}

impl super::Disk for Disk {
    fn block_size(&self) -> usize {
        self.cfg.block_size.get()
    }

    fn read_block(&self, dev: u32, block: u64, buf: &mut [u8]) -> Result<(), Error> {
        check_len(self.block_size(), buf.len())?;
        let offset = self.offset(dev, block)?;
        let file = self.file(dev)?;

        // Fill as much as the image holds, then zero the remainder
        let mut filled = 0;
        while filled < buf.len() {
            let read = file.read_at(&mut buf[filled..], offset + filled as u64)?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        buf[filled..].fill(0);
        Ok(())
    }

    fn write_block(&self, dev: u32, block: u64, buf: &[u8]) -> Result<(), Error> {
        check_len(self.block_size(), buf.len())?;
        let offset = self.offset(dev, block)?;
        let file = self.file(dev)?;
        file.write_all_at(buf, offset)?;
        if self.cfg.sync {
            file.sync_data()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{tests::run_disk_tests, Disk as _};
    use rand::Rng;
    use std::env;

    fn config(name: &str) -> Config {
        let directory = env::temp_dir().join(format!(
            "bcache_{}_{}",
            name,
            rand::thread_rng().gen::<u64>()
        ));
        Config::new(directory, NonZeroUsize::new(64).unwrap(), 64)
    }

    #[test]
    fn test_file_disk() {
        let cfg = config("file_disk");
        let directory = cfg.directory.clone();
        run_disk_tests(Disk::open(cfg).unwrap());
        fs::remove_dir_all(directory).unwrap();
    }

    #[test]
    fn test_file_disk_persists_across_open() {
        let mut cfg = config("file_disk_persist");
        cfg.sync = true;
        let disk = Disk::open(cfg.clone()).unwrap();
        disk.write_block(2, 10, &[7; 64]).unwrap();
        drop(disk);

        // A fresh instance sees the block at the expected offset
        let disk = Disk::open(cfg.clone()).unwrap();
        let mut buf = [0; 64];
        disk.read_block(2, 10, &mut buf).unwrap();
        assert_eq!(buf, [7; 64]);
        let image = fs::read(disk.image(2)).unwrap();
        assert_eq!(image.len(), 11 * 64);
        assert_eq!(&image[10 * 64..], &[7; 64]);

        fs::remove_dir_all(cfg.directory).unwrap();
    }

    #[test]
    fn test_file_disk_out_of_range() {
        let cfg = config("file_disk_range");
        let disk = Disk::open(cfg.clone()).unwrap();
        let mut buf = [0; 64];
        assert!(matches!(
            disk.read_block(0, 64, &mut buf),
            Err(Error::OutOfRange(0, 64))
        ));
        assert!(matches!(
            disk.write_block(0, u64::MAX, &buf),
            Err(Error::OutOfRange(0, u64::MAX))
        ));
        fs::remove_dir_all(cfg.directory).unwrap();
    }
}
