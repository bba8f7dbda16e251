//! File-backed random block device.

use crate::block::{check_range, RandomBlockDevice};
use crate::error::{DeviceError, DeviceResult};
use crate::ids::DeviceId;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A random block device stored in a regular file.
///
/// The file is sized once at creation; reads and writes never change its
/// length. Blocking file calls run on tokio's blocking pool.
///
/// # Durability
///
/// Every `write` ends with `File::sync_all()`, so a successful write is on
/// disk when it returns.
///
/// # Example
///
/// ```no_run
/// use seglog_device::{DeviceId, FileBlockDevice};
/// use std::path::Path;
///
/// let device = FileBlockDevice::create(Path::new("journal.bin"), DeviceId::new(0), 4096, 1 << 26)
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct FileBlockDevice {
    path: PathBuf,
    device_id: DeviceId,
    block_size: u32,
    size: u64,
    file: Arc<Mutex<File>>,
}

impl FileBlockDevice {
    /// Creates or opens a file and sizes it to exactly `size` bytes.
    ///
    /// Existing contents up to `size` are preserved.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or resized, or if
    /// `size` is not a multiple of `block_size`.
    pub fn create(path: &Path, device_id: DeviceId, block_size: u32, size: u64) -> DeviceResult<Self> {
        if size % u64::from(block_size) != 0 {
            return Err(DeviceError::Misaligned {
                offset: 0,
                len: 0,
                block_size,
            });
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(size)?;
        file.sync_all()?;

        Ok(Self {
            path: path.to_path_buf(),
            device_id,
            block_size,
            size,
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Opens an existing device file, taking its size from the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or its length is not
    /// block aligned.
    pub fn open(path: &Path, device_id: DeviceId, block_size: u32) -> DeviceResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len();
        if size % u64::from(block_size) != 0 {
            return Err(DeviceError::Misaligned {
                offset: 0,
                len: 0,
                block_size,
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            device_id,
            block_size,
            size,
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn blocking<T, F>(&self, op: F) -> DeviceResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut File) -> io::Result<T> + Send + 'static,
    {
        let file = Arc::clone(&self.file);
        let joined = tokio::task::spawn_blocking(move || {
            let mut file = file.lock();
            op(&mut file)
        })
        .await;
        match joined {
            Ok(result) => Ok(result?),
            Err(e) => Err(DeviceError::Io(io::Error::new(io::ErrorKind::Other, e))),
        }
    }
}

#[async_trait]
impl RandomBlockDevice for FileBlockDevice {
    fn device_id(&self) -> DeviceId {
        self.device_id
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn read(&self, offset: u64, len: usize) -> DeviceResult<Bytes> {
        check_range(offset, len, self.block_size, self.size)?;
        if len == 0 {
            return Ok(Bytes::new());
        }
        self.blocking(move |file| {
            file.seek(SeekFrom::Start(offset))?;
            let mut buffer = vec![0u8; len];
            file.read_exact(&mut buffer)?;
            Ok(Bytes::from(buffer))
        })
        .await
    }

    async fn write(&self, offset: u64, data: Bytes) -> DeviceResult<()> {
        check_range(offset, data.len(), self.block_size, self.size)?;
        if data.is_empty() {
            return Ok(());
        }
        self.blocking(move |file| {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&data)?;
            file.sync_all()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const BLOCK: u32 = 4096;

    #[tokio::test]
    async fn file_create_sizes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.bin");

        let device = FileBlockDevice::create(&path, DeviceId::new(1), BLOCK, 8 * u64::from(BLOCK))
            .unwrap();
        assert_eq!(device.size(), 8 * u64::from(BLOCK));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8 * u64::from(BLOCK));
    }

    #[tokio::test]
    async fn file_write_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.bin");
        let device = FileBlockDevice::create(&path, DeviceId::new(1), BLOCK, 4 * u64::from(BLOCK))
            .unwrap();

        device
            .write(u64::from(BLOCK), Bytes::from(vec![0x5A; BLOCK as usize]))
            .await
            .unwrap();
        let data = device.read(u64::from(BLOCK), BLOCK as usize).await.unwrap();
        assert!(data.iter().all(|b| *b == 0x5A));

        let untouched = device.read(0, BLOCK as usize).await.unwrap();
        assert!(untouched.iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn file_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.bin");

        {
            let device =
                FileBlockDevice::create(&path, DeviceId::new(1), BLOCK, 4 * u64::from(BLOCK))
                    .unwrap();
            device
                .write(0, Bytes::from(vec![3; BLOCK as usize]))
                .await
                .unwrap();
        }

        let device = FileBlockDevice::open(&path, DeviceId::new(1), BLOCK).unwrap();
        assert_eq!(device.size(), 4 * u64::from(BLOCK));
        let data = device.read(0, BLOCK as usize).await.unwrap();
        assert_eq!(data[0], 3);
    }

    #[tokio::test]
    async fn file_rejects_misaligned_and_out_of_range() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.bin");
        let device = FileBlockDevice::create(&path, DeviceId::new(1), BLOCK, 2 * u64::from(BLOCK))
            .unwrap();

        assert!(matches!(
            device.read(1, BLOCK as usize).await,
            Err(DeviceError::Misaligned { .. })
        ));
        assert!(matches!(
            device
                .write(2 * u64::from(BLOCK), Bytes::from(vec![0; BLOCK as usize]))
                .await,
            Err(DeviceError::OutOfRange { .. })
        ));
    }

    #[test]
    fn file_create_rejects_unaligned_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.bin");
        assert!(FileBlockDevice::create(&path, DeviceId::new(1), BLOCK, 100).is_err());
    }
}
