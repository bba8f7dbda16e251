//! Journal configuration.

use crate::error::{JournalError, JournalResult};
use seglog_device::DeviceId;
use uuid::Uuid;

/// Default block size for a circular journal.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Default total size of a circular journal (64 MiB).
pub const DEFAULT_CBJ_SIZE: u64 = 1 << 26;

/// Default device id of a circular journal.
pub const DEFAULT_CBJ_DEVICE_ID: DeviceId = DeviceId::new(128);

/// Configuration for a record submitter.
#[derive(Debug, Clone)]
pub struct SubmitterConfig {
    /// Maximum number of physical writes in flight.
    pub io_depth: usize,

    /// Maximum number of records in one batch.
    pub batch_capacity: usize,

    /// Encoded batch size above which the batch is flushed.
    pub batch_flush_size: u64,

    /// Ratio of useful bytes to encoded bytes above which a batch is
    /// flushed early. Must lie in `[0, 1]`.
    pub preferred_fullness: f64,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            io_depth: 5,
            batch_capacity: 16,
            batch_flush_size: 16 * 1024 * 1024, // 16 MiB
            preferred_fullness: 0.95,
        }
    }
}

impl SubmitterConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the io-depth limit.
    #[must_use]
    pub const fn io_depth(mut self, value: usize) -> Self {
        self.io_depth = value;
        self
    }

    /// Sets the record-count capacity of a batch.
    #[must_use]
    pub const fn batch_capacity(mut self, value: usize) -> Self {
        self.batch_capacity = value;
        self
    }

    /// Sets the byte threshold that forces a flush.
    #[must_use]
    pub const fn batch_flush_size(mut self, value: u64) -> Self {
        self.batch_flush_size = value;
        self
    }

    /// Sets the preferred fullness.
    #[must_use]
    pub const fn preferred_fullness(mut self, value: f64) -> Self {
        self.preferred_fullness = value;
        self
    }

    /// Checks that the values are usable.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if a limit is zero or the fullness lies
    /// outside `[0, 1]`.
    pub fn validate(&self) -> JournalResult<()> {
        if self.io_depth == 0 {
            return Err(JournalError::invalid_argument("io_depth must be > 0"));
        }
        if self.batch_capacity == 0 {
            return Err(JournalError::invalid_argument("batch_capacity must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.preferred_fullness) {
            return Err(JournalError::invalid_argument(format!(
                "preferred_fullness {} outside [0, 1]",
                self.preferred_fullness
            )));
        }
        Ok(())
    }
}

/// Parameters for creating a circular journal.
#[derive(Debug, Clone)]
pub struct CbjConfig {
    /// Block size; must match the device.
    pub block_size: u32,

    /// Bytes of the device used by the journal, header block included.
    pub total_size: u64,

    /// Device id recorded in the header and in record addresses.
    pub device_id: DeviceId,

    /// Identity of the journal instance.
    pub uuid: Uuid,
}

impl Default for CbjConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            total_size: DEFAULT_CBJ_SIZE,
            device_id: DEFAULT_CBJ_DEVICE_ID,
            uuid: Uuid::new_v4(),
        }
    }
}

impl CbjConfig {
    /// Creates a configuration with default values and a fresh uuid.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the block size.
    #[must_use]
    pub const fn block_size(mut self, value: u32) -> Self {
        self.block_size = value;
        self
    }

    /// Sets the total journal size.
    #[must_use]
    pub const fn total_size(mut self, value: u64) -> Self {
        self.total_size = value;
        self
    }

    /// Sets the device id.
    #[must_use]
    pub const fn device_id(mut self, value: DeviceId) -> Self {
        self.device_id = value;
        self
    }

    /// Sets the journal uuid.
    #[must_use]
    pub const fn uuid(mut self, value: Uuid) -> Self {
        self.uuid = value;
        self
    }

    /// Checks the geometry against a device.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the block size differs from the device,
    /// the size is not block aligned, is too small, or exceeds the device.
    pub fn validate(&self, device_block_size: u32, device_size: u64) -> JournalResult<()> {
        if self.block_size == 0 || self.block_size != device_block_size {
            return Err(JournalError::invalid_argument(format!(
                "block size {} does not match device block size {}",
                self.block_size, device_block_size
            )));
        }
        let block = u64::from(self.block_size);
        if self.total_size % block != 0 {
            return Err(JournalError::invalid_argument(format!(
                "total size {} is not a multiple of block size {}",
                self.total_size, block
            )));
        }
        // header block plus room for at least two record blocks
        if self.total_size < 3 * block {
            return Err(JournalError::invalid_argument(format!(
                "total size {} is too small",
                self.total_size
            )));
        }
        if self.total_size > device_size {
            return Err(JournalError::invalid_argument(format!(
                "total size {} exceeds device size {}",
                self.total_size, device_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_submitter_config() {
        let config = SubmitterConfig::default();
        assert_eq!(config.io_depth, 5);
        assert_eq!(config.batch_capacity, 16);
        assert_eq!(config.batch_flush_size, 16 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn submitter_builder_pattern() {
        let config = SubmitterConfig::new()
            .io_depth(1)
            .batch_capacity(4)
            .preferred_fullness(0.5);
        assert_eq!(config.io_depth, 1);
        assert_eq!(config.batch_capacity, 4);
        assert!((config.preferred_fullness - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn submitter_validate_rejects_bad_values() {
        assert!(SubmitterConfig::new().io_depth(0).validate().is_err());
        assert!(SubmitterConfig::new().batch_capacity(0).validate().is_err());
        assert!(SubmitterConfig::new()
            .preferred_fullness(1.5)
            .validate()
            .is_err());
    }

    #[test]
    fn default_cbj_config() {
        let config = CbjConfig::default();
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.total_size, 1 << 26);
        assert_eq!(config.device_id, DeviceId::new(128));
    }

    #[test]
    fn cbj_validate() {
        let config = CbjConfig::new().total_size(16 * 4096);
        assert!(config.validate(4096, 16 * 4096).is_ok());
        assert!(config.validate(512, 16 * 4096).is_err());
        assert!(config.validate(4096, 8 * 4096).is_err());
        assert!(CbjConfig::new()
            .total_size(2 * 4096)
            .validate(4096, 16 * 4096)
            .is_err());
        assert!(CbjConfig::new()
            .total_size(4096 * 4 + 1)
            .validate(4096, 16 * 4096)
            .is_err());
    }
}
