//! Device and segment identifiers.

use std::fmt;
use uuid::Uuid;

/// Identifier of one device within a device group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DeviceId(pub u8);

impl DeviceId {
    /// Creates a new device ID.
    #[must_use]
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "D{}", self.0)
    }
}

/// Index of a segment within its device.
pub type DeviceSegmentId = u32;

/// Identifies one segment: the device plus its index on that device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentId {
    device: DeviceId,
    segment: DeviceSegmentId,
}

impl SegmentId {
    /// Creates a new segment ID.
    #[must_use]
    pub const fn new(device: DeviceId, segment: DeviceSegmentId) -> Self {
        Self { device, segment }
    }

    /// Returns the device holding this segment.
    #[must_use]
    pub const fn device_id(self) -> DeviceId {
        self.device
    }

    /// Returns the segment index within its device.
    #[must_use]
    pub const fn device_segment_id(self) -> DeviceSegmentId {
        self.segment
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seg[{},{}]", self.device, self.segment)
    }
}

/// Identity shared by every device of one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMeta {
    /// Store-wide identifier, mixed into segment nonces.
    pub seastore_id: Uuid,
}

impl DeviceMeta {
    /// Creates metadata with a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            seastore_id: Uuid::new_v4(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_id_ordering_is_device_major() {
        let a = SegmentId::new(DeviceId::new(0), 9);
        let b = SegmentId::new(DeviceId::new(1), 0);
        assert!(a < b);
    }

    #[test]
    fn segment_id_display() {
        let s = SegmentId::new(DeviceId::new(2), 5);
        assert_eq!(format!("{s}"), "Seg[D2,5]");
    }
}
