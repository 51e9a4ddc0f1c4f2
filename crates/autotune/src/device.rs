//! Batch index to device id mapping.

use serde::{Deserialize, Serialize};
use std::ops::Range;
use tilesmith_kernels::backend::DeviceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicePool {
    pub count: u32,
    pub base: DeviceId,
}

impl Default for DevicePool {
    fn default() -> Self {
        Self { count: 1, base: 0 }
    }
}

impl DevicePool {
    pub fn new(count: u32, base: DeviceId) -> Self {
        Self { count, base }
    }

    /// A single device is shared by every unit; otherwise unit `i` gets
    /// `base + i`. Batches larger than the pool run past its end, saturating
    /// at the largest device id.
    pub fn allocate(&self, batch_index: usize) -> DeviceId {
        if self.count == 1 {
            return self.base;
        }
        let offset = DeviceId::try_from(batch_index).unwrap_or(DeviceId::MAX);
        self.base.saturating_add(offset)
    }

    pub fn devices(&self) -> Range<DeviceId> {
        self.base..self.base.saturating_add(self.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_device_is_shared() {
        let pool = DevicePool::new(1, 3);
        let ids: Vec<_> = (0..5).map(|idx| pool.allocate(idx)).collect();
        assert_eq!(ids, vec![3; 5]);
    }

    #[test]
    fn multiple_devices_offset_from_base() {
        let pool = DevicePool::new(4, 2);
        assert_eq!(pool.allocate(0), 2);
        assert_eq!(pool.allocate(3), 5);
        assert_eq!(pool.devices().collect::<Vec<_>>(), vec![2, 3, 4, 5]);
    }

    #[test]
    fn no_wraparound_past_pool() {
        let pool = DevicePool::new(2, 0);
        assert_eq!(pool.allocate(5), 5);
    }

    #[test]
    fn ids_saturate_instead_of_wrapping() {
        let pool = DevicePool::new(4, DeviceId::MAX - 1);
        assert_eq!(pool.allocate(1), DeviceId::MAX);
        assert_eq!(pool.allocate(3), DeviceId::MAX);
        assert_eq!(pool.devices(), DeviceId::MAX - 1..DeviceId::MAX);

        let pool = DevicePool::new(2, 7);
        assert_eq!(pool.allocate(usize::MAX), DeviceId::MAX);
    }
}
