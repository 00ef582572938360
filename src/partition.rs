//! Hash partitioning of orders across a fixed number of physical tables.

use crate::config::ConfigError;
use crate::order::OrderKey;

/// Maps an order key to one of `N` partitions.
///
/// The partition is the SHA-256 digest of the key's canonical form, read as a
/// big-endian integer, modulo `N`. Pure: the same key always lands in the same
/// partition, in every process, for a given `N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashPartitioner {
    partitions: usize,
}

impl HashPartitioner {
    /// # Errors
    /// Returns `Err` if `partitions` is zero.
    pub fn new(partitions: usize) -> Result<Self, ConfigError> {
        if partitions == 0 {
            return Err(ConfigError::InvalidPartitions { provided: 0 });
        }
        Ok(Self { partitions })
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    pub fn partition_of(&self, user_id: u64, product_id: u64, sale_id: u64) -> usize {
        self.partition_for(&OrderKey::new(user_id, product_id, sale_id))
    }

    pub fn partition_for(&self, key: &OrderKey) -> usize {
        let n = self.partitions as u128;
        // Horner's rule keeps the running remainder below n * 256.
        let rem = key.digest().iter().fold(0u128, |acc, byte| (acc * 256 + u128::from(*byte)) % n);
        rem as usize
    }

    /// Physical table backing `key`, e.g. `orders_3`.
    pub fn table_name(&self, user_id: u64, product_id: u64, sale_id: u64) -> String {
        Self::table_name_of(self.partition_of(user_id, product_id, sale_id))
    }

    pub fn table_name_of(partition: usize) -> String {
        format!("orders_{}", partition)
    }
}
