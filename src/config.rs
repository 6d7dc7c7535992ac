/// Tunables for a [`RatchetEngine`](crate::RatchetEngine).
#[derive(Clone, Debug)]
pub struct RatchetConfig {
    /// Maximum number of message keys a single message may force us to skip.
    pub max_skip: u32,
    /// Capacity of the skipped message key store.
    pub max_skipped_keys: usize,
    /// Occupancy (percent of capacity) above which the oldest skipped keys are evicted.
    pub eviction_high_water_percent: usize,
    /// Occupancy (percent of capacity) eviction trims the store down to.
    pub eviction_low_water_percent: usize,
    /// HKDF info used to derive the initial root key from the shared secret.
    pub root_key_info: Vec<u8>,
    /// HKDF info used for every root/chain key split.
    pub chain_key_info: Vec<u8>,
}

impl Default for RatchetConfig {
    fn default() -> Self {
        Self {
            max_skip: 1000,
            max_skipped_keys: 1000,
            eviction_high_water_percent: 80,
            eviction_low_water_percent: 50,
            root_key_info: b"DoubleRatchet_RootKey".to_vec(),
            chain_key_info: b"DoubleRatchet_ChainKey".to_vec(),
        }
    }
}
