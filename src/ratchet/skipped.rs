use crate::X25519PublicKey;
use crate::ratchet::chain::MessageKey;
use std::collections::{HashMap, VecDeque};
use tracing::trace;

/// `(ratchet public key, message index)`
pub(crate) type SkippedKeyId = ([u8; 32], u32);

/// Message keys cached for messages that have not arrived yet.
///
/// The store is bounded: once occupancy rises above the high-water mark the
/// oldest inserted keys are evicted until it is back at the low-water mark.
#[derive(Clone)]
pub(crate) struct SkippedKeyStore {
    keys: HashMap<SkippedKeyId, MessageKey>,
    // Insertion order, oldest first
    order: VecDeque<SkippedKeyId>,
    capacity: usize,
    high_water_percent: usize,
    low_water_percent: usize,
}

impl SkippedKeyStore {
    pub(crate) fn new(capacity: usize, high_water_percent: usize, low_water_percent: usize) -> Self {
        Self {
            keys: HashMap::new(),
            order: VecDeque::new(),
            capacity,
            high_water_percent: high_water_percent.min(100),
            low_water_percent: low_water_percent.min(high_water_percent.min(100)),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn high_water_percent(&self) -> usize {
        self.high_water_percent
    }

    pub(crate) fn low_water_percent(&self) -> usize {
        self.low_water_percent
    }

    // Capacity comes from stored records, so it may be arbitrarily large
    fn high_water_mark(&self) -> usize {
        self.capacity.saturating_mul(self.high_water_percent) / 100
    }

    fn low_water_mark(&self) -> usize {
        self.capacity.saturating_mul(self.low_water_percent) / 100
    }

    /// Caches a message key. Re-inserting an existing id replaces the key but
    /// keeps its original position in the eviction order.
    pub(crate) fn insert(
        &mut self,
        public_key: &X25519PublicKey,
        message_index: u32,
        message_key: MessageKey,
    ) {
        self.insert_id((public_key.to_bytes(), message_index), message_key);
    }

    fn insert_id(&mut self, id: SkippedKeyId, message_key: MessageKey) {
        if self.keys.insert(id, message_key).is_none() {
            self.order.push_back(id);
        }

        if self.keys.len() > self.high_water_mark() {
            self.evict();
        }
    }

    /// Removes and returns the key for `(public_key, message_index)`, if cached.
    #[cfg(test)]
    pub(crate) fn take(
        &mut self,
        public_key: &X25519PublicKey,
        message_index: u32,
    ) -> Option<MessageKey> {
        self.remove(&(public_key.to_bytes(), message_index))
    }

    fn remove(&mut self, id: &SkippedKeyId) -> Option<MessageKey> {
        let message_key = self.keys.remove(id)?;
        self.order.retain(|queued| queued != id);
        Some(message_key)
    }

    /// An empty store with the same limits.
    pub(crate) fn empty_like(&self) -> Self {
        Self::new(
            self.capacity,
            self.high_water_percent,
            self.low_water_percent,
        )
    }

    /// Applies the changes staged while decrypting one message, in order.
    pub(crate) fn commit(&mut self, staged: StagedSkippedKeys) {
        for (id, message_key) in staged.inserted {
            self.insert_id(id, message_key);
        }
        if let Some(id) = staged.taken {
            self.remove(&id);
        }
    }

    /// Cached entries, oldest first.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (&SkippedKeyId, &MessageKey)> {
        self.order
            .iter()
            .filter_map(|id| self.keys.get(id).map(|key| (id, key)))
    }

    fn evict(&mut self) {
        let target = self.low_water_mark();
        let before = self.keys.len();

        while self.keys.len() > target {
            match self.order.pop_front() {
                Some(id) => {
                    self.keys.remove(&id);
                }
                None => break,
            }
        }

        trace!(
            target: "pawl::ratchet",
            evicted = before - self.keys.len(),
            remaining = self.keys.len(),
            "evicted oldest skipped message keys"
        );
    }
}

/// Skipped-key changes made while decrypting one message.
///
/// Nothing reaches the store until [`SkippedKeyStore::commit`], so a rejected
/// message leaves the cache as it was.
#[derive(Default)]
pub(crate) struct StagedSkippedKeys {
    inserted: Vec<(SkippedKeyId, MessageKey)>,
    taken: Option<SkippedKeyId>,
}

impl StagedSkippedKeys {
    pub(crate) fn insert(
        &mut self,
        public_key: &X25519PublicKey,
        message_index: u32,
        message_key: MessageKey,
    ) {
        self.inserted
            .push(((public_key.to_bytes(), message_index), message_key));
    }

    /// Looks for the key among the staged inserts, then in `store`. A key found
    /// in `store` is only removed from it on commit.
    pub(crate) fn take(
        &mut self,
        store: &SkippedKeyStore,
        public_key: &X25519PublicKey,
        message_index: u32,
    ) -> Option<MessageKey> {
        let id = (public_key.to_bytes(), message_index);
        if let Some(position) = self.inserted.iter().position(|(queued, _)| *queued == id) {
            let (_, message_key) = self.inserted.remove(position);
            return Some(message_key);
        }

        let message_key = store.keys.get(&id)?.clone();
        self.taken = Some(id);
        Some(message_key)
    }

    pub(crate) fn len(&self) -> usize {
        self.inserted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> MessageKey {
        MessageKey::from(Box::new([byte; 32]))
    }

    #[test]
    fn test_insert_and_take() {
        let public_key = X25519PublicKey::from([1u8; 32]);
        let other_key = X25519PublicKey::from([2u8; 32]);
        let mut store = SkippedKeyStore::new(10, 80, 50);

        store.insert(&public_key, 3, key(3));
        assert_eq!(store.len(), 1);

        assert!(store.take(&other_key, 3).is_none());
        assert!(store.take(&public_key, 4).is_none());

        let taken = store.take(&public_key, 3).unwrap();
        assert_eq!(taken.as_bytes(), &[3u8; 32]);
        assert_eq!(store.len(), 0);
        assert!(store.take(&public_key, 3).is_none(), "Keys are single use");
    }

    #[test]
    fn test_eviction_is_fifo_down_to_low_water_mark() {
        let public_key = X25519PublicKey::from([1u8; 32]);
        let mut store = SkippedKeyStore::new(10, 80, 50);

        for index in 0..8 {
            store.insert(&public_key, index, key(index as u8));
        }
        assert_eq!(store.len(), 8, "At the high-water mark nothing is evicted");

        store.insert(&public_key, 8, key(8));
        assert_eq!(store.len(), 5);

        // The four oldest keys are gone
        for index in 0..4 {
            assert!(store.take(&public_key, index).is_none());
        }
        for index in 4..9 {
            assert!(store.take(&public_key, index).is_some());
        }
    }

    #[test]
    fn test_taken_keys_leave_eviction_order() {
        let public_key = X25519PublicKey::from([1u8; 32]);
        let mut store = SkippedKeyStore::new(4, 80, 50);

        for _ in 0..100 {
            store.insert(&public_key, 0, key(0));
            store.take(&public_key, 0).unwrap();
        }

        assert_eq!(store.len(), 0);
        assert_eq!(store.iter().count(), 0);
        assert!(store.order.is_empty());
    }

    #[test]
    fn test_iter_preserves_insertion_order() {
        let first = X25519PublicKey::from([1u8; 32]);
        let second = X25519PublicKey::from([2u8; 32]);
        let mut store = SkippedKeyStore::new(1000, 80, 50);

        store.insert(&second, 7, key(1));
        store.insert(&first, 2, key(2));
        store.insert(&second, 1, key(3));

        let ids: Vec<_> = store.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![([2u8; 32], 7), ([1u8; 32], 2), ([2u8; 32], 1)]);
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let public_key = X25519PublicKey::from([9u8; 32]);
        let mut store = SkippedKeyStore::new(1000, 80, 50);

        for index in 0..5000 {
            store.insert(&public_key, index, key(0));
            assert!(store.len() <= 800);
        }
    }

    #[test]
    fn test_staged_changes_apply_on_commit() {
        let public_key = X25519PublicKey::from([3u8; 32]);
        let mut store = SkippedKeyStore::new(1000, 80, 50);
        store.insert(&public_key, 0, key(10));

        let mut staged = StagedSkippedKeys::default();
        let taken = staged.take(&store, &public_key, 0).unwrap();
        assert_eq!(taken.as_bytes(), &[10u8; 32]);
        staged.insert(&public_key, 4, key(14));
        staged.insert(&public_key, 5, key(15));
        assert_eq!(staged.take(&store, &public_key, 5).unwrap().as_bytes(), &[15u8; 32]);
        assert_eq!(staged.len(), 1);

        // Dropping the batch leaves the store alone
        assert_eq!(store.len(), 1);

        store.commit(staged);
        let ids: Vec<_> = store.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![([3u8; 32], 4)]);
    }

    #[test]
    fn test_huge_capacity_does_not_overflow() {
        let public_key = X25519PublicKey::from([4u8; 32]);
        let mut store = SkippedKeyStore::new(usize::MAX, 80, 50);

        for index in 0..10 {
            store.insert(&public_key, index, key(0));
        }
        assert_eq!(store.len(), 10);
    }
}
