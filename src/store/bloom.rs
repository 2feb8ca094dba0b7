/// Scalable Bloom filter used by the in-memory backend
///
/// Mirrors the RedisBloom layout: each new layer holds `expansion` times the
/// previous capacity and halves the error rate, so the compound false-positive
/// rate stays below the reserved rate as the filter grows.
use sha2::{Digest, Sha256};

const TIGHTENING_RATIO: f64 = 0.5;

struct BloomLayer {
    bits: Vec<u64>,
    num_bits: u64,
    hashes: u32,
    capacity: u64,
    count: u64,
}

impl BloomLayer {
    fn new(capacity: u64, error_rate: f64) -> Self {
        let capacity = capacity.max(1);
        let ln2 = std::f64::consts::LN_2;
        let num_bits = ((-(capacity as f64) * error_rate.ln()) / (ln2 * ln2)).ceil().max(64.0) as u64;
        let hashes = (-error_rate.log2()).ceil().max(1.0) as u32;
        let words = num_bits.div_ceil(64) as usize;

        Self {
            bits: vec![0; words],
            num_bits,
            hashes,
            capacity,
            count: 0,
        }
    }

    fn positions(&self, (h1, h2): (u64, u64)) -> impl Iterator<Item = u64> + '_ {
        (0..self.hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits)
    }

    fn contains(&self, hash: (u64, u64)) -> bool {
        self.positions(hash)
            .all(|bit| self.bits[(bit / 64) as usize] & (1 << (bit % 64)) != 0)
    }

    fn insert(&mut self, hash: (u64, u64)) {
        let positions: Vec<u64> = self.positions(hash).collect();
        for bit in positions {
            self.bits[(bit / 64) as usize] |= 1 << (bit % 64);
        }
        self.count += 1;
    }

    fn is_full(&self) -> bool {
        self.count >= self.capacity
    }
}

/// Growing Bloom filter with no false negatives
pub struct ScalableBloomFilter {
    error_rate: f64,
    expansion: u64,
    layers: Vec<BloomLayer>,
}

impl ScalableBloomFilter {
    pub fn new(error_rate: f64, capacity: u64, expansion: u32) -> Self {
        Self {
            error_rate,
            expansion: u64::from(expansion.max(1)),
            layers: vec![BloomLayer::new(capacity, error_rate)],
        }
    }

    fn hash(key: &str) -> (u64, u64) {
        let digest = Sha256::digest(key.as_bytes());
        let mut first = [0u8; 8];
        let mut second = [0u8; 8];
        first.copy_from_slice(&digest[0..8]);
        second.copy_from_slice(&digest[8..16]);
        // odd step keeps every probe distinct
        (u64::from_le_bytes(first), u64::from_le_bytes(second) | 1)
    }

    pub fn contains(&self, key: &str) -> bool {
        let hash = Self::hash(key);
        self.layers.iter().any(|layer| layer.contains(hash))
    }

    /// Add a key; returns false when it was (probably) present already
    pub fn insert(&mut self, key: &str) -> bool {
        let hash = Self::hash(key);
        if self.layers.iter().any(|layer| layer.contains(hash)) {
            return false;
        }

        let needs_layer = self.layers.last().map_or(true, BloomLayer::is_full);
        if needs_layer {
            let depth = self.layers.len() as i32;
            let previous = self.layers.last().map_or(1, |l| l.capacity);
            let error_rate = self.error_rate * TIGHTENING_RATIO.powi(depth);
            self.layers
                .push(BloomLayer::new(previous.saturating_mul(self.expansion), error_rate));
        }

        if let Some(layer) = self.layers.last_mut() {
            layer.insert(hash);
        }
        true
    }

    /// Number of keys inserted
    #[cfg(test)]
    pub fn len(&self) -> u64 {
        self.layers.iter().map(|l| l.count).sum()
    }

    #[cfg(test)]
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }
}
