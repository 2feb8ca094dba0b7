/// Count-min sketch used by the in-memory backend
///
/// Counts never undercount; with width W and depth D the overcount of any item
/// is at most total/W with probability 1 - e^-D.
use sha2::{Digest, Sha256};

pub struct CountMinSketch {
    width: u32,
    depth: u32,
    counters: Vec<u64>,
}

impl CountMinSketch {
    pub fn new(width: u32, depth: u32) -> Self {
        let width = width.max(1);
        let depth = depth.max(1);
        Self {
            width,
            depth,
            counters: vec![0; width as usize * depth as usize],
        }
    }

    fn column(&self, row: u32, item: &str) -> usize {
        let mut hasher = Sha256::new();
        hasher.update(row.to_le_bytes());
        hasher.update(item.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[0..8]);
        (u64::from_le_bytes(bytes) % u64::from(self.width)) as usize
    }

    pub fn increment(&mut self, item: &str, by: u64) {
        for row in 0..self.depth {
            let index = row as usize * self.width as usize + self.column(row, item);
            self.counters[index] = self.counters[index].saturating_add(by);
        }
    }

    pub fn estimate(&self, item: &str) -> u64 {
        (0..self.depth)
            .map(|row| self.counters[row as usize * self.width as usize + self.column(row, item)])
            .min()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimates_never_undercount() {
        let mut sketch = CountMinSketch::new(50, 4);
        for i in 0..200u64 {
            sketch.increment(&format!("topic-{}", i), i + 1);
        }
        for i in 0..200u64 {
            assert!(sketch.estimate(&format!("topic-{}", i)) >= i + 1);
        }
    }

    #[test]
    fn test_repeated_increments_rank_heavy_hitters() {
        let mut sketch = CountMinSketch::new(2000, 5);
        for _ in 0..20 {
            sketch.increment("a", 10);
            sketch.increment("b", 5);
            sketch.increment("c", 1);
        }

        // 20 rounds of 16 increments over 2000 columns
        let bound = 20 * 16 / 2000;
        let a = sketch.estimate("a");
        let b = sketch.estimate("b");
        let c = sketch.estimate("c");

        assert!(a >= 200 && a <= 200 + bound);
        assert!(b >= 100 && b <= 100 + bound);
        assert!(c >= 20 && c <= 20 + bound);
        assert!(a > b && b > c);
    }

    #[test]
    fn test_unknown_item_is_zero_in_empty_sketch() {
        let sketch = CountMinSketch::new(10, 3);
        assert_eq!(sketch.estimate("nothing"), 0);
    }
}
