//! Input snapshot and edge detection
//!
//! The input thread owns the only writer of an [`InputSnapshot`]; everything else reads it
//! under the same device lock.

use serde::{Deserialize, Serialize};

use crate::keymap::{EXTRA_BASE, N_KEYBYTES_INPUT, N_KEYS_INPUT};

/// Input bits that only exist for the report they arrive in
pub const WHEEL_UP: usize = EXTRA_BASE;
pub const WHEEL_DOWN: usize = EXTRA_BASE + 1;

/// Bitset over every input key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeySet(pub [u8; N_KEYBYTES_INPUT]);

impl KeySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_indices<I: IntoIterator<Item = usize>>(indices: I) -> Self {
        let mut set = Self::new();
        for i in indices {
            set.set(i);
        }
        set
    }

    pub fn set(&mut self, index: usize) {
        if index < N_KEYS_INPUT {
            self.0[index / 8] |= 1 << (index % 8);
        }
    }

    pub fn clear(&mut self, index: usize) {
        if index < N_KEYS_INPUT {
            self.0[index / 8] &= !(1 << (index % 8));
        }
    }

    pub fn assign(&mut self, index: usize, on: bool) {
        if on {
            self.set(index)
        } else {
            self.clear(index)
        }
    }

    pub fn get(&self, index: usize) -> bool {
        index < N_KEYS_INPUT && self.0[index / 8] & (1 << (index % 8)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Every bit of `self` is also set in `other`
    pub fn is_subset_of(&self, other: &KeySet) -> bool {
        self.0.iter().zip(other.0.iter()).all(|(a, b)| a & b == *a)
    }

    pub fn intersects(&self, other: &KeySet) -> bool {
        self.0.iter().zip(other.0.iter()).any(|(a, b)| a & b != 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..N_KEYS_INPUT).filter(move |i| self.get(*i))
    }
}

/// One key transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub index: usize,
    pub down: bool,
}

/// Per-key transitions from `prev` to `cur`, in input-bit order
pub fn diff(prev: &KeySet, cur: &KeySet) -> Vec<Edge> {
    let mut edges = Vec::new();
    for (byte, (p, c)) in prev.0.iter().zip(cur.0.iter()).enumerate() {
        let changed = p ^ c;
        if changed == 0 {
            continue;
        }
        for bit in 0..8 {
            if changed & (1 << bit) != 0 {
                edges.push(Edge {
                    index: byte * 8 + bit,
                    down: c & (1 << bit) != 0,
                });
            }
        }
    }
    edges
}

/// One decoded hardware report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputReport {
    pub keys: KeySet,
    pub dx: i16,
    pub dy: i16,
}

/// Current and previous key state plus accumulated relative motion
#[derive(Debug, Clone, Default)]
pub struct InputSnapshot {
    pub keys: KeySet,
    pub prev_keys: KeySet,
    pub rel_x: i32,
    pub rel_y: i32,
}

impl InputSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the key state with a new report and return the resulting edges.
    ///
    /// Wheel bits are momentary, so they never carry over into `prev_keys`: every report
    /// with wheel motion yields a fresh down edge and no up edge.
    pub fn apply(&mut self, report: &InputReport) -> Vec<Edge> {
        self.prev_keys = self.keys;
        self.prev_keys.clear(WHEEL_UP);
        self.prev_keys.clear(WHEEL_DOWN);
        self.keys = report.keys;
        self.rel_x += report.dx as i32;
        self.rel_y += report.dy as i32;

        diff(&self.prev_keys, &self.keys)
            .into_iter()
            .filter(|e| e.down || (e.index != WHEEL_UP && e.index != WHEEL_DOWN))
            .collect()
    }

    /// Take the accumulated relative motion
    pub fn take_motion(&mut self) -> (i32, i32) {
        let motion = (self.rel_x, self.rel_y);
        self.rel_x = 0;
        self.rel_y = 0;
        motion
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyset_ops() {
        let mut set = KeySet::new();
        set.set(3);
        set.set(170);
        set.set(N_KEYS_INPUT + 5);
        assert!(set.get(3) && set.get(170));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![3, 170]);

        let combo = KeySet::from_indices([3]);
        assert!(combo.is_subset_of(&set));
        assert!(!set.is_subset_of(&combo));
        assert!(combo.intersects(&set));
        set.clear(3);
        assert!(!combo.intersects(&set));
    }

    #[test]
    fn test_edges_on_change_only() {
        let mut snapshot = InputSnapshot::new();
        let report = InputReport { keys: KeySet::from_indices([10, 20]), dx: 0, dy: 0 };

        let edges = snapshot.apply(&report);
        assert_eq!(edges, vec![Edge { index: 10, down: true }, Edge { index: 20, down: true }]);

        // A repeated report for keys that are already down produces nothing
        assert!(snapshot.apply(&report).is_empty());

        let edges = snapshot.apply(&InputReport { keys: KeySet::from_indices([20]), dx: 0, dy: 0 });
        assert_eq!(edges, vec![Edge { index: 10, down: false }]);
    }

    #[test]
    fn test_wheel_is_momentary() {
        let mut snapshot = InputSnapshot::new();
        let wheel = InputReport { keys: KeySet::from_indices([WHEEL_UP]), dx: 0, dy: 0 };
        assert_eq!(snapshot.apply(&wheel), vec![Edge { index: WHEEL_UP, down: true }]);
        assert_eq!(snapshot.apply(&wheel), vec![Edge { index: WHEEL_UP, down: true }]);
        assert!(snapshot.apply(&InputReport::default()).is_empty());
    }

    #[test]
    fn test_motion_accumulates() {
        let mut snapshot = InputSnapshot::new();
        snapshot.apply(&InputReport { keys: KeySet::new(), dx: 3, dy: -2 });
        snapshot.apply(&InputReport { keys: KeySet::new(), dx: 1, dy: 1 });
        assert_eq!(snapshot.take_motion(), (4, -1));
        assert_eq!(snapshot.take_motion(), (0, 0));
    }
}
