use std::collections::VecDeque;

use crate::region::{Rect, Region};

/// Default number of frames remembered by a [`DamageHistory`].
pub const DEFAULT_HISTORY_DEPTH: usize = 10;

/// The damage of the most recently presented frames, newest first.
///
/// A backbuffer that is `k` frames old misses exactly the damage of the last `k` frames, so
/// [`DamageHistory::accumulate`] with the buffer age reported by the presentation subsystem yields
/// what has to be repainted on it.
#[derive(Debug, Clone)]
pub struct DamageHistory {
    frames: VecDeque<Region>,
    depth: usize,
}

impl Default for DamageHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_DEPTH)
    }
}

impl DamageHistory {
    pub fn new(depth: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(depth),
            depth: depth.max(1),
        }
    }

    /// Records the damage of a frame that was just presented.
    pub fn push(&mut self, damage: Region) {
        if self.frames.len() == self.depth {
            self.frames.pop_back();
        }
        self.frames.push_front(damage);
    }

    /// Union of the damage of the last `age` frames.
    ///
    /// An age of zero yields the empty region. If the history is shorter than `age` the contents of
    /// that buffer are unknown and the whole of `bounds` is returned.
    pub fn accumulate(&self, age: usize, bounds: Rect) -> Region {
        if age == 0 {
            return Region::new();
        }
        if age > self.frames.len() {
            return Region::from_rect(bounds);
        }
        let mut region = Region::new();
        for frame in self.frames.iter().take(age) {
            region.union(frame);
        }
        region
    }

    /// Forgets every recorded frame, e.g. after the buffers were reallocated.
    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
