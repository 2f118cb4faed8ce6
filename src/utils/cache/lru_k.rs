use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use super::Replacer;
use crate::buffer::FrameId;
use crate::error::{TidepoolError, TidepoolResult};

#[derive(Debug)]
struct LruKNode {
    /// The last K access timestamps, oldest at the front. Once the deque is
    /// full, the front entry is the K-th most recent access.
    history: VecDeque<u64>,
    is_evictable: bool,
}

impl LruKNode {
    fn new() -> Self {
        LruKNode {
            history: VecDeque::new(),
            is_evictable: false,
        }
    }

    fn record_access(&mut self, timestamp: u64, k: usize) {
        self.history.push_back(timestamp);
        if self.history.len() > k {
            self.history.pop_front();
        }
    }

    /// K-th most recent access timestamp, if at least K accesses happened.
    fn kth_timestamp(&self, k: usize) -> Option<u64> {
        if self.history.len() >= k {
            self.history.front().copied()
        } else {
            None
        }
    }
}

#[derive(Debug)]
struct LruKInner {
    node_store: HashMap<FrameId, LruKNode>,
    /// Frames with fewer than K accesses, in first-access order. All have
    /// infinite backward K-distance; the oldest one goes first.
    young: VecDeque<FrameId>,
    /// Frames with at least K accesses, ordered by ascending K-th-most-recent
    /// timestamp. The front has the largest backward K-distance.
    mature: Vec<(FrameId, u64)>,
    evictable_count: usize,
    current_timestamp: u64,
}

impl LruKInner {
    fn remove_from_pools(&mut self, frame_id: FrameId) {
        if let Some(pos) = self.young.iter().position(|&f| f == frame_id) {
            self.young.remove(pos);
        }
        if let Some(pos) = self.mature.iter().position(|&(f, _)| f == frame_id) {
            self.mature.remove(pos);
        }
    }

    fn insert_mature(&mut self, frame_id: FrameId, kth: u64) {
        let pos = self.mature.partition_point(|&(_, ts)| ts < kth);
        self.mature.insert(pos, (frame_id, kth));
    }
}

/// LRU-K replacement policy: the victim is the evictable frame with the
/// largest backward K-distance; frames with fewer than K accesses are treated
/// as infinitely distant and evicted in first-access order.
#[derive(Debug)]
pub struct LRUKReplacer {
    replacer_size: usize,
    k: usize,
    inner: Mutex<LruKInner>,
}

impl LRUKReplacer {
    pub fn new(num_frames: usize, k: usize) -> Self {
        LRUKReplacer {
            replacer_size: num_frames,
            k,
            inner: Mutex::new(LruKInner {
                node_store: HashMap::with_capacity(num_frames),
                young: VecDeque::new(),
                mature: Vec::new(),
                evictable_count: 0,
                current_timestamp: 0,
            }),
        }
    }
}

impl Replacer for LRUKReplacer {
    fn evict(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();
        if inner.evictable_count == 0 {
            return None;
        }
        let victim = inner
            .young
            .iter()
            .chain(inner.mature.iter().map(|(f, _)| f))
            .copied()
            .find(|f| inner.node_store[f].is_evictable)?;
        inner.remove_from_pools(victim);
        inner.node_store.remove(&victim);
        inner.evictable_count -= 1;
        Some(victim)
    }

    fn record_access(&self, frame_id: FrameId) -> TidepoolResult<()> {
        let mut inner = self.inner.lock();
        let timestamp = inner.current_timestamp;
        inner.current_timestamp += 1;

        if !inner.node_store.contains_key(&frame_id) {
            if frame_id >= self.replacer_size {
                return Err(TidepoolError::Internal(format!(
                    "frame id {} exceeds replacer capacity {}",
                    frame_id, self.replacer_size
                )));
            }
            let mut node = LruKNode::new();
            node.record_access(timestamp, self.k);
            inner.node_store.insert(frame_id, node);
            inner.young.push_back(frame_id);
            return Ok(());
        }

        let node = inner
            .node_store
            .get_mut(&frame_id)
            .ok_or_else(|| TidepoolError::Internal("frame vanished".to_string()))?;
        node.record_access(timestamp, self.k);
        let kth = node.kth_timestamp(self.k);

        if let Some(kth) = kth {
            // The frame graduates from (or re-sorts within) the mature pool.
            inner.remove_from_pools(frame_id);
            inner.insert_mature(frame_id, kth);
        }
        Ok(())
    }

    fn set_evictable(&self, frame_id: FrameId, evictable: bool) -> TidepoolResult<()> {
        let mut inner = self.inner.lock();
        let node = inner
            .node_store
            .get_mut(&frame_id)
            .ok_or_else(|| TidepoolError::Internal(format!("frame {} not found", frame_id)))?;
        let was = node.is_evictable;
        node.is_evictable = evictable;
        if evictable && !was {
            inner.evictable_count += 1;
        } else if !evictable && was {
            inner.evictable_count -= 1;
        }
        Ok(())
    }

    fn remove(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        let Some(node) = inner.node_store.get(&frame_id) else {
            return;
        };
        assert!(node.is_evictable, "remove called on a non-evictable frame");
        inner.remove_from_pools(frame_id);
        inner.node_store.remove(&frame_id);
        inner.evictable_count -= 1;
    }

    fn size(&self) -> usize {
        self.inner.lock().evictable_count
    }
}
