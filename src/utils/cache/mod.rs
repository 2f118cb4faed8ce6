pub mod lru_k;

use crate::buffer::FrameId;
use crate::error::TidepoolResult;

/// Eviction policy over buffer pool frames. Implementations are internally
/// synchronized; callers never wrap them in an extra lock.
pub trait Replacer {
    /// Pick a victim among the evictable frames and forget its state.
    fn evict(&self) -> Option<FrameId>;

    /// Note an access to `frame_id` at the current logical timestamp.
    fn record_access(&self, frame_id: FrameId) -> TidepoolResult<()>;

    /// Mark whether `frame_id` may be chosen as a victim.
    fn set_evictable(&self, frame_id: FrameId, evictable: bool) -> TidepoolResult<()>;

    /// Drop all state for `frame_id`. The frame must currently be evictable.
    fn remove(&self, frame_id: FrameId);

    /// Number of evictable frames.
    fn size(&self) -> usize;
}
