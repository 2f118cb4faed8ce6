mod buffer_pool;
mod page;
mod page_guard;

pub use buffer_pool::BufferPoolManager;
pub use page::{FrameId, PageId, INVALID_PAGE_ID, PAGE_SIZE};
pub use page_guard::{BasicPageGuard, ReadPageGuard, WritePageGuard};
