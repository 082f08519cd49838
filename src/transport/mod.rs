pub mod page;
pub mod page_queue;

pub use page::{Page, PageId};
pub use page_queue::{PageQueue, PageRecycler, PoolStats};
