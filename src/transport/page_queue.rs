//! Page pool: free list -> current page -> cached list
//!
//! The producer owns the [`PageQueue`] value and with it the page being
//! filled, so `push`/`flush` take `&mut self` and the current page needs no
//! lock. The free and cached lists sit behind their own mutexes and are shared
//! with the worker thread through [`PageRecycler`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::config::BackpressurePolicy;
use crate::error::ChannelError;
use crate::packet::MAX_BODY_LEN;
use crate::transport::page::{Page, PageId};

/// Pool counters
#[derive(Debug, Default)]
struct PoolCounters {
    allocations: AtomicU64,
    recycles: AtomicU64,
    exhaustions: AtomicU64,
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub page_size: usize,
    pub max_pages: usize,
    /// Pages ever created (they are never freed during a session)
    pub live_pages: usize,
    pub free_pages: usize,
    pub cached_pages: usize,
    /// Pages created after the initial preallocation
    pub allocations: u64,
    pub recycles: u64,
    /// Pushes refused at the elastic cap
    pub exhaustions: u64,
}

struct PageLists {
    page_size: usize,
    max_pages: usize,
    free: Mutex<VecDeque<Page>>,
    cached: Mutex<VecDeque<Page>>,
    /// Signalled whenever a page lands back on the free list
    page_returned: Condvar,
    live: AtomicUsize,
    next_id: AtomicU32,
    counters: PoolCounters,
}

impl PageLists {
    fn recycle(&self, mut page: Page) {
        page.reset();
        self.counters.recycles.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(page = %page.id(), "page recycled");

        self.free.lock().push_back(page);
        self.page_returned.notify_one();
    }

    fn headroom(&self) -> usize {
        self.max_pages - self.live.load(Ordering::Acquire)
    }
}

/// Producer side of the page pool
pub struct PageQueue {
    lists: Arc<PageLists>,
    current: Option<Page>,
    policy: BackpressurePolicy,
}

impl PageQueue {
    /// Preallocates `page_count` pages of `page_size` bytes; grows lazily up to `max_pages`
    ///
    /// `page_size` must be non-zero and fit a frame body.
    pub fn new(page_size: usize, page_count: usize, max_pages: usize) -> Result<Self, ChannelError> {
        if page_size == 0 || page_size > MAX_BODY_LEN {
            return Err(ChannelError::config_error(
                "page_size",
                format!("{} is outside 1..={}", page_size, MAX_BODY_LEN),
            ));
        }
        let page_count = page_count.min(max_pages);

        let free: VecDeque<Page> = (0..page_count)
            .map(|i| Page::new(PageId(i as u32), page_size))
            .collect();

        tracing::debug!(page_size, page_count, max_pages, "page queue initialized");

        Ok(Self {
            lists: Arc::new(PageLists {
                page_size,
                max_pages,
                free: Mutex::new(free),
                cached: Mutex::new(VecDeque::new()),
                page_returned: Condvar::new(),
                live: AtomicUsize::new(page_count),
                next_id: AtomicU32::new(page_count as u32),
                counters: PoolCounters::default(),
            }),
            current: None,
            policy: BackpressurePolicy::Reject,
        })
    }

    pub fn with_policy(mut self, policy: BackpressurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn page_size(&self) -> usize {
        self.lists.page_size
    }

    /// Handle for returning pages from another thread
    pub fn recycler(&self) -> PageRecycler {
        PageRecycler {
            lists: Arc::clone(&self.lists),
        }
    }

    /// Copies `data` into pages; full pages move to the cached list
    ///
    /// All-or-nothing: when the bytes cannot fit in free pages plus the growth
    /// left under the elastic cap, nothing is copied and `ResourceExhausted`
    /// is returned (after waiting, under `BackpressurePolicy::Block`).
    pub fn push(&mut self, data: &[u8]) -> Result<usize, ChannelError> {
        if data.is_empty() {
            return Ok(0);
        }

        self.reserve(data.len())?;

        let mut offset = 0;
        while offset < data.len() {
            let mut page = match self.current.take() {
                Some(page) => page,
                None => self.take_page()?,
            };

            offset += page.append(&data[offset..]);

            if page.is_full() {
                self.push_to_cache(page);
            } else {
                self.current = Some(page);
            }
        }

        Ok(data.len())
    }

    /// Makes a partially filled current page eligible for sending
    pub fn flush(&mut self) {
        match self.current.take() {
            Some(page) if !page.is_empty() => self.push_to_cache(page),
            other => self.current = other,
        }
    }

    /// Non-blocking dequeue from the cached list
    pub fn pop(&self) -> Option<Page> {
        self.lists.cached.lock().pop_front()
    }

    /// Moves every cached page into `out`, preserving order
    pub fn drain_into(&self, out: &mut VecDeque<Page>) -> usize {
        let mut cached = self.lists.cached.lock();
        let count = cached.len();
        out.extend(cached.drain(..));
        count
    }

    pub fn recycle(&self, page: Page) {
        self.lists.recycle(page);
    }

    pub fn stats(&self) -> PoolStats {
        stats_of(&self.lists)
    }

    /// Pages needed for `len` more bytes, counting the room left in the current page
    fn pages_needed(&self, len: usize) -> usize {
        let room = self.current.as_ref().map_or(0, Page::remaining);
        let overflow = len.saturating_sub(room);
        (overflow + self.lists.page_size - 1) / self.lists.page_size
    }

    fn reserve(&self, len: usize) -> Result<(), ChannelError> {
        let needed = self.pages_needed(len);
        if needed == 0 {
            return Ok(());
        }

        let lists = &self.lists;
        let mut free = lists.free.lock();

        if free.len() + lists.headroom() >= needed {
            return Ok(());
        }

        if let BackpressurePolicy::Block { timeout } = self.policy {
            let deadline = Instant::now() + timeout;
            tracing::debug!(needed, free = free.len(), "page pool full, waiting for recycled pages");

            while free.len() + lists.headroom() < needed {
                if lists.page_returned.wait_until(&mut free, deadline).timed_out() {
                    break;
                }
            }

            if free.len() + lists.headroom() >= needed {
                return Ok(());
            }
        }

        let free_now = free.len();
        drop(free);

        lists.counters.exhaustions.fetch_add(1, Ordering::Relaxed);
        let live = lists.live.load(Ordering::Acquire);
        tracing::warn!(
            needed,
            free = free_now,
            live,
            max_pages = lists.max_pages,
            "page pool exhausted"
        );

        Err(ChannelError::resource_error(
            "pages",
            live - free_now + needed,
            lists.max_pages,
        ))
    }

    fn take_page(&self) -> Result<Page, ChannelError> {
        let lists = &self.lists;

        if let Some(page) = lists.free.lock().pop_front() {
            return Ok(page);
        }

        // only the producer grows the pool, so the count cannot race upward
        let live = lists.live.load(Ordering::Acquire);
        if live >= lists.max_pages {
            lists.counters.exhaustions.fetch_add(1, Ordering::Relaxed);
            return Err(ChannelError::resource_error("pages", live + 1, lists.max_pages));
        }
        lists.live.store(live + 1, Ordering::Release);

        let id = PageId(lists.next_id.fetch_add(1, Ordering::Relaxed));
        lists.counters.allocations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(page = %id, live = live + 1, "page allocated");

        Ok(Page::new(id, lists.page_size))
    }

    fn push_to_cache(&self, page: Page) {
        tracing::trace!(page = %page.id(), len = page.len(), "page cached");
        self.lists.cached.lock().push_back(page);
    }
}

impl std::fmt::Debug for PageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageQueue")
            .field("stats", &self.stats())
            .field("current_len", &self.current.as_ref().map(Page::len))
            .finish()
    }
}

/// Worker-side handle: returns sent pages to the free list
#[derive(Clone)]
pub struct PageRecycler {
    lists: Arc<PageLists>,
}

impl PageRecycler {
    pub fn recycle(&self, page: Page) {
        self.lists.recycle(page);
    }

    pub fn stats(&self) -> PoolStats {
        stats_of(&self.lists)
    }
}

fn stats_of(lists: &PageLists) -> PoolStats {
    PoolStats {
        page_size: lists.page_size,
        max_pages: lists.max_pages,
        live_pages: lists.live.load(Ordering::Acquire),
        free_pages: lists.free.lock().len(),
        cached_pages: lists.cached.lock().len(),
        allocations: lists.counters.allocations.load(Ordering::Relaxed),
        recycles: lists.counters.recycles.load(Ordering::Relaxed),
        exhaustions: lists.counters.exhaustions.load(Ordering::Relaxed),
    }
}
