//! The page layout and the page read-write latch.

use parking_lot::{Condvar, Mutex};

use crate::{PageId, PAGE_SIZE};

/// A fixed-size page as held in a buffer pool frame.
#[derive(Clone)]
pub struct Page {
    pub id: PageId,
    pub data: [u8; PAGE_SIZE],
}

impl Page {
    pub fn new(id: PageId) -> Self {
        Page {
            id,
            data: [0; PAGE_SIZE],
        }
    }

    /// Resets the page to a zeroed page with a new id.
    pub fn reset(&mut self, id: PageId) {
        self.id = id;
        self.data = [0; PAGE_SIZE];
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page").field("id", &self.id).finish()
    }
}

#[derive(Default)]
struct LatchState {
    readers: u32,
    writer: bool,
    waiting_writers: u32,
}

/// A write-preferring read-write latch whose acquire and release are
/// separate calls.
///
/// Latch crabbing acquires a child latch inside a descent loop and releases
/// the parent latch afterwards from a different stack frame, which rules
/// out guard-based locking here. The buffer pool pin count keeps a frame's
/// page in place while its latch is held.
pub struct RwLatch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

impl RwLatch {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LatchState::default()),
            cond: Condvar::new(),
        }
    }

    pub fn rlatch(&self) {
        let mut state = self.state.lock();
        while state.writer || state.waiting_writers > 0 {
            self.cond.wait(&mut state);
        }
        state.readers += 1;
    }

    pub fn runlatch(&self) {
        let mut state = self.state.lock();
        assert!(state.readers > 0, "read latch released while not held");
        state.readers -= 1;
        if state.readers == 0 {
            self.cond.notify_all();
        }
    }

    pub fn wlatch(&self) {
        let mut state = self.state.lock();
        state.waiting_writers += 1;
        while state.writer || state.readers > 0 {
            self.cond.wait(&mut state);
        }
        state.waiting_writers -= 1;
        state.writer = true;
    }

    pub fn wunlatch(&self) {
        let mut state = self.state.lock();
        assert!(state.writer, "write latch released while not held");
        state.writer = false;
        self.cond.notify_all();
    }
}

impl Default for RwLatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_readers_share_writers_exclude() {
        let latch = Arc::new(RwLatch::new());
        let active = Arc::new(AtomicU32::new(0));

        thread::scope(|s| {
            for _ in 0..4 {
                let latch = latch.clone();
                let active = active.clone();
                s.spawn(move || {
                    for _ in 0..200 {
                        latch.wlatch();
                        assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                        active.fetch_sub(1, Ordering::SeqCst);
                        latch.wunlatch();
                    }
                });
            }
            for _ in 0..4 {
                let latch = latch.clone();
                s.spawn(move || {
                    for _ in 0..200 {
                        latch.rlatch();
                        latch.runlatch();
                    }
                });
            }
        });
    }
}
