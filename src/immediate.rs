//! # immediate scheduling
//!
//! Zero-delay deferred callbacks. A callback is registered once under a tag,
//! then `schedule`d as often as needed; each schedule delivers one call on the
//! next turn of the event loop, never inside the `schedule` call itself.
//!
//! The host pumps the queue with `run_pending` once per turn. Delivery is FIFO
//! across all tags. A tag is looked up at delivery time, so cancelling before
//! delivery drops any message already in flight.
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

const TAG_PREFIX: &str = "$immediate$";

// shared by every registry, so a tag is unique across the whole process
static NEXT_TAG: AtomicU64 = AtomicU64::new(0);

/// Registration handle. Drawn from a process-wide counter, so never reused
/// and never valid in a registry other than the one that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(u64);

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}$", TAG_PREFIX, self.0)
    }
}

type Callback = Rc<RefCell<dyn FnMut()>>;

#[derive(Default)]
struct Registry {
    callbacks: RefCell<HashMap<Tag, Callback>>,
    queue: RefCell<VecDeque<Tag>>,
}

/// Shared handle onto one registry; clones see the same callbacks and queue.
#[derive(Clone, Default)]
pub struct Immediate {
    registry: Rc<Registry>,
}

impl Immediate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, callback: impl FnMut() + 'static) -> Tag {
        let tag = Tag(NEXT_TAG.fetch_add(1, Ordering::Relaxed));
        let callback: Callback = Rc::new(RefCell::new(callback));
        self.registry.callbacks.borrow_mut().insert(tag, callback);
        log::trace!("registered {}", tag);
        tag
    }

    /// post a delivery for `tag`; unknown tags are dropped when it comes due
    pub fn schedule(&self, tag: Tag) {
        self.registry.queue.borrow_mut().push_back(tag);
    }

    /// false if the tag was not registered; cancelling twice is fine
    pub fn cancel(&self, tag: Tag) -> bool {
        let removed = self.registry.callbacks.borrow_mut().remove(&tag).is_some();
        if removed {
            log::trace!("cancelled {}", tag);
        }
        removed
    }

    pub fn is_registered(&self, tag: Tag) -> bool {
        self.registry.callbacks.borrow().contains_key(&tag)
    }

    /// messages waiting for the next turn
    pub fn pending(&self) -> usize {
        self.registry.queue.borrow().len()
    }

    pub fn has_pending(&self) -> bool {
        !self.registry.queue.borrow().is_empty()
    }

    /// One turn of delivery: everything posted before this call, in order.
    /// Anything a callback schedules waits for the next turn. Returns how many
    /// callbacks actually ran.
    pub fn run_pending(&self) -> usize {
        let batch: Vec<Tag> = self.registry.queue.borrow_mut().drain(..).collect();
        let mut fired = 0;
        for tag in batch {
            let callback = self.registry.callbacks.borrow().get(&tag).cloned();
            let callback = match callback {
                Some(cb) => cb,
                None => {
                    log::trace!("dropping delivery for unregistered {}", tag);
                    continue;
                }
            };
            let borrowed = callback.try_borrow_mut();
            match borrowed {
                Ok(mut cb) => {
                    (&mut *cb)();
                    fired += 1;
                }
                Err(_) => log::warn!("{} re-entered its own delivery; skipped", tag),
            };
        }
        fired
    }
}

impl fmt::Debug for Immediate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Immediate")
            .field("registered", &self.registry.callbacks.borrow().len())
            .field("pending", &self.pending())
            .finish()
    }
}
