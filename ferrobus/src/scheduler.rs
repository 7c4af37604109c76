//! Monotonic-time action scheduler for the component event loop.
//!
//! A min-heap of `(deadline, action)` items over [`Instant`]. The
//! component loop asks for [`timeout_ms`](SchedulerHandle::timeout_ms)
//! before each wait and runs all due actions afterwards. Strictly
//! single-threaded: actions run on the loop thread.

use std::cell::RefCell;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Poll interval used when nothing is scheduled.
const IDLE_TIMEOUT_MS: i64 = 1000;

type Action = Box<dyn FnOnce()>;

struct ScheduledItem {
    deadline: Instant,
    seq: u64,
    action: Action,
}

impl PartialEq for ScheduledItem {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for ScheduledItem {}

impl PartialOrd for ScheduledItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // FIFO among equal deadlines via the sequence number
        self.deadline.cmp(&other.deadline).then(self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct Scheduler {
    heap: BinaryHeap<Reverse<ScheduledItem>>,
    seq: u64,
}

impl Scheduler {
    fn schedule(&mut self, after: Duration, action: Action) {
        let item = ScheduledItem {
            deadline: Instant::now() + after,
            seq: self.seq,
            action,
        };
        self.seq += 1;
        self.heap.push(Reverse(item));
    }

    fn timeout_ms(&self) -> i64 {
        match self.heap.peek() {
            None => IDLE_TIMEOUT_MS,
            Some(Reverse(item)) => {
                let now = Instant::now();
                if item.deadline <= now {
                    0
                } else {
                    i64::try_from((item.deadline - now).as_millis()).unwrap_or(i64::MAX)
                }
            }
        }
    }

    fn take_due(&mut self) -> Vec<Action> {
        let now = Instant::now();
        let mut due = Vec::new();
        while let Some(Reverse(item)) = self.heap.peek() {
            if item.deadline > now {
                break;
            }
            if let Some(Reverse(item)) = self.heap.pop() {
                due.push(item.action);
            }
        }
        due
    }
}

/// Shared handle to the component's scheduler.
///
/// Cloning shares the same heap; actions may schedule further actions
/// while running.
#[derive(Clone, Default)]
pub struct SchedulerHandle(Rc<RefCell<Scheduler>>);

impl SchedulerHandle {
    /// New empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `action` to run not sooner than `after_ms`
    /// milliseconds from now.
    ///
    /// The actual delay can be longer, depending on the time spent in
    /// message handlers and other loop work.
    pub fn schedule(&self, after_ms: u64, action: impl FnOnce() + 'static) {
        self.0
            .borrow_mut()
            .schedule(Duration::from_millis(after_ms), Box::new(action));
    }

    /// Milliseconds until the next scheduled action: never negative,
    /// 1000 ms when nothing is scheduled.
    pub fn timeout_ms(&self) -> i64 {
        self.0.borrow().timeout_ms()
    }

    /// Run all scheduled actions whose deadline has passed, in
    /// non-decreasing deadline order.
    pub fn run_scheduled(&self) {
        // Actions run outside the borrow so they can schedule again.
        let due = self.0.borrow_mut().take_due();
        for action in due {
            action();
        }
    }

    /// Number of pending actions.
    pub fn pending(&self) -> usize {
        self.0.borrow().heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_defaults_to_one_second() {
        let scheduler = SchedulerHandle::new();
        assert_eq!(scheduler.timeout_ms(), IDLE_TIMEOUT_MS);
    }

    #[test]
    fn test_timeout_never_negative() {
        let scheduler = SchedulerHandle::new();
        scheduler.schedule(0, || {});
        assert!(scheduler.timeout_ms() >= 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(scheduler.timeout_ms(), 0);
    }

    #[test]
    fn test_actions_run_in_deadline_order() {
        let scheduler = SchedulerHandle::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for (delay, tag) in [(15u64, "late"), (0, "first"), (5, "second")] {
            let order = order.clone();
            scheduler.schedule(delay, move || order.borrow_mut().push(tag));
        }
        std::thread::sleep(Duration::from_millis(30));
        scheduler.run_scheduled();
        assert_eq!(*order.borrow(), vec!["first", "second", "late"]);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_fifo_among_equal_deadlines() {
        let scheduler = SchedulerHandle::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let order = order.clone();
            scheduler.schedule(0, move || order.borrow_mut().push(tag));
        }
        std::thread::sleep(Duration::from_millis(2));
        scheduler.run_scheduled();
        assert_eq!(*order.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_future_actions_stay_pending() {
        let scheduler = SchedulerHandle::new();
        scheduler.schedule(60_000, || panic!("must not run"));
        scheduler.run_scheduled();
        assert_eq!(scheduler.pending(), 1);
    }

    #[test]
    fn test_action_can_reschedule() {
        let scheduler = SchedulerHandle::new();
        let inner = scheduler.clone();
        scheduler.schedule(0, move || inner.schedule(60_000, || {}));
        std::thread::sleep(Duration::from_millis(2));
        scheduler.run_scheduled();
        assert_eq!(scheduler.pending(), 1);
    }
}
