//! Exclusive-ownership containers mediating hand-off of entities between
//! activities.
//!
//! All three disciplines share one contract: `put` stores an item, `get`
//! suspends the caller until an item is available. A blocked waiter is
//! resumed by scheduling an immediate wakeup through the [`Scheduler`], so
//! every hand-off obeys the global (time, sequence) resumption order and
//! ownership of the item moves to exactly one receiver.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};

use super::scheduler::{ActivityId, Scheduler};

/// FIFO pool: `get` returns items in `put` order.
pub struct FifoPool<T> {
    items: VecDeque<T>,
    waiters: VecDeque<ActivityId>,
}

impl<T> FifoPool<T> {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
            waiters: VecDeque::new(),
        }
    }

    pub fn put<W: From<T>>(&mut self, item: T, sched: &mut Scheduler<W>) {
        if let Some(waiter) = self.waiters.pop_front() {
            sched.schedule_now(waiter, item.into());
        } else {
            self.items.push_back(item);
        }
    }

    /// Suspend `waiter` until an item is available; the earliest-stored item
    /// is delivered through the scheduler.
    pub fn get<W: From<T>>(&mut self, waiter: ActivityId, sched: &mut Scheduler<W>) {
        if let Some(item) = self.items.pop_front() {
            sched.schedule_now(waiter, item.into());
        } else {
            self.waiters.push_back(waiter);
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn waiting(&self) -> impl Iterator<Item = ActivityId> + '_ {
        self.waiters.iter().copied()
    }
}

impl<T> Default for FifoPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct Prioritized<T> {
    priority: u32,
    arrival: u64,
    item: T,
}

impl<T> PartialEq for Prioritized<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Prioritized<T> {}

impl<T> PartialOrd for Prioritized<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Prioritized<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap: lowest priority tag is served first,
        // ties broken by arrival order.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.arrival.cmp(&self.arrival))
    }
}

/// Priority pool: each item carries a priority tag (lower tag = served
/// earlier); `get` returns the best-priority item, ties broken by arrival.
pub struct PriorityPool<T> {
    heap: BinaryHeap<Prioritized<T>>,
    arrivals: u64,
    waiters: VecDeque<ActivityId>,
}

impl<T> PriorityPool<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            arrivals: 0,
            waiters: VecDeque::new(),
        }
    }

    pub fn put<W: From<T>>(&mut self, item: T, priority: u32, sched: &mut Scheduler<W>) {
        if let Some(waiter) = self.waiters.pop_front() {
            sched.schedule_now(waiter, item.into());
        } else {
            let arrival = self.arrivals;
            self.arrivals += 1;
            self.heap.push(Prioritized {
                priority,
                arrival,
                item,
            });
        }
    }

    pub fn get<W: From<T>>(&mut self, waiter: ActivityId, sched: &mut Scheduler<W>) {
        if let Some(entry) = self.heap.pop() {
            sched.schedule_now(waiter, entry.item.into());
        } else {
            self.waiters.push_back(waiter);
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn waiting(&self) -> impl Iterator<Item = ActivityId> + '_ {
        self.waiters.iter().copied()
    }
}

impl<T> Default for PriorityPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct FilterWaiter<T> {
    id: ActivityId,
    predicate: Box<dyn Fn(&T) -> bool>,
}

/// Filterable pool: `get_match` suspends until an item satisfying the
/// predicate is present, then delivers the first such item in arrival order.
///
/// Simultaneous filtered waiters each receive a distinct item: every insert
/// re-evaluates all pending waiters in waiter-arrival order, removing the
/// matched item before the next waiter is considered.
pub struct FilterPool<T> {
    items: VecDeque<T>,
    waiters: VecDeque<FilterWaiter<T>>,
}

impl<T> FilterPool<T> {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
            waiters: VecDeque::new(),
        }
    }

    pub fn put<W: From<T>>(&mut self, item: T, sched: &mut Scheduler<W>) {
        self.items.push_back(item);
        self.match_waiters(sched);
    }

    pub fn get_match<W, P>(&mut self, waiter: ActivityId, predicate: P, sched: &mut Scheduler<W>)
    where
        W: From<T>,
        P: Fn(&T) -> bool + 'static,
    {
        if let Some(pos) = self.items.iter().position(|item| predicate(item)) {
            let item = self.items.remove(pos).expect("position within bounds");
            sched.schedule_now(waiter, item.into());
        } else {
            self.waiters.push_back(FilterWaiter {
                id: waiter,
                predicate: Box::new(predicate),
            });
        }
    }

    /// Remove and return the first item matching `predicate` without
    /// suspending; `None` if nothing matches right now.
    pub fn take_match<P: Fn(&T) -> bool>(&mut self, predicate: P) -> Option<T> {
        let pos = self.items.iter().position(|item| predicate(item))?;
        self.items.remove(pos)
    }

    pub fn contains<P: Fn(&T) -> bool>(&self, predicate: P) -> bool {
        self.items.iter().any(predicate)
    }

    fn match_waiters<W: From<T>>(&mut self, sched: &mut Scheduler<W>) {
        let mut i = 0;
        while i < self.waiters.len() {
            let matched = {
                let waiter = &self.waiters[i];
                self.items.iter().position(|item| (waiter.predicate)(item))
            };
            if let Some(pos) = matched {
                let item = self.items.remove(pos).expect("position within bounds");
                let waiter = self.waiters.remove(i).expect("waiter within bounds");
                sched.schedule_now(waiter.id, item.into());
            } else {
                i += 1;
            }
        }
    }

    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn waiting(&self) -> impl Iterator<Item = ActivityId> + '_ {
        self.waiters.iter().map(|w| w.id)
    }
}

impl<T> Default for FilterPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ActivityId = ActivityId(10);
    const B: ActivityId = ActivityId(11);

    fn drain(sched: &mut Scheduler<String>) -> Vec<(ActivityId, String)> {
        std::iter::from_fn(|| sched.pop().map(|s| (s.target, s.wake))).collect()
    }

    #[test]
    fn fifo_delivers_in_put_order() {
        let mut sched: Scheduler<String> = Scheduler::new();
        let mut pool: FifoPool<String> = FifoPool::new();

        pool.put("one".to_string(), &mut sched);
        pool.put("two".to_string(), &mut sched);
        pool.get(A, &mut sched);
        pool.get(B, &mut sched);

        let delivered = drain(&mut sched);
        assert_eq!(
            delivered,
            vec![(A, "one".to_string()), (B, "two".to_string())]
        );
    }

    #[test]
    fn fifo_waiters_resume_in_arrival_order() {
        let mut sched: Scheduler<String> = Scheduler::new();
        let mut pool: FifoPool<String> = FifoPool::new();

        pool.get(B, &mut sched);
        pool.get(A, &mut sched);
        pool.put("first".to_string(), &mut sched);
        pool.put("second".to_string(), &mut sched);

        let delivered = drain(&mut sched);
        assert_eq!(
            delivered,
            vec![(B, "first".to_string()), (A, "second".to_string())]
        );
    }

    #[test]
    fn priority_pool_orders_by_tag_then_arrival() {
        let mut sched: Scheduler<String> = Scheduler::new();
        let mut pool: PriorityPool<String> = PriorityPool::new();

        pool.put("urgent-late".to_string(), 1, &mut sched);
        pool.put("relaxed".to_string(), 5, &mut sched);
        pool.put("urgent-later".to_string(), 1, &mut sched);

        pool.get(A, &mut sched);
        pool.get(A, &mut sched);
        pool.get(A, &mut sched);

        let order: Vec<String> = drain(&mut sched).into_iter().map(|(_, w)| w).collect();
        assert_eq!(order, vec!["urgent-late", "urgent-later", "relaxed"]);
    }

    #[test]
    fn filter_pool_matches_in_arrival_order() {
        let mut sched: Scheduler<String> = Scheduler::new();
        let mut pool: FilterPool<String> = FilterPool::new();

        pool.put("blue-1".to_string(), &mut sched);
        pool.put("red-1".to_string(), &mut sched);
        pool.put("red-2".to_string(), &mut sched);

        pool.get_match(A, |item: &String| item.starts_with("red"), &mut sched);
        let delivered = drain(&mut sched);
        assert_eq!(delivered, vec![(A, "red-1".to_string())]);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn filter_pool_never_double_delivers() {
        let mut sched: Scheduler<String> = Scheduler::new();
        let mut pool: FilterPool<String> = FilterPool::new();

        // Two waiters with the same predicate; a single insert must satisfy
        // only the earlier-arrived waiter.
        pool.get_match(A, |item: &String| item.starts_with("red"), &mut sched);
        pool.get_match(B, |item: &String| item.starts_with("red"), &mut sched);

        pool.put("red-1".to_string(), &mut sched);
        let delivered = drain(&mut sched);
        assert_eq!(delivered, vec![(A, "red-1".to_string())]);
        assert_eq!(pool.waiting().collect::<Vec<_>>(), vec![B]);

        pool.put("red-2".to_string(), &mut sched);
        let delivered = drain(&mut sched);
        assert_eq!(delivered, vec![(B, "red-2".to_string())]);
    }

    #[test]
    fn filter_pool_insert_resumes_every_satisfiable_waiter() {
        let mut sched: Scheduler<String> = Scheduler::new();
        let mut pool: FilterPool<String> = FilterPool::new();

        pool.get_match(A, |item: &String| item.contains('-'), &mut sched);
        pool.put("plain".to_string(), &mut sched);
        assert!(drain(&mut sched).is_empty());

        // The dashed insert satisfies the pending waiter even though an
        // unmatched item arrived first.
        pool.put("dash-ed".to_string(), &mut sched);
        let delivered = drain(&mut sched);
        assert_eq!(delivered, vec![(A, "dash-ed".to_string())]);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn take_match_is_non_blocking() {
        let mut pool: FilterPool<String> = FilterPool::new();
        assert!(pool.take_match(|_| true).is_none());
    }
}
