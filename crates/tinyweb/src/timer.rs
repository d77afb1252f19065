// src/timer.rs
//! Ascending timer list for idle-connection expiry.
//!
//! Nodes live in an arena and link to each other by index, so a handle is
//! just `{index, generation}`: a stale handle to a recycled slot is detected
//! instead of touching somebody else's timer. The list is kept sorted by
//! expiry, head first, so a sweep only ever looks at the front.

use std::time::Instant;

/// Handle to a live timer. Becomes stale once the timer is removed or fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    index: u32,
    generation: u32,
}

struct Entry<T> {
    generation: u32,
    expire: Instant,
    prev: Option<usize>,
    next: Option<usize>,
    /// `None` marks a free slot.
    target: Option<T>,
}

pub struct TimerList<T> {
    entries: Vec<Entry<T>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<T> TimerList<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a timer. Constant time when it expires before every other one.
    pub fn add(&mut self, expire: Instant, target: T) -> TimerId {
        let idx = match self.free.pop() {
            Some(idx) => {
                let entry = &mut self.entries[idx];
                entry.expire = expire;
                entry.prev = None;
                entry.next = None;
                entry.target = Some(target);
                idx
            }
            None => {
                self.entries.push(Entry {
                    generation: 0,
                    expire,
                    prev: None,
                    next: None,
                    target: Some(target),
                });
                self.entries.len() - 1
            }
        };
        self.len += 1;
        self.link_sorted(idx);
        TimerId {
            index: idx as u32,
            generation: self.entries[idx].generation,
        }
    }

    /// Move a timer to a new expiry. Returns false for a stale handle.
    pub fn adjust(&mut self, id: TimerId, expire: Instant) -> bool {
        let Some(idx) = self.resolve(id) else {
            return false;
        };
        let earlier = expire < self.entries[idx].expire;
        let old_next = self.entries[idx].next;
        self.unlink(idx);
        self.entries[idx].expire = expire;
        if earlier {
            self.link_sorted(idx);
        } else {
            // Everything before the old position expires no later than the
            // new time, so the scan can start at the old neighbour.
            self.link_from(idx, old_next);
        }
        true
    }

    /// Drop a timer without firing it.
    pub fn remove(&mut self, id: TimerId) -> Option<T> {
        let idx = self.resolve(id)?;
        self.unlink(idx);
        self.release(idx)
    }

    pub fn expiry(&self, id: TimerId) -> Option<Instant> {
        self.resolve(id).map(|idx| self.entries[idx].expire)
    }

    pub fn get(&self, id: TimerId) -> Option<&T> {
        self.resolve(id)
            .and_then(|idx| self.entries[idx].target.as_ref())
    }

    /// Earliest pending expiry.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.head.map(|idx| self.entries[idx].expire)
    }

    /// Fire every timer whose expiry is at or before `now`, in order.
    /// Returns the number fired. Running it twice with the same `now` fires
    /// nothing the second time.
    pub fn sweep(&mut self, now: Instant, mut on_expire: impl FnMut(T)) -> usize {
        let mut fired = 0;
        while let Some(idx) = self.head {
            if self.entries[idx].expire > now {
                break;
            }
            self.unlink(idx);
            if let Some(target) = self.release(idx) {
                on_expire(target);
                fired += 1;
            }
        }
        fired
    }

    /// Timers in expiry order.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    fn resolve(&self, id: TimerId) -> Option<usize> {
        let idx = id.index as usize;
        let entry = self.entries.get(idx)?;
        (entry.generation == id.generation && entry.target.is_some()).then_some(idx)
    }

    fn release(&mut self, idx: usize) -> Option<T> {
        let entry = &mut self.entries[idx];
        let target = entry.target.take();
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(idx);
        self.len -= 1;
        target
    }

    fn link_sorted(&mut self, idx: usize) {
        match self.head {
            Some(head) if self.entries[idx].expire >= self.entries[head].expire => {
                self.link_from(idx, Some(head));
            }
            _ => self.push_front(idx),
        }
    }

    /// Insert before the first node from `cursor` on that expires strictly
    /// later, or at the tail.
    fn link_from(&mut self, idx: usize, mut cursor: Option<usize>) {
        let expire = self.entries[idx].expire;
        while let Some(c) = cursor {
            if self.entries[c].expire > expire {
                break;
            }
            cursor = self.entries[c].next;
        }
        match cursor {
            Some(c) => self.insert_before(idx, c),
            None => self.push_back(idx),
        }
    }

    fn push_front(&mut self, idx: usize) {
        self.entries[idx].prev = None;
        self.entries[idx].next = self.head;
        match self.head {
            Some(head) => self.entries[head].prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }

    fn push_back(&mut self, idx: usize) {
        self.entries[idx].next = None;
        self.entries[idx].prev = self.tail;
        match self.tail {
            Some(tail) => self.entries[tail].next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    fn insert_before(&mut self, idx: usize, at: usize) {
        let prev = self.entries[at].prev;
        self.entries[idx].prev = prev;
        self.entries[idx].next = Some(at);
        self.entries[at].prev = Some(idx);
        match prev {
            Some(p) => self.entries[p].next = Some(idx),
            None => self.head = Some(idx),
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.entries[idx].prev, self.entries[idx].next);
        match prev {
            Some(p) => self.entries[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.entries[n].prev = prev,
            None => self.tail = prev,
        }
        self.entries[idx].prev = None;
        self.entries[idx].next = None;
    }
}

impl<T> Default for TimerList<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Iter<'a, T> {
    list: &'a TimerList<T>,
    cursor: Option<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (TimerId, Instant, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let idx = self.cursor?;
            let entry = &self.list.entries[idx];
            self.cursor = entry.next;
            if let Some(target) = entry.target.as_ref() {
                let id = TimerId {
                    index: idx as u32,
                    generation: entry.generation,
                };
                return Some((id, entry.expire, target));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn secs(base: Instant, s: u64) -> Instant {
        base + Duration::from_secs(s)
    }

    fn order(list: &TimerList<u32>) -> Vec<u32> {
        list.iter().map(|(_, _, t)| *t).collect()
    }

    fn assert_sorted(list: &TimerList<u32>) {
        let expiries: Vec<Instant> = list.iter().map(|(_, e, _)| e).collect();
        assert!(expiries.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(expiries.len(), list.len());
    }

    #[test]
    fn add_keeps_ascending_order() {
        let base = Instant::now();
        let mut list = TimerList::new();
        for (target, s) in [(1, 30), (2, 10), (3, 20), (4, 40), (5, 10)] {
            list.add(secs(base, s), target);
            assert_sorted(&list);
        }
        // Equal expiries keep insertion order.
        assert_eq!(order(&list), vec![2, 5, 3, 1, 4]);
        assert_eq!(list.next_expiry(), Some(secs(base, 10)));
    }

    #[test]
    fn adjust_moves_later_and_earlier() {
        let base = Instant::now();
        let mut list = TimerList::new();
        let a = list.add(secs(base, 10), 1);
        list.add(secs(base, 20), 2);
        let c = list.add(secs(base, 30), 3);

        assert!(list.adjust(a, secs(base, 35)));
        assert_eq!(order(&list), vec![2, 3, 1]);

        assert!(list.adjust(c, secs(base, 5)));
        assert_eq!(order(&list), vec![3, 2, 1]);

        // Staying put is fine too.
        assert!(list.adjust(c, secs(base, 5)));
        assert_eq!(order(&list), vec![3, 2, 1]);
        assert_eq!(list.expiry(a), Some(secs(base, 35)));
        assert_sorted(&list);
    }

    #[test]
    fn remove_invalidates_handle_and_slot_is_reused() {
        let base = Instant::now();
        let mut list = TimerList::new();
        let a = list.add(secs(base, 10), 1);
        list.add(secs(base, 20), 2);

        assert_eq!(list.remove(a), Some(1));
        assert_eq!(list.remove(a), None);
        assert!(!list.adjust(a, secs(base, 50)));

        let b = list.add(secs(base, 5), 3);
        assert_ne!(a, b);
        assert_eq!(list.get(a), None);
        assert_eq!(list.get(b), Some(&3));
        assert_eq!(order(&list), vec![3, 2]);
    }

    #[test]
    fn sweep_fires_due_timers_once() {
        let base = Instant::now();
        let mut list = TimerList::new();
        for (target, s) in [(1, 1), (2, 2), (3, 3), (4, 10)] {
            list.add(secs(base, s), target);
        }

        let mut fired = Vec::new();
        assert_eq!(list.sweep(secs(base, 3), |t| fired.push(t)), 3);
        assert_eq!(fired, vec![1, 2, 3]);

        assert_eq!(list.sweep(secs(base, 3), |t| fired.push(t)), 0);
        assert_eq!(fired.len(), 3);
        assert_eq!(order(&list), vec![4]);
    }

    #[test]
    fn early_sweep_leaves_list_untouched() {
        let base = Instant::now();
        let mut list = TimerList::new();
        for (target, s) in [(1, 10), (2, 20), (3, 30)] {
            list.add(secs(base, s), target);
        }
        let before: Vec<(TimerId, Instant, u32)> = list.iter().map(|(id, e, t)| (id, e, *t)).collect();
        assert_eq!(list.sweep(secs(base, 9), |_| panic!("nothing is due")), 0);
        let after: Vec<(TimerId, Instant, u32)> = list.iter().map(|(id, e, t)| (id, e, *t)).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn sweep_after_every_timer_fires_empties_list() {
        let base = Instant::now();
        let mut list = TimerList::new();
        let ids: Vec<TimerId> = (0..50).map(|i| list.add(secs(base, 50 - i), i as u32)).collect();
        for id in ids.iter().step_by(3) {
            list.adjust(*id, secs(base, 100));
        }
        assert_sorted(&list);
        assert_eq!(list.sweep(secs(base, 100), |_| {}), 50);
        assert!(list.is_empty());
        assert_eq!(list.next_expiry(), None);
    }
}
