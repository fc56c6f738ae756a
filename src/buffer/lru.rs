//! LRU list with a midpoint insertion split.
//!
//! The tail-side portion of the list is the "old" sublist. Pages brought in
//! by read-ahead or a first read enter at the head of the old sublist and
//! only move to the young head when accessed again, so one large scan
//! cannot flush the working set.

use super::list::IndexList;

/// Ratio denominator for the old sublist share.
const OLD_RATIO_DIV: usize = 1024;

pub(crate) struct LruList {
    list: IndexList,
    old: Vec<bool>,
    /// Head-most page of the old sublist.
    old_ptr: Option<usize>,
    old_len: usize,
    old_ratio: usize,
    old_min_len: usize,
}

impl LruList {
    pub(crate) fn new(capacity: usize, old_pct: u32, old_min_len: usize) -> Self {
        Self {
            list: IndexList::new(capacity),
            old: vec![false; capacity],
            old_ptr: None,
            old_len: 0,
            old_ratio: (old_pct as usize * OLD_RATIO_DIV) / 100,
            old_min_len: old_min_len.max(1),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.list.len()
    }

    pub(crate) fn old_len(&self) -> usize {
        self.old_len
    }

    pub(crate) fn contains(&self, idx: usize) -> bool {
        self.list.contains(idx)
    }

    pub(crate) fn is_old(&self, idx: usize) -> bool {
        self.old[idx]
    }

    /// True once the list is long enough to keep an old sublist.
    pub(crate) fn has_old_sublist(&self) -> bool {
        self.old_ptr.is_some()
    }

    pub(crate) fn tail(&self) -> Option<usize> {
        self.list.tail()
    }

    /// Neighbor towards the head.
    pub(crate) fn prev(&self, idx: usize) -> Option<usize> {
        self.list.prev(idx)
    }

    pub(crate) fn iter_from_tail(&self) -> impl Iterator<Item = usize> + '_ {
        self.list.iter_rev()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.list.iter()
    }

    /// Links a page. Old pages enter at the head of the old sublist, young
    /// pages at the list head.
    pub(crate) fn add(&mut self, idx: usize, old: bool) {
        match (old, self.old_ptr) {
            (true, Some(anchor)) => {
                self.list.insert_after(anchor, idx);
                self.old[idx] = true;
                self.old_len += 1;
            }
            _ => {
                self.list.push_front(idx);
                self.old[idx] = false;
            }
        }
        self.rebalance();
    }

    pub(crate) fn remove(&mut self, idx: usize) {
        if self.old_ptr == Some(idx) {
            // Extend the old sublist head-wards before unlinking its anchor.
            match self.list.prev(idx) {
                Some(prev) => {
                    self.old[prev] = true;
                    self.old_len += 1;
                    self.old_ptr = Some(prev);
                }
                None => self.old_ptr = self.list.next(idx),
            }
        }
        self.list.remove(idx);
        if self.old[idx] {
            self.old[idx] = false;
            self.old_len -= 1;
        }
        self.rebalance();
    }

    /// Moves a page to the young head.
    pub(crate) fn make_young(&mut self, idx: usize) {
        self.remove(idx);
        self.add(idx, false);
    }

    /// Moves a page to the tail so it is the next eviction candidate.
    pub(crate) fn make_old(&mut self, idx: usize) {
        self.remove(idx);
        self.list.push_back(idx);
        if self.old_ptr.is_some() {
            self.old[idx] = true;
            self.old_len += 1;
        }
        self.rebalance();
    }

    fn target_old_len(&self) -> usize {
        (self.list.len() * self.old_ratio / OLD_RATIO_DIV).max(1)
    }

    fn rebalance(&mut self) {
        if self.list.len() < self.old_min_len {
            self.clear_old();
            return;
        }
        if self.old_ptr.is_none() {
            self.init_old();
        }
        let target = self.target_old_len();
        while self.old_len < target {
            let Some(prev) = self.old_ptr.and_then(|p| self.list.prev(p)) else {
                break;
            };
            self.old[prev] = true;
            self.old_len += 1;
            self.old_ptr = Some(prev);
        }
        while self.old_len > target {
            let Some(ptr) = self.old_ptr else {
                break;
            };
            self.old[ptr] = false;
            self.old_len -= 1;
            self.old_ptr = self.list.next(ptr);
        }
    }

    fn init_old(&mut self) {
        for idx in self.list.iter() {
            self.old[idx] = true;
        }
        self.old_len = self.list.len();
        self.old_ptr = self.list.head();
    }

    fn clear_old(&mut self) {
        if self.old_ptr.take().is_none() {
            return;
        }
        for idx in self.list.iter() {
            self.old[idx] = false;
        }
        self.old_len = 0;
    }

    /// Checks the old flags agree with the old pointer.
    pub(crate) fn validate(&self) -> bool {
        let mut seen_old = false;
        let mut count = 0;
        for idx in self.list.iter() {
            if Some(idx) == self.old_ptr {
                seen_old = true;
            }
            if self.old[idx] != seen_old {
                return false;
            }
            if self.old[idx] {
                count += 1;
            }
        }
        count == self.old_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_list_has_no_old_sublist() {
        let mut lru = LruList::new(16, 37, 8);
        for idx in 0..4 {
            lru.add(idx, true);
        }
        assert!(!lru.has_old_sublist());
        assert_eq!(lru.old_len(), 0);
        assert!(lru.validate());
    }

    #[test]
    fn old_sublist_tracks_ratio() {
        let mut lru = LruList::new(128, 37, 8);
        for idx in 0..100 {
            lru.add(idx, false);
        }
        assert!(lru.has_old_sublist());
        assert_eq!(lru.old_len(), 100 * 378 / 1024);
        assert!(lru.validate());
        for idx in 100..120 {
            lru.add(idx, true);
            assert!(lru.validate());
        }
        assert_eq!(lru.old_len(), 120 * 378 / 1024);
        // Tail pages are old, head pages young.
        assert!(lru.is_old(lru.iter_from_tail().next().unwrap()));
        assert!(!lru.is_old(lru.iter().next().unwrap()));
    }

    #[test]
    fn make_young_and_remove_keep_split_valid() {
        let mut lru = LruList::new(64, 37, 8);
        for idx in 0..40 {
            lru.add(idx, true);
        }
        let tail = lru.iter_from_tail().next().unwrap();
        lru.make_young(tail);
        assert!(!lru.is_old(tail));
        assert_eq!(lru.iter().next(), Some(tail));
        for idx in (0..40).step_by(3) {
            lru.remove(idx);
            assert!(lru.validate());
        }
        let head = lru.iter().next().unwrap();
        lru.make_old(head);
        assert_eq!(lru.iter_from_tail().next(), Some(head));
        assert!(lru.is_old(head));
        assert!(lru.validate());
    }
}
