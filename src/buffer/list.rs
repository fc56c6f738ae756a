//! Doubly linked lists threaded through frame slots.
//!
//! Frames never move, so list membership is expressed with slot indices
//! instead of pointers. Each list owns its own link arrays; a frame can sit
//! in several lists at once.

const NIL: u32 = u32::MAX;

#[derive(Clone, Copy)]
struct Link {
    prev: u32,
    next: u32,
    linked: bool,
}

impl Link {
    const EMPTY: Link = Link {
        prev: NIL,
        next: NIL,
        linked: false,
    };
}

fn opt(raw: u32) -> Option<usize> {
    (raw != NIL).then_some(raw as usize)
}

/// Intrusive list over slot indices `0..capacity`.
pub(crate) struct IndexList {
    links: Vec<Link>,
    head: u32,
    tail: u32,
    len: usize,
}

impl IndexList {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            links: vec![Link::EMPTY; capacity],
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn contains(&self, idx: usize) -> bool {
        self.links[idx].linked
    }

    pub(crate) fn head(&self) -> Option<usize> {
        opt(self.head)
    }

    pub(crate) fn tail(&self) -> Option<usize> {
        opt(self.tail)
    }

    pub(crate) fn next(&self, idx: usize) -> Option<usize> {
        opt(self.links[idx].next)
    }

    pub(crate) fn prev(&self, idx: usize) -> Option<usize> {
        opt(self.links[idx].prev)
    }

    pub(crate) fn push_front(&mut self, idx: usize) {
        assert!(!self.links[idx].linked, "slot {idx} already linked");
        let old_head = self.head;
        self.links[idx] = Link {
            prev: NIL,
            next: old_head,
            linked: true,
        };
        match opt(old_head) {
            Some(h) => self.links[h].prev = idx as u32,
            None => self.tail = idx as u32,
        }
        self.head = idx as u32;
        self.len += 1;
    }

    pub(crate) fn push_back(&mut self, idx: usize) {
        match self.tail() {
            Some(t) => self.insert_after(t, idx),
            None => self.push_front(idx),
        }
    }

    /// Links `idx` immediately tail-side of `pos`.
    pub(crate) fn insert_after(&mut self, pos: usize, idx: usize) {
        assert!(self.links[pos].linked, "anchor slot {pos} not linked");
        assert!(!self.links[idx].linked, "slot {idx} already linked");
        let next = self.links[pos].next;
        self.links[idx] = Link {
            prev: pos as u32,
            next,
            linked: true,
        };
        self.links[pos].next = idx as u32;
        match opt(next) {
            Some(n) => self.links[n].prev = idx as u32,
            None => self.tail = idx as u32,
        }
        self.len += 1;
    }

    /// Links `idx` immediately head-side of `pos`.
    pub(crate) fn insert_before(&mut self, pos: usize, idx: usize) {
        match self.prev(pos) {
            Some(p) => self.insert_after(p, idx),
            None => self.push_front(idx),
        }
    }

    pub(crate) fn remove(&mut self, idx: usize) {
        let link = self.links[idx];
        assert!(link.linked, "slot {idx} not linked");
        match opt(link.prev) {
            Some(p) => self.links[p].next = link.next,
            None => self.head = link.next,
        }
        match opt(link.next) {
            Some(n) => self.links[n].prev = link.prev,
            None => self.tail = link.prev,
        }
        self.links[idx] = Link::EMPTY;
        self.len -= 1;
    }

    pub(crate) fn pop_front(&mut self) -> Option<usize> {
        let head = self.head()?;
        self.remove(head);
        Some(head)
    }

    /// Iterates head to tail.
    pub(crate) fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.head(), move |&idx| self.next(idx))
    }

    /// Iterates tail to head.
    pub(crate) fn iter_rev(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.tail(), move |&idx| self.prev(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_insert_remove_keep_links_consistent() {
        let mut list = IndexList::new(8);
        list.push_front(3);
        list.push_front(1);
        list.push_back(5);
        list.insert_after(1, 7);
        list.insert_before(1, 0);
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![0, 1, 7, 3, 5]);
        assert_eq!(list.iter_rev().collect::<Vec<_>>(), vec![5, 3, 7, 1, 0]);
        list.remove(7);
        list.remove(5);
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![0, 1, 3]);
        assert_eq!(list.tail(), Some(3));
        assert_eq!(list.pop_front(), Some(0));
        assert_eq!(list.len(), 2);
        assert!(!list.contains(0));
        assert!(list.contains(3));
    }

    #[test]
    #[should_panic(expected = "already linked")]
    fn double_insert_panics() {
        let mut list = IndexList::new(2);
        list.push_front(1);
        list.push_back(1);
    }
}
