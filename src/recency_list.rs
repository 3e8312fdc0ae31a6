//! A vec-backed doubly linked list ordered from most to least recently used.
//!
//! Nodes are addressed by their slot index, which stays stable until the node is removed, so the caches can keep an
//! auxiliary hash index pointing into the list.  Freed slots are chained into a free list and reused.
struct OccupiedSlot<T> {
    item: T,
    prev: Option<usize>,
    next: Option<usize>,
}

enum Slot<T> {
    /// Free, possibly pointing at the next free slot.
    Empty { next_empty: Option<usize> },
    Occupied(OccupiedSlot<T>),
}

impl<T> Slot<T> {
    fn as_occupied(&self) -> &OccupiedSlot<T> {
        match self {
            Slot::Occupied(ref x) => x,
            _ => panic!("Slot should be occupied"),
        }
    }

    fn as_occupied_mut(&mut self) -> &mut OccupiedSlot<T> {
        match self {
            Slot::Occupied(ref mut x) => x,
            _ => panic!("Slot should be occupied"),
        }
    }
}

pub(crate) struct RecencyList<T> {
    slots: Vec<Slot<T>>,
    head: Option<usize>,
    tail: Option<usize>,
    empty_head: Option<usize>,
    len: usize,
}

impl<T> RecencyList<T> {
    pub(crate) fn new() -> RecencyList<T> {
        RecencyList {
            slots: Vec::new(),
            head: None,
            tail: None,
            empty_head: None,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Index of the most recent node.
    pub(crate) fn front(&self) -> Option<usize> {
        self.head
    }

    /// Index of the least recent node.
    pub(crate) fn back(&self) -> Option<usize> {
        self.tail
    }

    pub(crate) fn get(&self, index: usize) -> &T {
        &self.slots[index].as_occupied().item
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> &mut T {
        &mut self.slots[index].as_occupied_mut().item
    }

    /// The next less recent node.
    pub(crate) fn next(&self, index: usize) -> Option<usize> {
        self.slots[index].as_occupied().next
    }

    /// The next more recent node.
    pub(crate) fn prev(&self, index: usize) -> Option<usize> {
        self.slots[index].as_occupied().prev
    }

    fn find_empty(&mut self) -> usize {
        if let Some(e) = self.empty_head {
            self.empty_head = match self.slots[e] {
                Slot::Empty { next_empty } => next_empty,
                _ => panic!("Slot should be empty"),
            };
            return e;
        }
        self.slots.push(Slot::Empty { next_empty: None });
        self.slots.len() - 1
    }

    /// Unlink an occupied node, leaving it in place.
    fn unlink(&mut self, index: usize) {
        let (prev, next) = {
            let slot = self.slots[index].as_occupied();
            (slot.prev, slot.next)
        };
        match prev {
            Some(p) => self.slots[p].as_occupied_mut().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].as_occupied_mut().prev = prev,
            None => self.tail = prev,
        }
    }

    fn link_front(&mut self, index: usize) {
        {
            let slot = self.slots[index].as_occupied_mut();
            slot.prev = None;
            slot.next = self.head;
        }
        if let Some(h) = self.head {
            self.slots[h].as_occupied_mut().prev = Some(index);
        }
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
    }

    fn link_back(&mut self, index: usize) {
        {
            let slot = self.slots[index].as_occupied_mut();
            slot.prev = self.tail;
            slot.next = None;
        }
        if let Some(t) = self.tail {
            self.slots[t].as_occupied_mut().next = Some(index);
        }
        self.tail = Some(index);
        if self.head.is_none() {
            self.head = Some(index);
        }
    }

    fn occupy(&mut self, item: T) -> usize {
        let index = self.find_empty();
        self.slots[index] = Slot::Occupied(OccupiedSlot {
            item,
            prev: None,
            next: None,
        });
        self.len += 1;
        index
    }

    /// Insert as the most recent node, returning its index.
    pub(crate) fn push_front(&mut self, item: T) -> usize {
        let index = self.occupy(item);
        self.link_front(index);
        index
    }

    /// Insert as the least recent node, returning its index.
    pub(crate) fn push_back(&mut self, item: T) -> usize {
        let index = self.occupy(item);
        self.link_back(index);
        index
    }

    pub(crate) fn move_to_front(&mut self, index: usize) {
        if self.head != Some(index) {
            self.unlink(index);
            self.link_front(index);
        }
    }

    pub(crate) fn move_to_back(&mut self, index: usize) {
        if self.tail != Some(index) {
            self.unlink(index);
            self.link_back(index);
        }
    }

    pub(crate) fn remove(&mut self, index: usize) -> T {
        self.unlink(index);
        let old = std::mem::replace(
            &mut self.slots[index],
            Slot::Empty {
                next_empty: self.empty_head,
            },
        );
        self.empty_head = Some(index);
        self.len -= 1;
        match old {
            Slot::Occupied(OccupiedSlot { item, .. }) => item,
            _ => panic!("Slot should have been occupied"),
        }
    }

    pub(crate) fn pop_back(&mut self) -> Option<T> {
        let t = self.tail?;
        Some(self.remove(t))
    }

    /// Visit `(index, item)` from most to least recent.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        let mut cur = self.head;
        std::iter::from_fn(move || {
            let index = cur?;
            let slot = self.slots[index].as_occupied();
            cur = slot.next;
            Some((index, &slot.item))
        })
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().filter_map(|s| match s {
            Slot::Occupied(o) => Some(&mut o.item),
            Slot::Empty { .. } => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(list: &RecencyList<u32>) -> Vec<u32> {
        list.iter().map(|(_, x)| *x).collect()
    }

    #[test]
    fn test_ordering() {
        let mut list = RecencyList::new();
        let a = list.push_front(1);
        let b = list.push_front(2);
        let c = list.push_back(3);
        assert_eq!(items(&list), vec![2, 1, 3]);

        list.move_to_front(c);
        assert_eq!(items(&list), vec![3, 2, 1]);
        list.move_to_back(c);
        assert_eq!(items(&list), vec![2, 1, 3]);
        assert_eq!(list.back(), Some(c));
        assert_eq!(list.next(b), Some(a));
        assert_eq!(list.prev(a), Some(b));

        assert_eq!(list.remove(a), 1);
        assert_eq!(items(&list), vec![2, 3]);
        assert_eq!(list.pop_back(), Some(3));
        assert_eq!(list.pop_back(), Some(2));
        assert_eq!(list.pop_back(), None);
        assert!(list.is_empty());
        assert_eq!(list.front(), None);
    }

    #[test]
    fn test_slot_reuse() {
        let mut list = RecencyList::new();
        let a = list.push_front(1);
        list.push_front(2);
        list.remove(a);
        let c = list.push_front(3);
        assert_eq!(a, c);
        assert_eq!(list.len(), 2);
        *list.get_mut(c) = 4;
        assert_eq!(*list.get(c), 4);
        for x in list.iter_mut() {
            *x += 1;
        }
        assert_eq!(items(&list), vec![5, 3]);
    }
}
