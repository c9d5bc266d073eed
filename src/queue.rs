//! MLFQ run queues: NQUE singly-linked lists threaded through a fixed node
//! arena. Slot i of the process table is always linked through node i, so
//! enqueueing can never run out of nodes.

use crate::param::{NPROC, NQUE};

#[derive(Clone, Copy)]
struct Node {
    next: Option<usize>,
    used: bool,
}

pub struct Queues {
    store: [Node; NPROC],
    heads: [Option<usize>; NQUE],
}

impl Queues {
    pub const fn new() -> Queues {
        Queues {
            store: [Node {
                next: None,
                used: false,
            }; NPROC],
            heads: [None; NQUE],
        }
    }

    /// Append a slot to the tail of queue q.
    pub fn push(&mut self, q: usize, slot: usize) {
        if self.store[slot].used {
            panic!("queue: slot {} already queued", slot);
        }
        self.store[slot] = Node {
            next: None,
            used: true,
        };

        match self.heads[q] {
            None => self.heads[q] = Some(slot),
            Some(head) => {
                let mut i = head;
                while let Some(n) = self.store[i].next {
                    i = n;
                }
                self.store[i].next = Some(slot);
            }
        }
    }

    /// Detach and return the head of queue q.
    pub fn pop(&mut self, q: usize) -> Option<usize> {
        let head = self.heads[q]?;
        self.heads[q] = self.store[head].next;
        self.store[head] = Node {
            next: None,
            used: false,
        };
        Some(head)
    }

    /// Unlink a slot from queue q, wherever it sits. Used by aging, which
    /// moves a specific process rather than whatever is at the head.
    pub fn remove(&mut self, q: usize, slot: usize) {
        match self.heads[q] {
            Some(h) if h == slot => {
                self.heads[q] = self.store[slot].next;
            }
            Some(h) => {
                let mut i = h;
                while let Some(n) = self.store[i].next {
                    if n == slot {
                        self.store[i].next = self.store[slot].next;
                        break;
                    }
                    i = n;
                }
            }
            None => {}
        }
        self.store[slot] = Node {
            next: None,
            used: false,
        };
    }

    pub fn head(&self, q: usize) -> Option<usize> {
        self.heads[q]
    }

    pub fn is_empty(&self, q: usize) -> bool {
        self.heads[q].is_none()
    }

    /// Does any queue of strictly higher priority than q hold a process?
    pub fn higher_nonempty(&self, q: usize) -> bool {
        self.heads[..q].iter().any(|h| h.is_some())
    }

    /// Whether the slot is linked into some queue.
    pub fn contains(&self, slot: usize) -> bool {
        self.store[slot].used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_is_fifo() {
        let mut q = Queues::new();
        q.push(0, 3);
        q.push(0, 7);
        q.push(0, 1);
        assert_eq!(q.pop(0), Some(3));
        assert_eq!(q.pop(0), Some(7));
        assert_eq!(q.pop(0), Some(1));
        assert_eq!(q.pop(0), None);
    }

    #[test]
    fn queues_are_independent() {
        let mut q = Queues::new();
        q.push(0, 2);
        q.push(4, 5);
        assert_eq!(q.pop(4), Some(5));
        assert!(q.is_empty(4));
        assert_eq!(q.pop(0), Some(2));
    }

    #[test]
    fn remove_unlinks_middle_and_head() {
        let mut q = Queues::new();
        q.push(1, 10);
        q.push(1, 11);
        q.push(1, 12);

        q.remove(1, 11);
        assert!(!q.contains(11));
        assert_eq!(q.pop(1), Some(10));
        assert_eq!(q.pop(1), Some(12));

        q.push(1, 11);
        q.remove(1, 11);
        assert!(q.is_empty(1));
    }

    #[test]
    fn contains_tracks_membership() {
        let mut q = Queues::new();
        assert!(!q.contains(0));
        q.push(2, 0);
        assert!(q.contains(0));
        q.pop(2);
        assert!(!q.contains(0));
    }

    #[test]
    fn higher_nonempty_sees_only_better_queues() {
        let mut q = Queues::new();
        q.push(3, 4);
        assert!(q.higher_nonempty(4));
        assert!(!q.higher_nonempty(3));
        assert!(!q.higher_nonempty(0));
    }

    #[test]
    #[should_panic(expected = "already queued")]
    fn double_push_is_fatal() {
        let mut q = Queues::new();
        q.push(0, 1);
        q.push(2, 1);
    }
}
