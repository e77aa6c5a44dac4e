//! Lock-free forward-linked stacks.
//!
//! Regions travel between the collector's lists by being pushed onto and
//! popped off these. A node lives on at most one list at a time; `steal`
//! moves a whole list in one swap, which is how the stop-the-world boundary
//! reclassifies every full region at once.

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Implemented by types that embed a forward link.
pub trait ForwardNode: Sized {
    fn next_link(&self) -> &AtomicPtr<Self>;
}

pub struct ForwardList<T: ForwardNode> {
    head: AtomicPtr<T>,
    count: AtomicUsize,
}

unsafe impl<T: ForwardNode> Send for ForwardList<T> {}
unsafe impl<T: ForwardNode> Sync for ForwardList<T> {}

impl<T: ForwardNode> ForwardList<T> {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(std::ptr::null_mut()),
            count: AtomicUsize::new(0),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// # Safety
    /// `node` must be valid and not linked into any list.
    pub unsafe fn push(&self, node: *mut T) {
        debug_assert!(
            (*node).next_link().load(Ordering::Relaxed).is_null(),
            "node is linked in another list"
        );
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            (*node).next_link().store(head, Ordering::Release);
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(found) => head = found,
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Pops the most recently pushed node, unlinked.
    pub fn pop(&self) -> Option<*mut T> {
        let mut node = self.head.load(Ordering::Acquire);
        loop {
            if node.is_null() {
                return None;
            }
            let next = unsafe { (*node).next_link().load(Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(node, next, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(found) => node = found,
            }
        }
        self.count.fetch_sub(1, Ordering::Relaxed);
        unsafe {
            (*node).next_link().store(std::ptr::null_mut(), Ordering::Release);
        }
        Some(node)
    }

    /// Atomically takes everything out of `other` and splices it onto the
    /// front of this list. The multiset of nodes is preserved.
    pub fn steal(&self, other: &ForwardList<T>) {
        let other_head = other.head.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if other_head.is_null() {
            return;
        }

        let mut tail = other_head;
        let mut count = 1usize;
        unsafe {
            loop {
                let next = (*tail).next_link().load(Ordering::Relaxed);
                if next.is_null() {
                    break;
                }
                tail = next;
                count += 1;
            }
        }
        other.count.fetch_sub(count, Ordering::Relaxed);

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe {
                (*tail).next_link().store(head, Ordering::Release);
            }
            match self
                .head
                .compare_exchange_weak(head, other_head, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(found) => head = found,
            }
        }
        self.count.fetch_add(count, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Node {
        next: AtomicPtr<Node>,
        value: usize,
    }

    impl Node {
        fn new(value: usize) -> Box<Node> {
            Box::new(Node {
                next: AtomicPtr::new(std::ptr::null_mut()),
                value,
            })
        }
    }

    impl ForwardNode for Node {
        fn next_link(&self) -> &AtomicPtr<Node> {
            &self.next
        }
    }

    fn drain(list: &ForwardList<Node>) -> Vec<usize> {
        let mut out = vec![];
        while let Some(node) = list.pop() {
            let node = unsafe { Box::from_raw(node) };
            out.push(node.value);
        }
        out
    }

    #[test]
    fn push_pop_is_lifo() {
        let list = ForwardList::new();
        unsafe {
            list.push(Box::into_raw(Node::new(1)));
            list.push(Box::into_raw(Node::new(2)));
        }
        assert_eq!(list.count(), 2);
        assert_eq!(drain(&list), vec![2, 1]);
        assert_eq!(list.count(), 0);
        assert!(list.pop().is_none());
    }

    #[test]
    fn steal_empty_is_nothing() {
        let a: ForwardList<Node> = ForwardList::new();
        let b: ForwardList<Node> = ForwardList::new();
        a.steal(&b);
        assert_eq!(a.count(), 0);
        assert!(a.pop().is_none());
    }

    #[test]
    fn steal_preserves_the_multiset() {
        let a = ForwardList::new();
        let b = ForwardList::new();
        unsafe {
            for i in 0..5 {
                b.push(Box::into_raw(Node::new(i)));
            }
            a.push(Box::into_raw(Node::new(100)));
        }
        a.steal(&b);
        assert_eq!(a.count(), 6);
        assert_eq!(b.count(), 0);
        let mut values = drain(&a);
        values.sort_unstable();
        assert_eq!(values, vec![0, 1, 2, 3, 4, 100]);
    }

    #[test]
    fn concurrent_push_pop_keeps_every_node() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Arc;

        let list = Arc::new(ForwardList::new());
        let popped = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for t in 0..4 {
            let list = list.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..1000 {
                    unsafe { list.push(Box::into_raw(Node::new(t * 1000 + i))) }
                }
            }));
        }
        for _ in 0..2 {
            let list = list.clone();
            let popped = popped.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    if let Some(node) = list.pop() {
                        drop(unsafe { Box::from_raw(node) });
                        popped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let rest = drain(&list).len();
        assert_eq!(rest + popped.load(Ordering::Relaxed), 4000);
    }
}
