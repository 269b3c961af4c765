//! C8: optional registry of allocator instances of the same type, walked
//! "try each in turn" by the PMM during bootstrap handoff.

extern crate alloc;

use alloc::boxed::Box;

use spin::Mutex;

/// Which control-plane allocator backs this bank's own node allocations in
/// the embedding kernel. KMM itself just uses `Box` here (see `DESIGN.md`);
/// this flag documents the intended routing once a `#[global_allocator]`
/// is wired up, and is available to callers that want to branch on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BankAllocHook {
    Internal,
    General,
}

struct Node<T> {
    value: T,
    next: Option<Box<Node<T>>>,
}

/// Singly linked registry. `add` pushes to the front; `try_each` walks
/// front-to-back and stops at the first closure that returns `Some`.
pub struct Bank<T> {
    head: Mutex<Option<Box<Node<T>>>>,
    hook: BankAllocHook,
}

impl<T> Bank<T> {
    pub const fn new(hook: BankAllocHook) -> Self {
        Bank { head: Mutex::new(None), hook }
    }

    pub fn hook(&self) -> BankAllocHook {
        self.hook
    }

    pub fn add(&self, value: T) {
        let mut head = self.head.lock();
        let node = Box::new(Node { value, next: head.take() });
        *head = Some(node);
    }

    /// Removes and returns the first entry matching `pred`, if any.
    pub fn remove_where<F: Fn(&T) -> bool>(&self, pred: F) -> Option<T> {
        let mut head = self.head.lock();

        if matches!(head.as_ref(), Some(n) if pred(&n.value)) {
            let node = head.take().unwrap();
            *head = node.next;
            return Some(node.value);
        }

        let mut cur = head.as_mut();
        while let Some(node) = cur {
            let matched = matches!(node.next.as_ref(), Some(n) if pred(&n.value));
            if matched {
                let mut removed = node.next.take().unwrap();
                node.next = removed.next.take();
                return Some(removed.value);
            }
            cur = node.next.as_mut();
        }
        None
    }

    /// Tries every entry in chain order, returning the first non-`None`
    /// result. Used for "try each allocator in turn" sweeps.
    pub fn try_each<R, F: Fn(&T) -> Option<R>>(&self, f: F) -> Option<R> {
        let head = self.head.lock();
        let mut cur = head.as_deref();
        while let Some(node) = cur {
            if let Some(r) = f(&node.value) {
                return Some(r);
            }
            cur = node.next.as_deref();
        }
        None
    }

    pub fn len(&self) -> usize {
        let head = self.head.lock();
        let mut cur = head.as_deref();
        let mut n = 0;
        while let Some(node) = cur {
            n += 1;
            cur = node.next.as_deref();
        }
        n
    }

    pub fn is_empty(&self) -> bool {
        self.head.lock().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_try_each_finds_match() {
        let bank: Bank<u32> = Bank::new(BankAllocHook::General);
        bank.add(1);
        bank.add(2);
        bank.add(3);
        assert_eq!(bank.len(), 3);

        let found = bank.try_each(|v| if *v == 2 { Some(*v * 10) } else { None });
        assert_eq!(found, Some(20));
    }

    #[test]
    fn remove_where_drops_matching_entry() {
        let bank: Bank<u32> = Bank::new(BankAllocHook::Internal);
        bank.add(1);
        bank.add(2);
        bank.add(3);

        let removed = bank.remove_where(|v| *v == 2);
        assert_eq!(removed, Some(2));
        assert_eq!(bank.len(), 2);
        assert_eq!(bank.try_each(|v| if *v == 2 { Some(()) } else { None }), None);
    }
}
