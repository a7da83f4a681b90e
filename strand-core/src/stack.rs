//! Singly-linked stacks owned by a single fiber.

use std::fmt::{self, Debug};

/// A singly-linked stack.
///
/// Each fiber keeps its continuation, interrupt status, tracing status,
/// environment, supervisor and fork-scope stacks in one of these. Links only
/// point toward older entries, and a fiber never shares its stacks, so nodes
/// are uniquely owned.
pub(crate) struct LinkedStack<T> {
    head: Option<Box<Node<T>>>,
    len: usize,
}

struct Node<T> {
    value: T,
    next: Option<Box<Node<T>>>,
}

impl<T> LinkedStack<T> {
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    pub fn push(&mut self, value: T) {
        let next = self.head.take();
        self.head = Some(Box::new(Node { value, next }));
        self.len += 1;
    }

    pub fn pop(&mut self) -> Option<T> {
        let node = self.head.take()?;
        let Node { value, next } = *node;
        self.head = next;
        self.len -= 1;
        Some(value)
    }

    pub fn peek(&self) -> Option<&T> {
        self.head.as_ref().map(|node| &node.value)
    }

    #[cfg(test)]
    pub const fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[cfg(test)]
    pub const fn len(&self) -> usize {
        self.len
    }
}

impl<T> LinkedStack<T>
where
    T: Copy,
{
    pub fn peek_or(&self, default: T) -> T {
        self.peek().copied().unwrap_or(default)
    }
}

impl<T> Default for LinkedStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LinkedStack<T> {
    fn drop(&mut self) {
        // Unlink iteratively so that deep stacks don't overflow the native
        // stack while dropping.
        let mut next = self.head.take();
        while let Some(mut node) = next {
            next = node.next.take();
        }
    }
}

impl<T> Debug for LinkedStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkedStack")
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::LinkedStack;

    #[test]
    fn last_in_first_out() {
        let mut stack = LinkedStack::new();
        stack.push(1);
        stack.push(2);
        assert_eq!(stack.peek(), Some(&2));
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.pop(), Some(2));
        assert_eq!(stack.pop(), Some(1));
        assert_eq!(stack.pop(), None);
        assert!(stack.is_empty());
    }

    #[test]
    fn deep_stacks_drop() {
        let mut stack = LinkedStack::new();
        for i in 0..1_000_000 {
            stack.push(i);
        }
        drop(stack);
    }
}
