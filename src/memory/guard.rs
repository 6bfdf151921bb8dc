//! Bounding recursive tracing
//!
//! Tracing an object eagerly calls its trace method from inside the
//! trace method of the object that referenced it. For deep object
//! graphs that recursion would exhaust the native stack, so the guard
//! tracks both the number of nested eager traces and roughly how much
//! stack they have used. Once either limit is hit, marking falls back
//! to the explicit marking stack.

/// An approximation of the current stack pointer
#[inline(always)]
pub fn approximate_stack_pointer() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker) as *const u8 as usize
}

#[derive(Debug)]
pub struct RecursionGuard {
    depth: usize,
    limit: usize,
    /// Stack pointer when marking started
    stack_start: usize,
    /// Bytes of stack eager tracing may consume
    stack_budget: usize,
}

impl RecursionGuard {
    pub fn new(limit: usize, stack_budget: usize) -> Self {
        RecursionGuard {
            depth: 0,
            limit,
            stack_start: approximate_stack_pointer(),
            stack_budget,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Whether it is safe to trace another object recursively
    pub fn is_safe_to_recurse(&self) -> bool {
        if self.depth >= self.limit {
            return false;
        }
        // stacks grow down on every supported target
        let used = self.stack_start.saturating_sub(approximate_stack_pointer());
        used < self.stack_budget
    }

    pub fn enter(&mut self) {
        self.depth += 1;
    }

    pub fn leave(&mut self) {
        debug_assert!(self.depth > 0);
        self.depth -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_limit() {
        let mut guard = RecursionGuard::new(2, usize::MAX);
        assert!(guard.is_safe_to_recurse());
        guard.enter();
        assert!(guard.is_safe_to_recurse());
        guard.enter();
        assert!(!guard.is_safe_to_recurse());
        guard.leave();
        assert!(guard.is_safe_to_recurse());
        assert_eq!(guard.depth(), 1);
    }

    #[inline(never)]
    fn deeper(guard: &RecursionGuard, levels: usize) -> bool {
        let padding = [0u8; 512];
        std::hint::black_box(&padding);
        let safe = if levels == 0 {
            guard.is_safe_to_recurse()
        } else {
            deeper(guard, levels - 1)
        };
        std::hint::black_box(&padding);
        safe
    }

    #[test]
    fn test_stack_budget() {
        let guard = RecursionGuard::new(usize::MAX, 4096);
        assert!(guard.is_safe_to_recurse());
        assert!(!deeper(&guard, 32));
    }
}
