/// Opaque session identifiers.
///
/// Per spec.md §9's cyclic-reference-risk redesign flag, `SubscriptionHub`
/// stores `SessionId`s rather than references or channel handles back to a
/// session object — sessions and their transport connections live in
/// `command_router.rs`'s connection map, keyed by the same id.
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

#[derive(Default)]
pub struct SessionIdAllocator {
    next: AtomicU64,
}

impl SessionIdAllocator {
    pub fn next(&self) -> SessionId {
        SessionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_hands_out_increasing_distinct_ids() {
        let allocator = SessionIdAllocator::default();
        let a = allocator.next();
        let b = allocator.next();
        assert_ne!(a, b);
        assert!(b > a);
    }
}
