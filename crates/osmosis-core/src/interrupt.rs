//! Run-wide cancellation flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Set once by an external interrupt (Ctrl-C); observed at item boundaries.
///
/// Cancellation is all-or-nothing: every clone shares one flag, and there is
/// no way to lower it again.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    raised: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_flag() {
        let interrupt = Interrupt::new();
        let handle = interrupt.clone();
        assert!(!handle.is_raised());
        interrupt.raise();
        assert!(handle.is_raised());
    }
}
