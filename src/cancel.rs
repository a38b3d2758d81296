// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative stop request shared between a long running dump and whoever
/// wants it to end early. Clones share the same flag.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Consumes a pending request, so the next operation starts clean.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_resets_the_request() {
        let signal = StopSignal::new();
        let remote = signal.clone();

        assert!(!signal.take());
        remote.signal();
        assert!(signal.is_requested());
        assert!(signal.take());
        assert!(!signal.is_requested());
        assert!(!remote.take());
    }
}
