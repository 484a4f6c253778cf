//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use crate::Ts;

/// Timer trait provides mechanisms for accessing monotonic times
/// to assist with protocol implementations.
///
/// All methods are monotonic and relative to the same unknown epoc
pub trait Timer {
    /// Returns the number of millisecond ticks since some unknown epoc
    fn ticks_ms(&self) -> Ts;
}

/// System timer backed by [`std::time::Instant`], epoc is construction time
#[derive(Clone, Debug)]
pub struct SystemTimer {
    start: std::time::Instant,
}

impl SystemTimer {
    pub fn new() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }
}

impl Default for SystemTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for SystemTimer {
    fn ticks_ms(&self) -> Ts {
        self.start.elapsed().as_millis() as Ts
    }
}

#[cfg(any(test, feature = "mocks"))]
pub mod mock {
    use std::sync::{Arc, Mutex};

    use crate::Ts;

    #[derive(Clone, Debug)]
    pub struct MockTimer(Arc<Mutex<Ts>>);

    impl MockTimer {
        pub fn new() -> Self {
            Self(Arc::new(Mutex::new(0)))
        }

        pub fn set_ms(&self, val: Ts) {
            *self.0.lock().unwrap() = val;
        }

        pub fn inc(&self, delta: Ts) {
            let mut v = self.0.lock().unwrap();
            *v += delta;
        }

        pub fn val(&self) -> Ts {
            *self.0.lock().unwrap()
        }
    }

    impl Default for MockTimer {
        fn default() -> Self {
            Self::new()
        }
    }

    impl super::Timer for MockTimer {
        fn ticks_ms(&self) -> Ts {
            *self.0.lock().unwrap()
        }
    }
}
