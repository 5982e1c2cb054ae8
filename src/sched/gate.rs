//! Level-triggered gate for helper threads.
//!
//! Helpers only burn CPU while a large combine or a frame needs them; the
//! rest of the time they block here. Blocking (rather than spinning) is
//! deliberate: the gate sits on cold paths, and the shutdown signal must
//! not require a running helper to notice it.

use std::sync::{Condvar, Mutex};

#[derive(Default)]
struct GateState {
    open: bool,
    quit: bool,
}

pub struct Gate {
    state: Mutex<GateState>,
    cv: Condvar,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            cv: Condvar::new(),
        }
    }

    /// Open the gate if it is closed. Returns true when this call opened
    /// it, so the caller knows to close it again afterwards.
    pub fn open_if_closed(&self) -> bool {
        let mut st = self.state.lock().expect("gate poisoned");
        if st.open {
            return false;
        }
        st.open = true;
        self.cv.notify_all();
        true
    }

    pub fn close(&self) {
        let mut st = self.state.lock().expect("gate poisoned");
        st.open = false;
    }

    /// Signal shutdown and wake every waiter.
    pub fn quit(&self) {
        let mut st = self.state.lock().expect("gate poisoned");
        st.quit = true;
        self.cv.notify_all();
    }

    /// Block until the gate is open. Returns false once shutdown has been
    /// signalled.
    pub fn wait_open(&self) -> bool {
        let mut st = self.state.lock().expect("gate poisoned");
        while !st.open && !st.quit {
            st = self.cv.wait(st).expect("gate poisoned");
        }
        !st.quit
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}
