use parking_lot::{Condvar, Mutex};
use svcql_error::{DbError, Result};

#[derive(Debug, Default)]
enum SignalState {
    #[default]
    Pending,
    Set,
    Aborted(String),
}

/// One-shot signal set once a query's graph has started.
#[derive(Debug, Default)]
pub struct StartupSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl StartupSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut state = self.state.lock();
        if matches!(*state, SignalState::Pending) {
            *state = SignalState::Set;
            self.cond.notify_all();
        }
    }

    /// Wake waiters with an error. Does nothing if already set.
    pub fn abort(&self, reason: impl Into<String>) {
        let mut state = self.state.lock();
        if matches!(*state, SignalState::Pending) {
            *state = SignalState::Aborted(reason.into());
            self.cond.notify_all();
        }
    }

    pub fn is_set(&self) -> bool {
        matches!(*self.state.lock(), SignalState::Set)
    }

    /// Block until set.
    ///
    /// Being aborted while waiting is a fatal error, callers shouldn't retry.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            match &*state {
                SignalState::Set => return Ok(()),
                SignalState::Aborted(reason) => {
                    return Err(DbError::fatal(format!(
                        "Interrupted while waiting for query to start: {reason}"
                    )));
                }
                SignalState::Pending => self.cond.wait(&mut state),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn wait_returns_once_set() {
        let signal = Arc::new(StartupSignal::new());
        let setter = signal.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            setter.set();
        });
        signal.wait().unwrap();
        assert!(signal.is_set());
        handle.join().unwrap();
    }

    #[test]
    fn abort_is_fatal() {
        let signal = StartupSignal::new();
        signal.abort("stopped");
        let err = signal.wait().unwrap_err();
        assert!(err.is_fatal());

        // Set after abort doesn't change anything.
        signal.set();
        assert!(!signal.is_set());
    }
}
