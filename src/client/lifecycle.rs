use std::fmt;
use std::sync::Mutex;

use crate::utils::{Error, Result, locked};

/// Start/terminate state shared by publishers, receivers and browsers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    NotStarted,
    Started,
    Terminated,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lifecycle::NotStarted => "not started",
            Lifecycle::Started => "started",
            Lifecycle::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub(crate) struct LifecycleCell {
    what: &'static str,
    state: Mutex<Lifecycle>,
}

impl LifecycleCell {
    pub fn new(what: &'static str) -> Self {
        Self {
            what,
            state: Mutex::new(Lifecycle::NotStarted),
        }
    }

    pub fn get(&self) -> Lifecycle {
        *locked(&self.state)
    }

    /// `NotStarted -> Started`; anything else is an error.
    pub fn start(&self) -> Result<()> {
        let mut state = locked(&self.state);
        match *state {
            Lifecycle::NotStarted => {
                *state = Lifecycle::Started;
                Ok(())
            }
            other => Err(Error::IllegalState(format!("{} is {other}", self.what))),
        }
    }

    /// Undoes a failed start.
    pub fn reset(&self) {
        let mut state = locked(&self.state);
        if *state == Lifecycle::Started {
            *state = Lifecycle::NotStarted;
        }
    }

    /// Returns `false` if it was already terminated.
    pub fn terminate(&self) -> bool {
        let mut state = locked(&self.state);
        let changed = *state != Lifecycle::Terminated;
        *state = Lifecycle::Terminated;
        changed
    }

    pub fn ensure_started(&self) -> Result<()> {
        match self.get() {
            Lifecycle::Started => Ok(()),
            other => Err(Error::IllegalState(format!("{} is {other}", self.what))),
        }
    }
}
