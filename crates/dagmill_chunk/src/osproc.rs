// Copyright (c) the Dagmill Project Authors.
// Licensed under the MIT License.

use std::fmt;

/// Names a worker process by its pid.
///
/// The scheduler picks the *host* a task runs on by naming an `OsProc`; the
/// worker itself then picks the concrete processor within that host. Chunk
/// references carry the `OsProc` that owns the datum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OsProc(u32);

impl OsProc {
    /// Creates a processor identity from a raw pid.
    #[must_use]
    pub const fn new(pid: u32) -> Self {
        Self(pid)
    }

    /// The raw pid.
    #[must_use]
    pub const fn pid(self) -> u32 {
        self.0
    }
}

impl fmt::Display for OsProc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_pid() {
        assert_eq!(OsProc::new(7).to_string(), "proc:7");
    }

    #[test]
    fn ordering_follows_pid() {
        assert!(OsProc::new(1) < OsProc::new(2));
    }
}
