//! Error taxonomy (spec §7). `FsError` enumerates the kinds that the
//! rest of the crate distinguishes on; call sites that only need to
//! propagate failure use `anyhow::Result` and `?` as the teacher does.

use std::fmt;

/// One of the error kinds a caller might need to branch on. Everything
/// else crosses API boundaries as an opaque `anyhow::Error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    /// Block-device read/write failure.
    Io(String),
    /// A decoded bset or journal entry failed checksum verification.
    Checksum { what: &'static str, at: u64 },
    /// Key absent; often not an error, just "no value at this position".
    NotFound,
    /// Lock contention or journal/arena exhaustion; translates to a
    /// transaction restart.
    Busy(RestartReason),
    /// Allocator could not satisfy a request with the required
    /// replicas/durability.
    NoSpace,
    /// An on-disk invariant was violated.
    Inconsistent(String),
    /// Caller supplied an ill-formed key/value/option.
    Invalid(String),
    /// The filesystem is in a mode that forbids the requested write.
    ReadOnly,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::Io(msg) => write!(f, "I/O error: {msg}"),
            FsError::Checksum { what, at } => {
                write!(f, "checksum mismatch in {what} at {at}")
            }
            FsError::NotFound => write!(f, "key not found"),
            FsError::Busy(reason) => write!(f, "transaction restart: {reason}"),
            FsError::NoSpace => write!(f, "no space left on device"),
            FsError::Inconsistent(msg) => write!(f, "inconsistent filesystem: {msg}"),
            FsError::Invalid(msg) => write!(f, "invalid argument: {msg}"),
            FsError::ReadOnly => write!(f, "filesystem is read-only"),
        }
    }
}

impl std::error::Error for FsError {}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        FsError::Io(e.to_string())
    }
}

/// Reasons the transaction engine restarts a commit (§4.E). Recorded in
/// traces; transparent to the caller beyond the restart itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    WouldDeadlock,
    LockUpgradeFail,
    RelockFail,
    ArenaReallocated,
    TooManyIters,
    Memory,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RestartReason::WouldDeadlock => "would_deadlock",
            RestartReason::LockUpgradeFail => "lock_upgrade_fail",
            RestartReason::RelockFail => "relock_fail",
            RestartReason::ArenaReallocated => "arena_reallocated",
            RestartReason::TooManyIters => "too_many_iters",
            RestartReason::Memory => "memory",
        };
        write!(f, "{s}")
    }
}

/// Per-mount policy for handling `FsError::Inconsistent` at runtime (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorMode {
    /// Log and proceed.
    #[default]
    Continue,
    /// Downgrade the filesystem to read-only.
    ReadOnly,
    /// Abort the process.
    Panic,
}

impl ErrorMode {
    /// Act on an inconsistency according to this policy. Returns `Ok(())`
    /// when the caller should continue, `Err` when it should bail out to
    /// read-only behavior.
    pub fn handle(&self, msg: &str) -> Result<(), FsError> {
        match self {
            ErrorMode::Continue => {
                log::warn!("inconsistency (continuing): {msg}");
                Ok(())
            }
            ErrorMode::ReadOnly => {
                log::error!("inconsistency, downgrading to read-only: {msg}");
                Err(FsError::ReadOnly)
            }
            ErrorMode::Panic => {
                panic!("fatal filesystem inconsistency: {msg}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_stable() {
        assert_eq!(format!("{}", FsError::NotFound), "key not found");
        assert_eq!(
            format!("{}", FsError::Busy(RestartReason::WouldDeadlock)),
            "transaction restart: would_deadlock"
        );
    }

    #[test]
    fn continue_mode_never_errors() {
        assert!(ErrorMode::Continue.handle("test").is_ok());
    }

    #[test]
    fn readonly_mode_errors() {
        assert!(matches!(
            ErrorMode::ReadOnly.handle("test"),
            Err(FsError::ReadOnly)
        ));
    }
}
