//! Fiber status

use core::fmt;

/// Lifecycle status of a fiber
///
/// `Running` and `Suspended` are live states; the other four are terminal.
/// Once a fiber reaches a terminal status it never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FiberStatus {
    /// Scheduled or executing on a worker
    Running = 0,

    /// Parked on an async operation, a timer or its children
    Suspended = 1,

    /// Completed with a success value
    Succeeded = 2,

    /// Completed with a typed failure
    Failed = 3,

    /// Completed with a defect
    Died = 4,

    /// Completed because it was interrupted
    Interrupted = 5,
}

impl FiberStatus {
    /// Check if the fiber has reached a terminal status
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            FiberStatus::Succeeded | FiberStatus::Failed | FiberStatus::Died | FiberStatus::Interrupted
        )
    }

    /// Check if the fiber is still live (running or suspended)
    #[inline]
    pub const fn is_live(&self) -> bool {
        !self.is_terminal()
    }
}

impl From<u8> for FiberStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberStatus::Running,
            1 => FiberStatus::Suspended,
            2 => FiberStatus::Succeeded,
            3 => FiberStatus::Failed,
            4 => FiberStatus::Died,
            _ => FiberStatus::Interrupted,
        }
    }
}

impl From<FiberStatus> for u8 {
    fn from(status: FiberStatus) -> u8 {
        status as u8
    }
}

impl fmt::Display for FiberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FiberStatus::Running => "running",
            FiberStatus::Suspended => "suspended",
            FiberStatus::Succeeded => "succeeded",
            FiberStatus::Failed => "failed",
            FiberStatus::Died => "died",
            FiberStatus::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}
