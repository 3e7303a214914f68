//! Transient verification-VM lifecycle.
//!
//! Cloud provisioning primitives live outside the coordinator; this is the
//! seam the Verifier drives. Implementations wrap the deployment's compute
//! API (start, poll running-state, run a shell command, poll its status,
//! fetch its output, stop).

use async_trait::async_trait;

use crate::error::VmError;

/// Remote command status as reported by the compute API.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VmCommandStatus {
    Success,
    InProgress,
    Pending,
    Cancelled,
    Cancelling,
    Delayed,
    Failed,
    TimedOut,
    Unknown(String),
}

impl VmCommandStatus {
    /// Still worth polling.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::InProgress | Self::Pending)
    }

    /// Terminal without success.
    pub fn is_aborted(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Cancelling | Self::Delayed | Self::Failed | Self::TimedOut
        )
    }
}

impl std::fmt::Display for VmCommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::InProgress => write!(f, "IN_PROGRESS"),
            Self::Pending => write!(f, "PENDING"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Cancelling => write!(f, "CANCELLING"),
            Self::Delayed => write!(f, "DELAYED"),
            Self::Failed => write!(f, "FAILED"),
            Self::TimedOut => write!(f, "TIMED_OUT"),
            Self::Unknown(s) => write!(f, "{s}"),
        }
    }
}

/// Driver for the contended per-circuit verification VM. Only the Verifier
/// may start or stop an instance, and only while it is the current verifying
/// actor for that circuit.
#[async_trait]
pub trait VmExecutor: Send + Sync {
    async fn start_instance(&self, instance_id: &str) -> Result<(), VmError>;

    async fn is_running(&self, instance_id: &str) -> Result<bool, VmError>;

    /// Issue a shell command; returns the command id to poll.
    async fn run_command(&self, instance_id: &str, command: &str) -> Result<String, VmError>;

    async fn command_status(&self, command_id: &str) -> Result<VmCommandStatus, VmError>;

    /// Standard output of a finished command.
    async fn command_output(&self, command_id: &str) -> Result<String, VmError>;

    async fn stop_instance(&self, instance_id: &str) -> Result<(), VmError>;
}

/// Executor for deployments without a compute API. Every call reports the VM
/// as unavailable; circuits must be configured for LOCAL verification.
pub struct DisabledVmExecutor;

#[async_trait]
impl VmExecutor for DisabledVmExecutor {
    async fn start_instance(&self, instance_id: &str) -> Result<(), VmError> {
        Err(VmError::Unconfigured(instance_id.to_string()))
    }

    async fn is_running(&self, instance_id: &str) -> Result<bool, VmError> {
        Err(VmError::Unconfigured(instance_id.to_string()))
    }

    async fn run_command(&self, instance_id: &str, _command: &str) -> Result<String, VmError> {
        Err(VmError::Unconfigured(instance_id.to_string()))
    }

    async fn command_status(&self, command_id: &str) -> Result<VmCommandStatus, VmError> {
        Err(VmError::Unconfigured(command_id.to_string()))
    }

    async fn command_output(&self, command_id: &str) -> Result<String, VmError> {
        Err(VmError::Unconfigured(command_id.to_string()))
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<(), VmError> {
        Err(VmError::Unconfigured(instance_id.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Scripted executor for Verifier tests: becomes "running" after a set
    /// number of polls and replays a fixed status sequence for the command.
    pub struct FakeVmExecutor {
        running_after_polls: u32,
        polls: AtomicU32,
        statuses: Mutex<VecDeque<VmCommandStatus>>,
        stdout: String,
        pub started: AtomicBool,
        pub stopped: AtomicBool,
    }

    impl FakeVmExecutor {
        pub fn new(
            running_after_polls: u32,
            statuses: Vec<VmCommandStatus>,
            stdout: impl Into<String>,
        ) -> Self {
            Self {
                running_after_polls,
                polls: AtomicU32::new(0),
                statuses: Mutex::new(statuses.into()),
                stdout: stdout.into(),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl VmExecutor for FakeVmExecutor {
        async fn start_instance(&self, _instance_id: &str) -> Result<(), VmError> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn is_running(&self, _instance_id: &str) -> Result<bool, VmError> {
            let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(polls >= self.running_after_polls)
        }

        async fn run_command(&self, _instance_id: &str, _command: &str) -> Result<String, VmError> {
            Ok("cmd-1".to_string())
        }

        async fn command_status(&self, _command_id: &str) -> Result<VmCommandStatus, VmError> {
            let mut statuses = self.statuses.lock().expect("status script poisoned");
            Ok(statuses.pop_front().unwrap_or(VmCommandStatus::Success))
        }

        async fn command_output(&self, _command_id: &str) -> Result<String, VmError> {
            Ok(self.stdout.clone())
        }

        async fn stop_instance(&self, _instance_id: &str) -> Result<(), VmError> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }
}
