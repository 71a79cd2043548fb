//! Child process management: raw launching and the restart state machine.

pub mod launcher;
pub mod supervisor;

pub use launcher::{ExitInfo, KillSignal, LaunchSpec, OutputLine, OutputStream, ProcessHandle};
pub use supervisor::{
    BackoffPolicy, Phase, ProcessSupervisor, ServiceSpec, SupervisorEvent, SupervisorStatus,
};
