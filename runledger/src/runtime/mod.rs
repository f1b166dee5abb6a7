/// Runtime builder wiring every service from one configuration.
pub mod builder;
/// OS process probing and termination.
pub mod process;
/// Interrupt-driven drain.
pub mod shutdown;
/// Background liveness sweep.
pub mod supervisor;

pub use builder::{LedgerRuntime, LedgerRuntimeBuilder};
pub use process::{
    group_alive, pid_exists, terminate_group, OsProbe, ProcessProbe, ProcessRegistry, Termination,
    TrackedProcess,
};
pub use shutdown::{
    AuxiliaryService, Confirmation, DrainReport, ShutdownCoordinator, ShutdownOutcome,
    ShutdownSnapshot, StdinConfirmation,
};
pub use supervisor::{
    DeadReason, Liveness, LivenessRules, ProcessSupervisor, ShutdownToken, SweepReport,
};
