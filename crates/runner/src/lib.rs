//! edharness runner
//!
//! Per-worker orchestration around a batch-mode editor: project copies,
//! executable resolution, port registration, instance lifecycle and the
//! between-test state resync.

pub mod config;
pub mod lifecycle;
pub mod provisioner;
pub mod registrar;
pub mod resolver;
pub mod resync;
pub mod session;

pub use config::HarnessConfig;
pub use lifecycle::{InstanceConfig, InstanceHandle, InstanceManager};
pub use provisioner::{ProjectLayout, ProjectProvisioner, ProvisionReport};
pub use registrar::{PortRegistrar, RegistrationOutcome};
pub use resolver::ExecutableResolver;
pub use resync::{FileBackups, ResyncOutcome, StateResyncManager};
pub use session::{bridge_rpc_config, CaseReport, SessionMode, SuiteReport, WorkerSession};
