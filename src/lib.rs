pub mod audit;
pub mod config;
pub mod events;
pub mod expression;
pub mod models;
pub mod orchestrator;
pub mod process;
pub mod target;

// Re-export main types
pub use audit::{AuditContext, AuditError, AuditLifecycle, Checker, CheckerRegistry, Prepared};
pub use config::{AuditConfig, ExecutionConfig, ExecutionMode};
pub use events::{EventDispatcher, NullEvents, TracingEvents};
pub use expression::{ExpressionEngine, MiniJinjaEngine};
pub use models::{
    AuditResponse, Dependency, DependencyBehaviour, IntegrityError, Outcome, Policy, Profile,
    Report, ReportType, Severity, State, classify,
};
pub use orchestrator::{BatchLauncher, ReportBuilder, ReportHandle, ReportRun, WorkerLauncher};
pub use process::{CommandProcess, Process, ProcessManager, ProcessOutput};
pub use target::{LocalTarget, Target};
