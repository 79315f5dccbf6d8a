mod settings;

pub use settings::{AuditConfig, ExecutionConfig, ExecutionMode};
