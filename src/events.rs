use serde_json::Value;
use tracing::debug;

/// Emitted after every policy audit, whatever the outcome.
pub const EVENT_AUDIT_RESPONSE: &str = "audit.response";
/// Emitted when a report phase starts or finishes.
pub const EVENT_REPORT_PHASE: &str = "report.phase";

/// Fire-and-forget observer hook.
pub trait EventDispatcher: Send + Sync {
    fn dispatch(&self, event: &str, payload: &Value);
}

/// Records events as debug-level tracing output.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEvents;

impl EventDispatcher for TracingEvents {
    fn dispatch(&self, event: &str, payload: &Value) {
        debug!(target: "policy_audit::events", event, %payload, "event dispatched");
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEvents;

impl EventDispatcher for NullEvents {
    fn dispatch(&self, _event: &str, _payload: &Value) {}
}
