//! Metrics and observability infrastructure.
//!
//! - `events`: internal event types and the `InternalEvent` trait
//! - `server`: Prometheus recorder and HTTP endpoint

pub mod events;
pub mod server;

pub use server::{DEFAULT_METRICS_ADDR, init, render};

/// Emit a metric event (Vector-style pattern).
///
/// ```ignore
/// use snowdrift_core::metrics::events::RecordsDecoded;
///
/// emit!(RecordsDecoded { count: 100, target: "inventory".into() });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}

pub use emit;
