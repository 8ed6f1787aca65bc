//! Event-driven notifications for the remediation pipeline
//!
//! The engine publishes typed events; dashboards, log sinks and the
//! tracker sync subscribe and drain independently.
//!
//! # Event Flow
//!
//! ```text
//! ┌──────────────┐     ┌──────────────────┐     ┌──────────────┐
//! │  Dispatcher  │────▶│ EventBroadcaster │────▶│  Subscribers │
//! │  Breakers    │     │ (bounded, drops  │     │   (recv)     │
//! │  Registry    │     │  oldest on lag)  │     │              │
//! └──────────────┘     └──────────────────┘     └──────────────┘
//! ```
//!
//! Three event types are emitted: `ticket_update` on every context
//! transition, `agent_status` on breaker changes and stage toggles, and
//! `system_alert` for escalations, isolations and frozen contexts.
//!
//! # Usage
//!
//! ```ignore
//! use orchestration::events::{EventBroadcaster, EventBusExt, EventFilter};
//!
//! let bus = EventBroadcaster::new().shared();
//! let mut alerts = bus.subscribe_filtered(EventFilter::new().types(vec!["system_alert"]));
//!
//! while let Ok(event) = alerts.recv().await {
//!     println!("{}", serde_json::to_string(&event)?);
//! }
//! ```

pub mod bus;
pub mod types;

// Re-export core types
pub use bus::{
    EventBroadcaster, EventBusError, EventBusExt, EventBusResult, EventFilter, EventSubscriber,
    SharedEventBroadcaster, DEFAULT_CHANNEL_CAPACITY,
};
pub use types::{AlertSeverity, PipelineEvent};
