//! The Agent Conversation Fabric core.
//!
//! Turns an asynchronous stream of inbound messages into ordered,
//! at-most-one-in-flight logical turns per session, drives the cognitive
//! pipeline across them, coordinates supersede against irreversible side
//! effects, and fans events out to audit, metrics, live streams, and
//! signed tenant webhooks.

pub mod audit;
pub mod config_store;
pub mod delivery;
pub mod dispatcher;
pub mod ingress;
pub mod metrics;
pub mod pipeline;
pub mod router;
pub mod scheduler;
pub mod signature;
pub mod toolbox;

pub use audit::{AuditStore, LocalAuditStore};
pub use config_store::{ConfigStore, MemoryConfigStore};
pub use delivery::{DeliveryRunner, DeliveryStore};
pub use dispatcher::{SubscriptionStore, WebhookDispatcher};
pub use ingress::{Ingress, SubmitReceipt};
pub use metrics::MetricsSink;
pub use pipeline::{
    CognitivePipeline, EchoPipeline, ResponseSink, TracingResponseSink, TurnContext,
};
pub use router::EventRouter;
pub use scheduler::{FabricCore, TurnScheduler};
pub use toolbox::{ToolExecutor, ToolRegistration, ToolResult, Toolbox, ToolboxHandle};
