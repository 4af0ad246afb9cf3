//! # Integration Event Dispatch
//!
//! Registry of per-event-type handlers and the dispatcher that invokes
//! them for consumed envelopes.

pub mod dispatcher;
pub mod registry;
pub mod result;

pub use dispatcher::IntegrationEventDispatcher;
pub use registry::{IntegrationEventHandler, IntegrationEventRegistry, TypedEventHandler};
pub use result::IntegrationEventHandlingResult;
