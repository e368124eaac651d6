//! The `iw-registry` crate holds the pieces every other `iw` crate builds on:
//! the process-wide [`ServiceRegistry`] that tracks the operational [`State`]
//! of each long-running component, the [`Service`] trait those components
//! implement so they can be sequenced by the orchestrator, and the
//! [`Listeners`] map used for named event dispatch.
//!
//! There is no ambient global registry. A single [`ServiceContext`] is created
//! once per process (from inside a running actix system) and passed to every
//! component at construction. Each component registers itself and keeps the
//! returned [`ServiceHandle`] to report state changes.
//!
//! # Examples
//! ```rust,no_run
//! use iw_registry::{ServiceContext, State};
//!
//! #[actix::main]
//! async fn main() {
//!     let context = ServiceContext::init();
//!     let handle = context.register("udp-discovery", State::Inactive, None);
//!     handle.set_state(State::Ready, "discovering");
//!
//!     for entry in context.snapshot().await.unwrap_or_default() {
//!         log::info!("{} is {}", entry.service_type, entry.state);
//!     }
//!     context.teardown();
//! }
//! ```

mod events;
mod registry;
mod service;
mod state;

pub use events::{AwaitEvent, Event, Listener, Listeners, OnEvent};
pub use registry::{
    RegistryError, RegistryUpdate, ServiceContext, ServiceEntry, ServiceHandle, ServiceRegistry,
};
pub use service::{await_event, Service, ServiceError};
pub use state::State;
