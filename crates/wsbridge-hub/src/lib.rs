//! wsbridge hub: connection registry and event dispatch.
//!
//! The hub owns the state that transport callbacks mutate from many threads:
//! the set of live connections and the set of subscribed listeners. Facades
//! translate raw transport callbacks into `Event`s and fan them out; addressed
//! and broadcast operations route back through the registry.

pub mod client;
pub mod listener;
pub mod registry;
pub mod server;

pub use client::ClientFacade;
pub use listener::{DispatchReport, FnListener, Listener, ListenerFailure, ListenerId, ListenerResult, ListenerSet};
pub use registry::ConnectionRegistry;
pub use server::{BroadcastReport, ServerFacade};
