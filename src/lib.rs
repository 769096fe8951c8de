//! UPnP 1.0/1.1 control point core: SSDP discovery and GENA eventing.
//!
//! This crate is the discovery and eventing substrate of a control point.
//! The [`ssdp`] module owns per-interface multicast sockets, receive loops,
//! and message parsing; the [`gena`] module owns event subscriptions, lease
//! renewal, and the NOTIFY callback listener. Description parsing, SOAP
//! action invocation, and device models belong to higher layers that
//! consume the events surfaced here.
//!
//! Everything runs on plain OS threads managed by [`task::TaskExecutors`]:
//! one dedicated thread per receive loop, a bounded pool for sends, and a
//! single FIFO worker for user callbacks.

mod errors;

pub mod gena;
pub mod http;
pub mod net;
pub mod ssdp;
pub mod task;

pub use errors::UpnpError;
