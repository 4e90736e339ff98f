//! # mitm-broker — In-process service broker
//!
//! Plays the role of the system's central service manager: services
//! register named [`Port`]s, clients open sessions by name, and a MitM
//! registration can take over a name for clients its query endpoint
//! approves.
//!
//! - `port` - bounded accept queue with a pollable readiness fd
//! - `client` - client half of a session, and the forwarding capability
//! - `broker` - `ServiceManager`, name registry and interception routing
//! - `config` - `BrokerConfig`
//! - `error` - `ConnectError`

pub mod config;
pub mod error;
pub mod port;
pub mod client;
pub mod broker;

pub use config::BrokerConfig;
pub use error::ConnectError;
pub use port::{PendingSession, Port, SessionGuard};
pub use client::{ForwardHandle, ServiceClient};
pub use broker::{MitmEndpoints, ServiceManager};
