//! # mitm-server — Serving side of named services
//!
//! Everything here is a [`Waitable`](mitm_core::Waitable) driven by the
//! waitable manager:
//!
//! - `session` - `ServiceSession`, one connection and its `Service`
//! - `server` - `ServiceServer`, a listening port for a real service
//! - `mitm` - `MitmRegistration` / `MitmServer`, interception of a name
//! - `query` - `MitmQuerySession`, answers the broker's interception query

pub mod session;
pub mod server;
pub mod mitm;
pub mod query;

pub use session::ServiceSession;
pub use server::ServiceServer;
pub use mitm::{MitmRegistration, MitmServer, RegistrationState, RegistrationStatus};
pub use query::MitmQuerySession;
