//! # mitm-core — Types and traits for the MitM service layer
//!
//! Every other crate in the workspace talks in terms of this one:
//!
//! - `waitable` - the `Waitable` handle abstraction driven by the manager
//! - `service` - the pluggable `Service` / `ServiceFactory` capability set
//! - `message` - request/reply framing on a session stream
//! - `query` - the broker's "should this client be intercepted" exchange
//! - `result` - packed module/description result codes
//! - `error` - error taxonomy shared by broker, runtime and server
//! - `id` - process, program, waitable and service-name identifiers
//! - `kprint` - leveled stderr logging macros
//! - `env` - environment variable helpers for configuration
//!
//! No concrete policy lives here. The core depends on the traits,
//! redirection policies implement them.

pub mod id;
pub mod result;
pub mod message;
pub mod query;
pub mod error;
pub mod waitable;
pub mod service;
pub mod kprint;
pub mod env;

pub use id::{ClientInfo, ProcessId, ProgramId, ServiceName, WaitableId};
pub use result::ResultCode;
pub use message::{CommandId, Reply, Request, RequestBuffer};
pub use error::{
    FrameError, NameError, ProtocolError, QueryError, RegistrationError, ServiceInitError,
    TransportError, WorkerClosedError,
};
pub use waitable::{HandleOutcome, Waitable, WaitableKind, WaitableSink};
pub use service::{
    ConnectionInfo, Forward, Handler, HandlerResult, RequestContext, Response, Service,
    ServiceFactory,
};
pub use env::{env_get, env_get_bool, env_get_ms, env_get_opt};
