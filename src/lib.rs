#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod context;
pub mod coordinator;
pub mod entity;
pub mod error;
pub mod hooks;
pub mod leases;
pub mod prelude;
pub mod request;
pub mod safety;
pub mod store;
pub mod util;

pub mod test_utils;

pub use config::{Config, LeaseConfig, SafetyConfig};
pub use context::{Environment, RequestInfo, RequestKind, TransactionId};
pub use coordinator::Coordinator;
pub use error::{Error, Result};
pub use request::{RequestContext, TransactionGuard};
