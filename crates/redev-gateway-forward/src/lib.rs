//! Outbound side of the gateway: the HTTP transport to the backend of record
//! and an in-memory stand-in that answers the same routes.

#![forbid(unsafe_code)]

mod config;
mod http;
mod multipart;
mod simulated;

pub use config::{BackendConfig, ConfigError, DEFAULT_TIMEOUT_MS};
pub use http::{UreqTransport, MAX_REPLY_BYTES};
pub use multipart::{encode_multipart, EncodedMultipart};
pub use simulated::SimulatedBackend;
