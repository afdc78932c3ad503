//! Core types: server descriptors, assignments, change events, tracing

pub mod assignment;
pub mod fs;
pub mod server;
pub mod tracing;

pub use assignment::{
    AssignmentChangeEvent, CLIENT_AGENT_HEADER, ColabAssignedServer, ConnectionInformation,
    RUNTIME_PROXY_TOKEN_HEADER, RemovedServer, proxy_headers,
};
pub use fs::{remove_if_exists, write_private_atomic};
pub use server::{ColabServerDescriptor, UnknownVariant, Variant, default_server, server_catalog};
pub use tracing::{TracingConfig, TracingError, TracingOutputFormat, init_tracing};
