//! Tracks which Colab runtimes are assigned to the local user.
//!
//! The [`AssignmentManager`] is the only writer of the assignment set. It
//! talks to the Colab backend through an [`AssignmentClient`], persists
//! through a [`ServerStorage`], and broadcasts an
//! [`AssignmentChangeEvent`](colab_core::AssignmentChangeEvent) after every
//! mutation. [`KeepAlive`] keeps connections fresh in the background.

pub mod api;
pub mod error;
pub mod keepalive;
pub mod manager;
pub mod storage;

pub use api::{
    AssignResponse, AssignmentClient, CcuInfo, ColabApiClient, RemoteAssignment, RuntimeProxyInfo,
    notebook_hash, strip_xssi_prefix,
};
pub use error::{AssignmentError, AssignmentResult};
pub use keepalive::{KeepAlive, KeepAliveCommand, KeepAliveConfig, KeepAliveHandle, KeepAliveState};
pub use manager::{AssignmentManager, LogNotifier, Notifier};
pub use storage::{FileServerStorage, MemoryServerStorage, ServerStorage};
