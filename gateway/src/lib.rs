//! # Siphon Storage Gateway
//!
//! The adapter between the task workers and the storage library: it executes
//! one copy or unlink per invocation and always hands back a structured
//! [`OpResult`], translating the library's known non-error codes, retrying
//! the one transient failure class (data-channel port binding), and capturing
//! the library's verbose log per invocation.
//!
//! Two backends bind the [`siphon_lib::StorageContext`] seam in-tree: a
//! local-filesystem backend serving development deployments and the test
//! suite, and a scripted mock for fault injection. Remote-protocol backends
//! implement the same trait out-of-tree.

mod adapter;
mod local;
mod mock;

// re-export
pub use adapter::{Gateway, MAX_PORT_BIND_ATTEMPTS};
pub use local::LocalBackend;
pub use mock::MockBackend;
