//! Merlin - distributed manager for Linux IPVS.
//!
//! Operators declare virtual services and their real-server pools in a
//! shared key-value store; every node runs this daemon, which continuously
//! reconciles the local kernel's IPVS tables toward the declared state and
//! exposes a gRPC surface for creating, mutating, listing and deleting the
//! declarations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    gRPC clients (merlin CLI)                    │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Service facade (server::grpc)                  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │        Repository: validation │ merge │ cascade │ encode        │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌───────────────────────────────┐   ┌─────────────────────────────┐
//! │   Store (etcd2/etcd3/memory)  │──▶│  Reconciler ──▶ kernel IPVS │
//! │        + change signals       │   │       (netlink driver)      │
//! └───────────────────────────────┘   └─────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! - [`types`] - wire types, validation and merge semantics
//! - [`store`] - key-value backends and change subscription
//! - [`repository`] - persisted-state operations and invariants
//! - [`ipvs`] - kernel adapter trait and generic-netlink driver
//! - [`reconciler`] - differential sync of kernel state
//! - [`server`] - RPC facade and tonic plumbing
//! - [`core`] - configuration, errors, runtime orchestration
//! - [`ops`] - health endpoints and metrics
//! - [`cli`] - daemon and client commands
//!
//! # Key Invariants
//!
//! - A real server exists only while its parent service exists; deleting
//!   the parent cascades.
//! - Service `(ip, port, protocol)` keys and per-service server
//!   `(ip, port)` keys are unique.
//! - Every persisted record passes create-time validation.
//! - After a reconcile pass over a stable store, the kernel tables equal
//!   the persisted records exactly.

// Core infrastructure
pub mod core;

// Data model
pub mod types;

// Storage layer
pub mod store;

// Persisted-state repository
pub mod repository;

// Kernel adapter
pub mod ipvs;

// Reconciliation
pub mod reconciler;

// RPC facade
pub mod server;

// Operations and observability
pub mod ops;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, runtime};
