//! Reconciliation engine for storage-declared resources
//!
//! Keeps resources declared in a durable store ("storage") synchronized with
//! their materialized counterparts in an orchestration runtime ("runtime"):
//!
//! - **Entity contracts** ([`entity`]): what every resource kind exposes
//! - **Runtime adapter** ([`adapter`]): listing both sides, push-update subscription
//! - **Worker** ([`worker`]): periodic diff plus push-triggered status propagation
//! - **Supervisor** ([`supervisor`]): runs workers fail-fast
//! - **In-process adapter** ([`memory`]): reference implementation of the contracts
//!
//! The engine never inspects a concrete resource kind; it is polymorphic over
//! [`StorageEntity`] and [`RuntimeEntity`].

#![deny(missing_docs)]

pub mod adapter;
pub mod entity;
pub mod memory;
pub mod supervisor;
pub mod worker;

pub use adapter::{RuntimeAdapter, RuntimeUpdate, UpdateSink};
pub use entity::{Fingerprint, RuntimeEntity, StorageEntity};
pub use supervisor::{Runnable, Supervisor};
pub use worker::{SyncPlan, SyncReport, Worker};
