//! Resource and session reconciliation engine for interactive desktop
//! sessions on a shared compute cluster.
//!
//! Nothing here persists a durable record of "what session exists and how
//! to reach it". Every invocation rebuilds that view live by joining three
//! independent sources: the batch scheduler's queue, the local set of
//! active SSH tunnels, and per-node liveness probes. The components layer
//! on top of that join: allocation lifecycle ([`alloc`]), remote display
//! sessions ([`session`]), tunnel management ([`forward`]), the live-state
//! join itself ([`discover`]), and idempotent teardown ([`gc`]).

pub mod alloc;
pub mod config;
pub mod discover;
pub mod error;
pub mod forward;
pub mod gc;
pub mod parse;
pub mod session;
pub mod store;
pub mod types;

pub use alloc::{Allocation, AllocationManager, ResourceRequest};
pub use config::Config;
pub use discover::{CorrelatedEntry, CorrelatedView, DiscoveryCorrelator};
pub use error::{Result, VdeskError};
pub use forward::{Forward, PortForwardManager};
pub use gc::GarbageCollector;
pub use session::{Session, SessionController};
pub use store::{FileSessionStore, SessionStore};
pub use types::{DisplayNum, JobId, NodeName, Pid, Port};
