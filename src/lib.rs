#![deny(missing_docs)]
//! Per-node resource manager for a tablet server.
//!
//! This crate multiplexes one server's CPU, memory, file-descriptor, and
//! block-cache budgets across the many tablets it hosts:
//! - A memory controller ingests throttled per-tablet usage reports,
//!   triggers minor compactions through a pluggable policy, and asserts
//!   back-pressure on writers when aggregate usage nears the ceiling.
//! - A typed pool dispatcher routes each background activity (compactions,
//!   splits, migrations, assignments, read-ahead) to its bounded worker
//!   pool, with dedicated pools for system-critical metadata tablets and
//!   inline execution for the root tablet.
//! - Per-tablet [`TabletResources`] handles throttle report publication on
//!   the write-hot path and adjudicate major compactions.
//!
//! The manager decides *when* and *where* work runs; it never touches
//! tablet bytes.

pub mod cache;
mod controller;
pub mod error;
pub mod extent;
pub mod files;
pub mod handle;
mod hold;
pub mod manager;
mod observability;
pub mod option;
pub mod policy;
mod pool;
pub mod report;
pub mod strategy;
pub mod tablet;
#[cfg(test)]
mod test_util;
pub mod time;

pub use crate::{
    error::ResourceError,
    extent::{TabletId, TabletKind},
    handle::TabletResources,
    manager::{ResourceManager, ResourceManagerBuilder},
    option::{ConfigSource, ServerOption, TableOption},
    report::TabletReport,
    tablet::{MajorCompactionReason, MinorCompactionReason, Tablet},
};
