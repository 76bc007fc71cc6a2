//! Testing utilities for the replicated cache.
//!
//! [`SimCluster`] runs several [`CacheNode`](crate::node::CacheNode)s in one
//! process over a shared simulated log and message bus. Leadership, the term
//! and replication faults are under the test's control.

mod sim;
mod utils;

mod cluster_tests;
mod failure_tests;

pub use sim::{Faults, SimBus, SimCluster, SimLog, SimNode};
pub use utils::{init_tracing, wait_for_result, wait_until};
