//! Leader redirection, inbound dispatch and membership.

pub mod bus;
pub mod dispatch;
pub mod events;
pub mod membership;
pub mod router;

pub use bus::{InboundHandler, Leader, LocalBus, MessageBus};
pub use dispatch::InboundDispatcher;
pub use events::{LoggingEventListener, MemberEvent, MemberEventListener};
pub use membership::{MemberList, MembershipHandler};
pub use router::{RoutedRecord, Router};

use crate::error::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Hands a change to the current leader when this node is not it.
#[async_trait]
pub trait Redirector<R: Sync>: Send + Sync {
    /// Returns `true` if a remote leader accepted the change, `false` if this
    /// node is the leader and must apply it itself.
    async fn redirect(&self, record: &R, cancel: &CancellationToken) -> Result<bool>;
}

/// Where the first attempt of a change runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Ask the redirector first.
    Redirect,
    /// Apply on this node; the caller already knows it is the leader.
    Local,
}
