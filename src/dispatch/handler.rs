//! Flag-gated code paths
//!
//! Gradient recording and tracing hook into dispatch as [`FlagHandler`]s. A
//! handler receives every request whose effective flags (merged flags minus
//! the thread's disable mask) intersect its own flag. It normally suppresses
//! that flag with a [`ScopedDisable`](super::ScopedDisable), re-enters
//! [`Dispatcher::apply`] to get the real results and then does its own
//! bookkeeping on them. A handler that re-enters without suppressing its flag
//! recurses forever.
//!
//! While compiled mode is on, traced requests skip the regular handlers and
//! go to the dispatcher's compiled handler, which replays a previously
//! recorded trace. It re-enters the same way, with TRACE suppressed.

use crate::{error::IngotResult, tensor::Flags};
use super::{ApplyContext, ApplyResult, Dispatcher};

pub trait FlagHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Bits that route a request to this handler
    fn flag(&self) -> Flags;

    fn apply(&self, dispatcher: &Dispatcher, ctx: &ApplyContext<'_>) -> IngotResult<ApplyResult>;
}
