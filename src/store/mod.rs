pub mod file;
pub mod relational;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::error::Result;
use crate::event::Event;
use crate::filter::FilterDescriptor;

/// An owned, lazy sequence of historical events. Backends build this from
/// whatever they need (open file handles, a query cursor); it must not
/// borrow from the `EventStore` call that produced it.
pub type EventIter = Box<dyn Iterator<Item = Result<Event>> + Send>;

/// The durable append-only event store contract (spec §4.3).
///
/// Implementations must make `save` durable before returning success, must
/// not block `search` on events that arrive after the scan begins, and must
/// release all resources on `close`.
///
/// `search` must scan incrementally rather than materialize its full result
/// up front, and must observe `cancelled` within a bounded number of events
/// — checked at least once per bucket boundary for the file backend, once
/// per page for the relational backend (spec §5) — so an abandoned scan
/// stops promptly and releases its file handles/cursors instead of running
/// to completion regardless of the caller's continued interest.
pub trait EventStore: Send + Sync {
    fn save(&self, event: &Event) -> Result<()>;
    fn search(&self, filter: &FilterDescriptor, cancelled: Arc<AtomicBool>) -> Result<EventIter>;
    fn close(&self) -> Result<()>;
}
