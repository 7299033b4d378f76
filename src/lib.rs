pub mod broker;
pub mod collector;
pub mod error;
pub mod event;
pub mod filter;
pub mod store;

pub use broker::Broker;
pub use collector::Collector;
pub use error::{Error, Result};
pub use event::Event;
pub use filter::{compile, Filter, FilterDescriptor, Order};
pub use store::{EventIter, EventStore};
