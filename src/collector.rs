use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::broker::{Broker, LiveHandle};
use crate::error::Result;
use crate::event::Event;
use crate::filter::{compile, FilterDescriptor};
use crate::store::{EventIter, EventStore};

/// Coordinates the store, the broker, and the codec on behalf of the three
/// channel handlers in `theia-server` (spec §4.5). Created once at startup
/// and shared behind an `Arc` across every connection task.
pub struct Collector {
    store: Arc<dyn EventStore>,
    broker: Arc<Broker>,
}

impl Collector {
    pub fn new(store: Arc<dyn EventStore>, broker: Arc<Broker>) -> Self {
        Self { store, broker }
    }

    /// `/event`: parse, assign a receive timestamp only if missing, persist,
    /// then fan out to live subscribers. The caller is responsible for
    /// logging `ParseError`s and keeping the channel open past them (spec §7).
    pub fn ingest(&self, bytes: &[u8]) -> Result<()> {
        let mut event = Event::parse(bytes)?;
        if !has_timestamp_header(bytes) {
            event.timestamp = now_fractional_secs();
        }
        self.store.save(&event)?;
        self.broker.dispatch(&event);
        Ok(())
    }

    /// `/find`: compile the filter (surfacing `CompileError` to the caller,
    /// which closes the channel per spec §4.5) then stream historical
    /// matches from the store. `cancelled` is the caller's handle to abort
    /// an in-flight scan early (spec §5); the returned iterator must be
    /// dropped (not merely stopped being polled) for that to take effect
    /// promptly, since the flag is only checked from inside `next`.
    pub fn find(&self, descriptor: &FilterDescriptor, cancelled: Arc<AtomicBool>) -> Result<EventIter> {
        compile(descriptor)?;
        self.store.search(descriptor, cancelled)
    }

    /// `/live`: compile the filter and register a subscription with the
    /// broker.
    pub fn subscribe(&self, descriptor: &FilterDescriptor, buffer: usize) -> Result<LiveHandle> {
        let filter = compile(descriptor)?;
        Ok(self.broker.subscribe(filter, buffer))
    }

    pub fn unsubscribe(&self, id: crate::broker::SubscriberId) {
        self.broker.unsubscribe(id);
    }

    pub fn close(&self) -> Result<()> {
        self.store.close()
    }
}

/// A parsed event always carries a `timestamp` field (it is required by
/// `Event::parse`); "lacks one" in spec §9 means the producer's wire bytes
/// never had a `timestamp:` header. Check the raw bytes rather than the
/// parsed value so a producer-supplied `0` is never mistaken for "missing".
fn has_timestamp_header(bytes: &[u8]) -> bool {
    for line in bytes.split(|&b| b == b'\n') {
        match line.iter().position(|&b| b == b':') {
            Some(colon) if &line[..colon] == b"timestamp" => return true,
            Some(_) => continue,
            None => return false, // reached content before finding one
        }
    }
    false
}

fn now_fractional_secs() -> f64 {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    now.as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::file::FileStore;
    use std::time::Duration;
    use tempfile::tempdir;

    fn collector() -> (Collector, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store: Arc<dyn EventStore> = Arc::new(FileStore::open(dir.path()).unwrap());
        let broker = Arc::new(Broker::new(Duration::from_secs(5)));
        (Collector::new(store, broker), dir)
    }

    #[test]
    fn ingest_and_find_roundtrip() {
        let (c, _dir) = collector();
        c.ingest(b"id:a\ntimestamp:10\nsource:s\ntags:\nhello").unwrap();
        let found: Vec<Event> = c
            .find(&FilterDescriptor::default(), Arc::new(AtomicBool::new(false)))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "a");
    }

    #[test]
    fn missing_timestamp_gets_server_assigned_value() {
        let (c, _dir) = collector();
        c.ingest(b"id:a\nsource:s\ntags:\nhello").unwrap();
        let found: Vec<Event> = c
            .find(&FilterDescriptor::default(), Arc::new(AtomicBool::new(false)))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].timestamp > 0.0);
    }

    #[test]
    fn producer_supplied_zero_timestamp_is_authoritative() {
        let (c, _dir) = collector();
        c.ingest(b"id:a\ntimestamp:0\nsource:s\ntags:\nhello").unwrap();
        let found: Vec<Event> = c
            .find(&FilterDescriptor::default(), Arc::new(AtomicBool::new(false)))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(found[0].timestamp, 0.0);
    }

    #[test]
    fn parse_error_on_ingest_does_not_panic() {
        let (c, _dir) = collector();
        assert!(c.ingest(b"").is_err());
    }

    #[test]
    fn find_honors_a_pre_cancelled_token() {
        let (c, _dir) = collector();
        c.ingest(b"id:a\ntimestamp:10\nsource:s\ntags:\nhello").unwrap();
        let cancelled = Arc::new(AtomicBool::new(true));
        let found: Vec<Event> = c.find(&FilterDescriptor::default(), cancelled).unwrap().collect::<Result<_>>().unwrap();
        assert!(found.is_empty());
    }
}
