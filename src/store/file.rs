use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use crate::error::Result;
use crate::event::Event;
use crate::filter::{Filter, FilterDescriptor, Order};
use crate::store::{EventIter, EventStore};

pub const DEFAULT_BUCKET_WIDTH: i64 = 60;

/// ASCII record separator, bracketing the framing trailer's length field.
const RS: u8 = 0x1e;

#[derive(Debug, Clone)]
struct SegmentMeta {
    size: u64,
    last_write: SystemTime,
}

/// File-per-bucket append-only event store (spec §4.3).
///
/// One open write cursor per currently-active bucket, protected by a
/// mutex. Searches open their own read-only file handle and snapshot its
/// length at scan start, so a concurrent append is simply invisible to an
/// in-flight scan.
pub struct FileStore {
    dir: PathBuf,
    width: i64,
    index: RwLock<HashMap<i64, SegmentMeta>>,
    writers: Mutex<HashMap<i64, File>>,
}

impl FileStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_width(dir, DEFAULT_BUCKET_WIDTH)
    }

    /// Rebuilds the bucket index by listing `dir` and stat-ing each entry.
    /// Names that do not parse as integers are ignored.
    pub fn open_with_width(dir: impl AsRef<Path>, width: i64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut index = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            let bucket: i64 = match name.parse() {
                Ok(b) => b,
                Err(_) => continue,
            };
            let meta = entry.metadata()?;
            index.insert(
                bucket,
                SegmentMeta {
                    size: meta.len(),
                    last_write: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                },
            );
        }

        Ok(Self {
            dir,
            width,
            index: RwLock::new(index),
            writers: Mutex::new(HashMap::new()),
        })
    }

    pub fn bucket_for(&self, timestamp_secs: i64) -> i64 {
        timestamp_secs.div_euclid(self.width) * self.width
    }

    fn segment_path(&self, bucket: i64) -> PathBuf {
        self.dir.join(bucket.to_string())
    }

    /// Opens (or reuses) the write cursor for `bucket`. On first open,
    /// truncates any crash-torn tail record (spec S6) before appending.
    fn writer_for(&self, bucket: i64) -> Result<()> {
        let mut writers = self.writers.lock().unwrap();
        if writers.contains_key(&bucket) {
            return Ok(());
        }

        let path = self.segment_path(bucket);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let (_, valid_len) = scan_records(&bytes);
        if valid_len < bytes.len() {
            let detail = format!("truncated {} unparseable trailing bytes", bytes.len() - valid_len);
            eprintln!("{}", crate::error::Error::CorruptSegment { bucket, detail });
            file.set_len(valid_len as u64)?;
        }
        file.seek(SeekFrom::End(0))?;

        writers.insert(bucket, file);
        Ok(())
    }

    fn record_write(&self, bucket: i64, written: u64) {
        let mut index = self.index.write().unwrap();
        let entry = index.entry(bucket).or_insert(SegmentMeta {
            size: 0,
            last_write: SystemTime::now(),
        });
        entry.size += written;
        entry.last_write = SystemTime::now();
    }

    fn candidate_buckets(&self, start: Option<i64>, end: Option<i64>) -> Vec<i64> {
        let index = self.index.read().unwrap();
        let mut buckets: Vec<i64> = index
            .keys()
            .copied()
            .filter(|&b| bucket_intersects(b, self.width, start, end))
            .collect();
        buckets.sort_unstable();
        buckets
    }
}

fn bucket_intersects(bucket: i64, width: i64, start: Option<i64>, end: Option<i64>) -> bool {
    let bucket_end = bucket + width; // closed-open [bucket, bucket+width)
    if let Some(start) = start {
        if bucket_end <= start {
            return false;
        }
    }
    if let Some(end) = end {
        if bucket > end {
            return false;
        }
    }
    true
}

/// Forward-scans `bytes` for `<event><RS><len-ascii><RS>\n` records.
///
/// A record is accepted only when its declared length matches the bytes
/// since the previous accepted boundary, so an RS byte occurring inside
/// event content (a false positive) is skipped without derailing the scan.
/// Returns the accepted record spans (event byte ranges, append order) and
/// the byte length of the longest valid prefix — anything past that is a
/// crash-torn tail record and must be truncated by the caller.
fn scan_records(bytes: &[u8]) -> (Vec<(usize, usize)>, usize) {
    let mut records = Vec::new();
    let mut record_start = 0usize;
    let mut search_from = 0usize;

    while search_from < bytes.len() {
        let rel = match bytes[search_from..].iter().position(|&b| b == RS) {
            Some(r) => r,
            None => break,
        };
        let rs1 = search_from + rel;

        match try_parse_trailer(bytes, rs1, rs1 - record_start) {
            Some(trailer_end) => {
                records.push((record_start, rs1));
                record_start = trailer_end;
                search_from = trailer_end;
            }
            None => {
                search_from = rs1 + 1;
            }
        }
    }

    (records, record_start)
}

/// Try to parse a trailer starting at the RS byte `rs1`, verifying its
/// declared length equals `event_len` (distance since the last accepted
/// boundary). Returns the offset just past the trailer on success.
fn try_parse_trailer(bytes: &[u8], rs1: usize, event_len: usize) -> Option<usize> {
    let digits_start = rs1 + 1;
    let mut i = digits_start;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i == digits_start || i >= bytes.len() || bytes[i] != RS {
        return None;
    }
    let rs2 = i;
    if rs2 + 1 >= bytes.len() || bytes[rs2 + 1] != b'\n' {
        return None;
    }

    let digits = std::str::from_utf8(&bytes[digits_start..rs2]).ok()?;
    let declared_len: usize = digits.parse().ok()?;
    if declared_len != event_len {
        return None;
    }

    Some(rs2 + 2)
}

impl EventStore for FileStore {
    fn save(&self, event: &Event) -> Result<()> {
        let bucket = self.bucket_for(event.timestamp_secs());
        self.writer_for(bucket)?;

        let body = event.serialize();
        let trailer = format!("\x1e{}\x1e\n", body.len());

        let mut writers = self.writers.lock().unwrap();
        let file = writers.get_mut(&bucket).expect("writer_for just inserted it");
        file.write_all(&body)?;
        file.write_all(trailer.as_bytes())?;
        file.sync_data()?;
        let written = (body.len() + trailer.len()) as u64;
        drop(writers);

        self.record_write(bucket, written);
        Ok(())
    }

    fn search(&self, filter: &FilterDescriptor, cancelled: Arc<AtomicBool>) -> Result<EventIter> {
        let compiled = crate::filter::compile(filter)?;
        let mut buckets = self.candidate_buckets(filter.start, filter.end);
        if compiled.order() == Order::Desc {
            buckets.reverse();
        }

        Ok(Box::new(FileSearchIter {
            dir: self.dir.clone(),
            buckets: buckets.into(),
            order: compiled.order(),
            filter: compiled,
            cancelled,
            buffer: VecDeque::new(),
        }))
    }

    fn close(&self) -> Result<()> {
        let writers = self.writers.lock().unwrap();
        for file in writers.values() {
            file.sync_data()?;
        }
        Ok(())
    }
}

/// Incremental `/find` scan: one bucket open at a time, so an abandoned
/// scan releases its file handle instead of holding every bucket in memory
/// at once (spec §5). `cancelled` is checked before each new bucket is
/// opened, the bucket boundary being the only point this backend can
/// cheaply interrupt a scan at.
struct FileSearchIter {
    dir: PathBuf,
    buckets: VecDeque<i64>,
    order: Order,
    filter: Filter,
    cancelled: Arc<AtomicBool>,
    buffer: VecDeque<Event>,
}

impl FileSearchIter {
    /// Loads the next bucket's matching events into `buffer`. Returns
    /// `Err` on the first I/O or parse failure, after which the caller
    /// must stop (remaining buckets are dropped so the scan does not limp
    /// forward over possibly-corrupt state).
    fn load_next_bucket(&mut self) -> Result<bool> {
        while let Some(bucket) = self.buckets.pop_front() {
            if self.cancelled.load(Ordering::Relaxed) {
                self.buckets.clear();
                return Ok(false);
            }

            let path = self.dir.join(bucket.to_string());
            let mut file = match File::open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let len = file.metadata()?.len() as usize;
            let mut bytes = vec![0u8; len];
            file.read_exact(&mut bytes)?;
            drop(file); // release the handle before filtering/yielding

            let (records, _) = scan_records(&bytes);
            let mut bucket_events = Vec::with_capacity(records.len());
            for (start, end) in records {
                let event = Event::parse(&bytes[start..end])?;
                if self.filter.matches(&event) {
                    bucket_events.push(event);
                }
            }
            if self.order == Order::Desc {
                bucket_events.reverse();
            }
            if bucket_events.is_empty() {
                continue;
            }
            self.buffer.extend(bucket_events);
            return Ok(true);
        }
        Ok(false)
    }
}

impl Iterator for FileSearchIter {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(event) = self.buffer.pop_front() {
                return Some(Ok(event));
            }
            if self.buckets.is_empty() {
                return None;
            }
            match self.load_next_bucket() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => {
                    self.buckets.clear();
                    self.buffer.clear();
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn event(id: &str, ts: f64, tags: &[&str], content: &str) -> Event {
        Event {
            id: id.into(),
            timestamp: ts,
            source: "src".into(),
            tags: tags.iter().map(|s| s.to_string()).collect(),
            extras: Vec::new(),
            content: content.as_bytes().to_vec(),
        }
    }

    #[test]
    fn bucket_assignment_floors_to_width() {
        let dir = tempdir().unwrap();
        let store = FileStore::open_with_width(dir.path(), 60).unwrap();
        assert_eq!(store.bucket_for(125), 120);
        assert_eq!(store.bucket_for(120), 120);
        assert_eq!(store.bucket_for(0), 0);
    }

    #[test]
    fn save_then_search_roundtrip() {
        let dir = tempdir().unwrap();
        let store = FileStore::open_with_width(dir.path(), 60).unwrap();
        store.save(&event("a", 100.0, &["web"], "hello")).unwrap();
        store.save(&event("b", 200.0, &["web", "prod"], "world")).unwrap();
        store.save(&event("c", 300.0, &["db"], "x")).unwrap();

        let found: Vec<Event> = store
            .search(
                &FilterDescriptor {
                    tags: vec!["web.*".into()],
                    ..Default::default()
                },
                Arc::new(AtomicBool::new(false)),
            )
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(found.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn time_window_scan_s3() {
        let dir = tempdir().unwrap();
        let store = FileStore::open_with_width(dir.path(), 60).unwrap();
        store.save(&event("1", 100.0, &["web"], "")).unwrap();
        store.save(&event("2", 200.0, &["web", "prod"], "")).unwrap();
        store.save(&event("3", 300.0, &["db"], "")).unwrap();

        let found: Vec<Event> = store
            .search(
                &FilterDescriptor {
                    start: Some(150),
                    end: Some(250),
                    ..Default::default()
                },
                Arc::new(AtomicBool::new(false)),
            )
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "2");
    }

    #[test]
    fn desc_order_reverses_within_and_across_buckets() {
        let dir = tempdir().unwrap();
        let store = FileStore::open_with_width(dir.path(), 60).unwrap();
        store.save(&event("1", 10.0, &[], "")).unwrap();
        store.save(&event("2", 20.0, &[], "")).unwrap();
        store.save(&event("3", 80.0, &[], "")).unwrap();

        let found: Vec<Event> = store
            .search(
                &FilterDescriptor {
                    order: Order::Desc,
                    ..Default::default()
                },
                Arc::new(AtomicBool::new(false)),
            )
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(found.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), vec!["3", "2", "1"]);
    }

    #[test]
    fn bucket_scan_skips_disjoint_buckets() {
        let dir = tempdir().unwrap();
        let store = FileStore::open_with_width(dir.path(), 60).unwrap();
        store.save(&event("far-past", 0.0, &[], "")).unwrap();
        store.save(&event("in-range", 1000.0, &[], "")).unwrap();

        let found: Vec<Event> = store
            .search(
                &FilterDescriptor {
                    start: Some(990),
                    end: Some(1010),
                    ..Default::default()
                },
                Arc::new(AtomicBool::new(false)),
            )
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "in-range");
    }

    #[test]
    fn crash_recovery_truncates_torn_tail_s6() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open_with_width(dir.path(), 60).unwrap();
            for i in 0..5 {
                store
                    .save(&event(&format!("e{i}"), 10.0, &[], "body"))
                    .unwrap();
            }
        }

        // Simulate a crash mid-write: append a truncated trailer to the
        // segment for bucket 0.
        let path = dir.path().join("0");
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(b"garbage-event-bytes\x1e12").unwrap(); // no closing RS/\n
        }

        let store = FileStore::open_with_width(dir.path(), 60).unwrap();
        store.save(&event("new", 10.0, &[], "after-crash")).unwrap();

        let found: Vec<Event> = store
            .search(&FilterDescriptor::default(), Arc::new(AtomicBool::new(false)))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(found.len(), 6);
        assert!(found.iter().any(|e| e.id == "new"));
    }

    #[test]
    fn names_that_do_not_parse_as_integers_are_ignored() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("not-a-bucket.tmp"), b"ignored").unwrap();
        let store = FileStore::open_with_width(dir.path(), 60).unwrap();
        let found: Vec<Event> = store
            .search(&FilterDescriptor::default(), Arc::new(AtomicBool::new(false)))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn cancelled_flag_stops_scan_before_later_buckets() {
        let dir = tempdir().unwrap();
        let store = FileStore::open_with_width(dir.path(), 60).unwrap();
        store.save(&event("a", 0.0, &[], "")).unwrap();
        store.save(&event("b", 60.0, &[], "")).unwrap();
        store.save(&event("c", 120.0, &[], "")).unwrap();

        let cancelled = Arc::new(AtomicBool::new(true));
        let found: Vec<Event> = store
            .search(&FilterDescriptor::default(), cancelled)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert!(found.is_empty());
    }
}
