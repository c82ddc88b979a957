use crate::event::QueryEvent;
use crate::storage::Storage;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// Queue capacity per producer shard. A full shard drops the event and
/// counts it; worker memory stays bounded when the recorder falls behind.
const SHARD_CAPACITY: usize = 512;

/// How many events the recorder batches before flushing to storage;
/// batching amortises the flush cost.
const BATCH_SIZE: usize = 1000;

#[derive(Debug, Default, Clone)]
pub struct RecorderStats {
    pub events: u64,
    pub dropped: u64,
    pub bytes: u64,
}

/// Multi-producer single-consumer collector: every routing worker feeds a
/// shard that a dedicated recorder thread drains into the storage backend.
pub struct Recorder {
    shards: Vec<SyncSender<QueryEvent>>,
    events: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    bytes: Arc<AtomicU64>,
    expired: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    thread: std::sync::Mutex<Option<std::thread::JoinHandle<()>>>,
}

/// Limits that end a capture when exceeded; zero disables the limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureLimits {
    pub max_duration: Duration,
    pub max_bytes: u64,
}

impl Recorder {
    pub fn start(
        storage: Box<dyn Storage>,
        shard_count: usize,
        limits: CaptureLimits,
    ) -> Arc<Recorder> {
        let shard_count = shard_count.max(1);
        let mut senders = Vec::with_capacity(shard_count);
        let mut receivers = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            let (tx, rx) = sync_channel(SHARD_CAPACITY);
            senders.push(tx);
            receivers.push(rx);
        }
        let recorder = Arc::new(Recorder {
            shards: senders,
            events: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            bytes: Arc::new(AtomicU64::new(0)),
            expired: Arc::new(AtomicBool::new(false)),
            stopping: Arc::new(AtomicBool::new(false)),
            thread: std::sync::Mutex::new(None),
        });

        let events = Arc::clone(&recorder.events);
        let bytes = Arc::clone(&recorder.bytes);
        let expired = Arc::clone(&recorder.expired);
        let stopping = Arc::clone(&recorder.stopping);
        let thread = std::thread::Builder::new()
            .name("wcar-recorder".to_string())
            .spawn(move || {
                drain_loop(storage, receivers, limits, events, bytes, expired, stopping);
            })
            .expect("spawning the recorder thread cannot fail");
        *recorder.thread.lock().unwrap() = Some(thread);
        recorder
    }

    /// Enqueue one event from whatever thread captured it. Returns false
    /// if the event was dropped.
    pub fn send(&self, event: QueryEvent) -> bool {
        if self.expired.load(Ordering::Relaxed) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let shard = shard_for_current_thread(self.shards.len());
        match self.shards[shard].try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// True once a capture limit has been exceeded; the command layer
    /// observes this and finalizes the capture.
    pub fn expired(&self) -> bool {
        self.expired.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> RecorderStats {
        RecorderStats {
            events: self.events.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }

    /// Drain the queues and join the recorder thread. The storage is
    /// flushed and dropped by the thread.
    pub fn stop(&self) -> RecorderStats {
        self.stopping.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
        let stats = self.stats();
        if stats.dropped > 0 {
            warn!(
                "capture dropped {} events (recorder backpressure)",
                stats.dropped
            );
        }
        stats
    }
}

fn shard_for_current_thread(shard_count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    (hasher.finish() % shard_count as u64) as usize
}

#[allow(clippy::too_many_arguments)]
fn drain_loop(
    mut storage: Box<dyn Storage>,
    receivers: Vec<Receiver<QueryEvent>>,
    limits: CaptureLimits,
    events: Arc<AtomicU64>,
    bytes: Arc<AtomicU64>,
    expired: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
) {
    let started = Instant::now();
    let mut batch: Vec<QueryEvent> = Vec::with_capacity(BATCH_SIZE);
    loop {
        let mut drained = 0usize;
        for receiver in &receivers {
            while let Ok(event) = receiver.try_recv() {
                batch.push(event);
                drained += 1;
                if batch.len() >= BATCH_SIZE {
                    flush(&mut storage, &mut batch, &events, &bytes);
                }
            }
        }
        if !batch.is_empty() {
            flush(&mut storage, &mut batch, &events, &bytes);
        }

        if !expired.load(Ordering::Relaxed) {
            let over_duration = limits.max_duration > Duration::ZERO
                && started.elapsed() >= limits.max_duration;
            let over_size =
                limits.max_bytes > 0 && storage.bytes_written() >= limits.max_bytes;
            if over_duration || over_size {
                warn!("capture limit reached, no further events will be recorded");
                expired.store(true, Ordering::Relaxed);
            }
        }

        if drained == 0 {
            if stopping.load(Ordering::SeqCst) {
                break;
            }
            std::thread::park_timeout(Duration::from_millis(1));
        }
    }
    if let Err(e) = storage.sync() {
        error!("capture storage flush failed: {e}");
    }
}

fn flush(
    storage: &mut Box<dyn Storage>,
    batch: &mut Vec<QueryEvent>,
    events: &AtomicU64,
    bytes: &AtomicU64,
) {
    let count = batch.len() as u64;
    if let Err(e) = storage.add_query_events(std::mem::take(batch)) {
        error!("capture storage write failed: {e}");
        return;
    }
    if let Err(e) = storage.sync() {
        error!("capture storage flush failed: {e}");
    }
    events.fetch_add(count, Ordering::Relaxed);
    bytes.store(storage.bytes_written(), Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::archive::{AccessMode, CaptureStorage};
    use std::sync::Arc as StdArc;

    fn query_event(event_id: i64, sql: &str) -> QueryEvent {
        let (canonical, args) = crate::canonical::canonicalize(sql);
        QueryEvent {
            canonical: StdArc::new(canonical),
            args,
            event_id,
            session_id: 1,
            start_time: event_id * 10,
            end_time: event_id * 10 + 5,
            ..QueryEvent::default()
        }
    }

    #[test]
    fn events_flow_through_to_storage() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("cap");
        let storage = CaptureStorage::open(&base, AccessMode::WriteOnly).unwrap();
        let recorder = Recorder::start(Box::new(storage), 4, CaptureLimits::default());

        for i in 1..=100 {
            assert!(recorder.send(query_event(i, "SELECT * FROM t WHERE id=1")));
        }
        let stats = recorder.stop();
        assert_eq!(stats.events, 100);
        assert_eq!(stats.dropped, 0);

        let mut storage = CaptureStorage::open(&base, AccessMode::ReadOnly).unwrap();
        let mut count = 0;
        while let Some(_event) = storage.next_event().unwrap() {
            count += 1;
        }
        assert_eq!(count, 100);
        assert_eq!(storage.canonical_count(), 1);
    }

    #[test]
    fn size_limit_expires_the_capture() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("cap");
        let storage = CaptureStorage::open(&base, AccessMode::WriteOnly).unwrap();
        let recorder = Recorder::start(
            Box::new(storage),
            1,
            CaptureLimits {
                max_bytes: 64,
                ..CaptureLimits::default()
            },
        );
        for i in 1..=50 {
            recorder.send(query_event(i, "SELECT * FROM t WHERE id=123456789"));
            if recorder.expired() {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(recorder.expired());
        recorder.stop();
    }
}
