use crate::storage::archive::{peek_sort_key, ArchiveReader, ArchiveWriter};
use crate::Result;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};

/// Events held in memory per sort chunk before spilling to disk.
const DEFAULT_CHUNK_SIZE: usize = 100_000;

/// Statistics of one sort pass, reported by the transform step.
#[derive(Debug, Default, Clone)]
pub struct SortReport {
    pub events: u64,
    pub chunks: u64,
}

/// External mergesort of an `.ex` file by (start_time, event_id): bounded
/// in-memory chunks are sorted and flushed to temporary files, then merged
/// k ways back over the original. Records move as opaque byte strings;
/// only the sort key is decoded.
pub struct QuerySort {
    chunk_size: usize,
}

impl Default for QuerySort {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl QuerySort {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(2),
        }
    }

    pub fn sort_file(&self, event_path: &Path) -> Result<SortReport> {
        let mut report = SortReport::default();
        let mut chunk_paths: Vec<PathBuf> = Vec::new();
        let mut chunk: Vec<((i64, i64), Vec<u8>)> = Vec::with_capacity(self.chunk_size);

        {
            let mut reader = ArchiveReader::open(event_path)?;
            while let Some(record) = reader.next_record()? {
                let key = peek_sort_key(&record, event_path)?;
                chunk.push((key, record));
                report.events += 1;
                if chunk.len() >= self.chunk_size {
                    chunk_paths.push(self.flush_chunk(event_path, &mut chunk, chunk_paths.len())?);
                }
            }
        }

        if chunk_paths.is_empty() {
            // Everything fit in memory; sort and rewrite in place.
            chunk.sort_by_key(|(key, _)| *key);
            let mut writer = ArchiveWriter::create(event_path)?;
            for (_, record) in &chunk {
                writer.append(record)?;
            }
            writer.sync()?;
            report.chunks = 1;
            return Ok(report);
        }

        if !chunk.is_empty() {
            chunk_paths.push(self.flush_chunk(event_path, &mut chunk, chunk_paths.len())?);
        }
        report.chunks = chunk_paths.len() as u64;

        self.merge_chunks(event_path, &chunk_paths)?;
        for path in &chunk_paths {
            let _ = std::fs::remove_file(path);
        }
        Ok(report)
    }

    fn flush_chunk(
        &self,
        event_path: &Path,
        chunk: &mut Vec<((i64, i64), Vec<u8>)>,
        index: usize,
    ) -> Result<PathBuf> {
        chunk.sort_by_key(|(key, _)| *key);
        let path = event_path.with_extension(format!("sort{index}"));
        let mut writer = ArchiveWriter::create(&path)?;
        for (_, record) in chunk.iter() {
            writer.append(record)?;
        }
        writer.sync()?;
        chunk.clear();
        Ok(path)
    }

    /// K-way merge: a min-heap holds each chunk's head record.
    fn merge_chunks(&self, event_path: &Path, chunk_paths: &[PathBuf]) -> Result<()> {
        let mut readers = Vec::with_capacity(chunk_paths.len());
        for path in chunk_paths {
            readers.push(ArchiveReader::open(path)?);
        }

        let mut heap: BinaryHeap<Reverse<((i64, i64), usize, Vec<u8>)>> = BinaryHeap::new();
        for (idx, reader) in readers.iter_mut().enumerate() {
            if let Some(record) = reader.next_record()? {
                let key = peek_sort_key(&record, event_path)?;
                heap.push(Reverse((key, idx, record)));
            }
        }

        let mut writer = ArchiveWriter::create(event_path)?;
        while let Some(Reverse((_, idx, record))) = heap.pop() {
            writer.append(&record)?;
            if let Some(next) = readers[idx].next_record()? {
                let key = peek_sort_key(&next, event_path)?;
                heap.push(Reverse((key, idx, next)));
            }
        }
        writer.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::QueryEvent;
    use crate::storage::archive::{decode_query_event, encode_query_event};
    use std::sync::Arc;

    fn write_events(path: &Path, events: &[QueryEvent]) {
        let mut writer = ArchiveWriter::create(path).unwrap();
        for event in events {
            writer.append(&encode_query_event(event)).unwrap();
        }
        writer.sync().unwrap();
    }

    fn read_keys(path: &Path) -> Vec<(i64, i64)> {
        let mut reader = ArchiveReader::open(path).unwrap();
        let mut keys = Vec::new();
        while let Some(record) = reader.next_record().unwrap() {
            let event = decode_query_event(&record, path).unwrap();
            keys.push((event.start_time, event.event_id));
        }
        keys
    }

    fn event(event_id: i64, start_time: i64) -> QueryEvent {
        QueryEvent {
            canonical: Arc::new("SELECT ?".to_string()),
            canonical_id: 1,
            event_id,
            start_time,
            end_time: start_time + 10,
            session_id: 1,
            ..QueryEvent::default()
        }
    }

    #[test]
    fn sorts_by_start_time_with_event_id_tiebreak() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cap.ex");
        write_events(
            &path,
            &[
                event(3, 300),
                event(1, 100),
                event(4, 200), // same start as event 2, higher id
                event(2, 200),
            ],
        );
        QuerySort::default().sort_file(&path).unwrap();
        assert_eq!(read_keys(&path), vec![(100, 1), (200, 2), (200, 4), (300, 3)]);
    }

    #[test]
    fn external_merge_path_produces_the_same_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cap.ex");
        // Descending starts force every chunk boundary to interleave.
        let events: Vec<QueryEvent> = (0..100)
            .map(|i| event(i as i64 + 1, 1000 - (i as i64) * 7))
            .collect();
        write_events(&path, &events);

        let report = QuerySort::new(8).sort_file(&path).unwrap();
        assert_eq!(report.events, 100);
        assert!(report.chunks > 1);

        let keys = read_keys(&path);
        assert_eq!(keys.len(), 100);
        for pair in keys.windows(2) {
            assert!(pair[0] <= pair[1], "{pair:?} out of order");
        }
        // Nothing was lost or duplicated.
        let mut ids: Vec<i64> = keys.iter().map(|(_, id)| *id).collect();
        ids.sort();
        assert_eq!(ids, (1..=100).collect::<Vec<_>>());
    }
}
