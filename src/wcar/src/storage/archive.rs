use crate::event::{CanonicalArg, EventFlags, QueryEvent, RepEvent, Transaction};
use crate::storage::Storage;
use crate::{Result, WcarError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use common::gtid::Gtid;
use hashbrown::HashMap;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::hash::Hasher;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Every capture file starts with "GCAP" and a version word; readers
/// reject anything else.
pub const ARCHIVE_MAGIC: [u8; 4] = *b"GCAP";
pub const ARCHIVE_VERSION: u32 = 1;

/// How many deserialised events the reader keeps ahead of the consumer.
const PRELOAD_WINDOW: usize = 10_000;

/// An append-only stream of length-prefixed records.
pub struct ArchiveWriter {
    path: PathBuf,
    file: BufWriter<File>,
    bytes_written: u64,
}

impl ArchiveWriter {
    pub fn create(path: &Path) -> Result<ArchiveWriter> {
        let mut file = BufWriter::new(
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)
                .map_err(|e| WcarError::io(path, e))?,
        );
        file.write_all(&ARCHIVE_MAGIC)
            .and_then(|_| file.write_u32::<LittleEndian>(ARCHIVE_VERSION))
            .map_err(|e| WcarError::io(path, e))?;
        Ok(ArchiveWriter {
            path: path.to_path_buf(),
            file,
            bytes_written: 8,
        })
    }

    pub fn append(&mut self, record: &[u8]) -> Result<()> {
        self.file
            .write_u32::<LittleEndian>(record.len() as u32)
            .and_then(|_| self.file.write_all(record))
            .map_err(|e| WcarError::io(&self.path, e))?;
        self.bytes_written += 4 + record.len() as u64;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.flush().map_err(|e| WcarError::io(&self.path, e))
    }
}

/// The reading end; verifies magic and version at open.
pub struct ArchiveReader {
    path: PathBuf,
    file: BufReader<File>,
}

impl ArchiveReader {
    pub fn open(path: &Path) -> Result<ArchiveReader> {
        let mut file =
            BufReader::new(File::open(path).map_err(|e| WcarError::io(path, e))?);
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic).map_err(|_| WcarError::BadMagic {
            path: path.display().to_string(),
        })?;
        if magic != ARCHIVE_MAGIC {
            return Err(WcarError::BadMagic {
                path: path.display().to_string(),
            });
        }
        let version = file
            .read_u32::<LittleEndian>()
            .map_err(|e| WcarError::io(path, e))?;
        if version != ARCHIVE_VERSION {
            return Err(WcarError::BadVersion {
                path: path.display().to_string(),
                found: version,
                expected: ARCHIVE_VERSION,
            });
        }
        Ok(ArchiveReader {
            path: path.to_path_buf(),
            file,
        })
    }

    /// The next record, `None` at a clean end of file. A record cut short
    /// is corruption, not an end.
    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
        let len = match self.file.read_u32::<LittleEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(WcarError::io(&self.path, e)),
        };
        let mut record = vec![0u8; len];
        self.file
            .read_exact(&mut record)
            .map_err(|_| WcarError::corrupt(&self.path, "truncated record"))?;
        Ok(Some(record))
    }
}

// Record codecs. All integers little-endian fixed width, strings
// u32-length-prefixed UTF-8, timestamps i64 nanoseconds since the epoch.

fn put_string(out: &mut Vec<u8>, s: &str) {
    out.write_u32::<LittleEndian>(s.len() as u32).unwrap();
    out.extend_from_slice(s.as_bytes());
}

fn get_string(input: &mut &[u8], path: &Path) -> Result<String> {
    let len = input
        .read_u32::<LittleEndian>()
        .map_err(|_| WcarError::corrupt(path, "truncated string length"))? as usize;
    if input.len() < len {
        return Err(WcarError::corrupt(path, "truncated string"));
    }
    let (bytes, rest) = input.split_at(len);
    *input = rest;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| WcarError::corrupt(path, "string is not valid utf-8"))
}

fn put_gtid(out: &mut Vec<u8>, gtid: &Gtid) {
    out.write_u32::<LittleEndian>(gtid.domain_id).unwrap();
    out.write_u32::<LittleEndian>(gtid.server_id).unwrap();
    out.write_u64::<LittleEndian>(gtid.sequence_nr).unwrap();
}

fn get_gtid(input: &mut &[u8], path: &Path) -> Result<Gtid> {
    let err = || WcarError::corrupt(path, "truncated gtid");
    Ok(Gtid {
        domain_id: input.read_u32::<LittleEndian>().map_err(|_| err())?,
        server_id: input.read_u32::<LittleEndian>().map_err(|_| err())?,
        sequence_nr: input.read_u64::<LittleEndian>().map_err(|_| err())?,
    })
}

/// `.ex` record: timing first so the offline sorter can peek the key
/// without decoding the argument list.
pub fn encode_query_event(event: &QueryEvent) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.write_i64::<LittleEndian>(event.event_id).unwrap();
    out.write_i64::<LittleEndian>(event.start_time).unwrap();
    out.write_i64::<LittleEndian>(event.end_time).unwrap();
    out.write_i64::<LittleEndian>(event.canonical_id).unwrap();
    out.write_u64::<LittleEndian>(event.session_id).unwrap();
    out.write_u64::<LittleEndian>(event.flags.bits()).unwrap();
    out.write_u8(event.command).unwrap();
    put_gtid(&mut out, &event.gtid);
    out.write_u32::<LittleEndian>(event.args.len() as u32).unwrap();
    for arg in &event.args {
        out.write_u32::<LittleEndian>(arg.pos).unwrap();
        put_string(&mut out, &arg.value);
    }
    out
}

/// The sort key of an encoded `.ex` record: (start_time, event_id).
pub fn peek_sort_key(record: &[u8], path: &Path) -> Result<(i64, i64)> {
    let mut input = record;
    let err = || WcarError::corrupt(path, "truncated query event");
    let event_id = input.read_i64::<LittleEndian>().map_err(|_| err())?;
    let start = input.read_i64::<LittleEndian>().map_err(|_| err())?;
    Ok((start, event_id))
}

/// Decode without canonical resolution; the caller fills the text in.
pub fn decode_query_event(record: &[u8], path: &Path) -> Result<QueryEvent> {
    let mut input = record;
    let err = || WcarError::corrupt(path, "truncated query event");
    let event_id = input.read_i64::<LittleEndian>().map_err(|_| err())?;
    let start_time = input.read_i64::<LittleEndian>().map_err(|_| err())?;
    let end_time = input.read_i64::<LittleEndian>().map_err(|_| err())?;
    let canonical_id = input.read_i64::<LittleEndian>().map_err(|_| err())?;
    let session_id = input.read_u64::<LittleEndian>().map_err(|_| err())?;
    let flags = input.read_u64::<LittleEndian>().map_err(|_| err())?;
    let command = input.read_u8().map_err(|_| err())?;
    let gtid = get_gtid(&mut input, path)?;
    let nargs = input.read_u32::<LittleEndian>().map_err(|_| err())?;
    let mut args = Vec::with_capacity(nargs as usize);
    for _ in 0..nargs {
        let pos = input.read_u32::<LittleEndian>().map_err(|_| err())?;
        let value = get_string(&mut input, path)?;
        args.push(CanonicalArg { pos, value });
    }
    Ok(QueryEvent {
        canonical: Arc::new(String::new()),
        canonical_id,
        args,
        session_id,
        flags: EventFlags::from_bits_retain(flags),
        command,
        start_time,
        end_time,
        event_id,
        gtid,
    })
}

pub fn encode_rep_event(event: &RepEvent) -> Vec<u8> {
    let mut out = Vec::with_capacity(48);
    out.write_i64::<LittleEndian>(event.event_id).unwrap();
    out.write_i64::<LittleEndian>(event.start_time).unwrap();
    out.write_i64::<LittleEndian>(event.end_time).unwrap();
    out.write_i64::<LittleEndian>(event.canonical_id).unwrap();
    out.write_u64::<LittleEndian>(event.num_rows).unwrap();
    out.write_u64::<LittleEndian>(event.rows_read).unwrap();
    out.write_u32::<LittleEndian>(event.error).unwrap();
    out
}

pub fn decode_rep_event(record: &[u8], path: &Path) -> Result<RepEvent> {
    let mut input = record;
    let err = || WcarError::corrupt(path, "truncated reply event");
    Ok(RepEvent {
        event_id: input.read_i64::<LittleEndian>().map_err(|_| err())?,
        start_time: input.read_i64::<LittleEndian>().map_err(|_| err())?,
        end_time: input.read_i64::<LittleEndian>().map_err(|_| err())?,
        canonical_id: input.read_i64::<LittleEndian>().map_err(|_| err())?,
        num_rows: input.read_u64::<LittleEndian>().map_err(|_| err())?,
        rows_read: input.read_u64::<LittleEndian>().map_err(|_| err())?,
        error: input.read_u32::<LittleEndian>().map_err(|_| err())?,
    })
}

pub fn encode_transaction(trx: &Transaction) -> Vec<u8> {
    let mut out = Vec::with_capacity(48);
    out.write_u64::<LittleEndian>(trx.session_id).unwrap();
    out.write_i64::<LittleEndian>(trx.start_event_id).unwrap();
    out.write_i64::<LittleEndian>(trx.end_event_id).unwrap();
    out.write_i64::<LittleEndian>(trx.end_time).unwrap();
    put_gtid(&mut out, &trx.gtid);
    out
}

pub fn decode_transaction(record: &[u8], path: &Path) -> Result<Transaction> {
    let mut input = record;
    let err = || WcarError::corrupt(path, "truncated transaction");
    Ok(Transaction {
        session_id: input.read_u64::<LittleEndian>().map_err(|_| err())?,
        start_event_id: input.read_i64::<LittleEndian>().map_err(|_| err())?,
        end_event_id: input.read_i64::<LittleEndian>().map_err(|_| err())?,
        end_time: input.read_i64::<LittleEndian>().map_err(|_| err())?,
        gtid: get_gtid(&mut input, path)?,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
}

struct CanonicalEntry {
    canonical_id: i64,
    text: Arc<String>,
}

/// The primary on-disk format: three append-only files sharing a base
/// name. `.cx` holds the canonical dictionary, `.ex` the query events and
/// `.rx` the reply events written during replay; the offline transform
/// adds `.gx`.
pub struct CaptureStorage {
    base_path: PathBuf,
    canonical_path: PathBuf,
    event_path: PathBuf,
    // write side
    canonical_out: Option<ArchiveWriter>,
    event_out: Option<ArchiveWriter>,
    rep_out: Option<ArchiveWriter>,
    // read side
    event_in: Option<ArchiveReader>,
    preload: VecDeque<QueryEvent>,
    /// canonical hash -> entry, and id -> text for event resolution.
    canonicals_by_hash: HashMap<u64, CanonicalEntry>,
    canonicals_by_id: HashMap<i64, Arc<String>>,
    next_canonical_id: i64,
}

impl CaptureStorage {
    pub fn open(base_path: &Path, access: AccessMode) -> Result<CaptureStorage> {
        let canonical_path = base_path.with_extension("cx");
        let event_path = base_path.with_extension("ex");
        let mut storage = CaptureStorage {
            base_path: base_path.to_path_buf(),
            canonical_path: canonical_path.clone(),
            event_path: event_path.clone(),
            canonical_out: None,
            event_out: None,
            rep_out: None,
            event_in: None,
            preload: VecDeque::new(),
            canonicals_by_hash: HashMap::new(),
            canonicals_by_id: HashMap::new(),
            next_canonical_id: 1,
        };
        match access {
            AccessMode::WriteOnly => {
                storage.canonical_out = Some(ArchiveWriter::create(&canonical_path)?);
                storage.event_out = Some(ArchiveWriter::create(&event_path)?);
            }
            AccessMode::ReadOnly => {
                storage.read_canonicals()?;
                storage.event_in = Some(ArchiveReader::open(&event_path)?);
                storage.preload_query_events(PRELOAD_WINDOW)?;
            }
        }
        Ok(storage)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Open the reply-event file for writing (used during replay).
    pub fn open_rep_writer(&mut self) -> Result<()> {
        let path = self.base_path.with_extension("rx");
        self.rep_out = Some(ArchiveWriter::create(&path)?);
        Ok(())
    }

    pub fn add_rep_event(&mut self, event: &RepEvent) -> Result<()> {
        let writer = self
            .rep_out
            .as_mut()
            .expect("rep writer must be opened before replay");
        writer.append(&encode_rep_event(event))
    }

    pub fn canonical_count(&self) -> usize {
        self.canonicals_by_id.len()
    }

    pub fn find_canonical(&self, canonical_id: i64) -> Result<Arc<String>> {
        self.canonicals_by_id
            .get(&canonical_id)
            .cloned()
            .ok_or(WcarError::UnknownCanonical(canonical_id))
    }

    fn read_canonicals(&mut self) -> Result<()> {
        let mut reader = ArchiveReader::open(&self.canonical_path)?;
        while let Some(record) = reader.next_record()? {
            let mut input = record.as_slice();
            let canonical_id = input
                .read_i64::<LittleEndian>()
                .map_err(|_| WcarError::corrupt(&self.canonical_path, "truncated canonical"))?;
            let text = Arc::new(get_string(&mut input, &self.canonical_path)?);
            let hash = canonical_hash(&text);
            self.canonicals_by_id.insert(canonical_id, Arc::clone(&text));
            self.canonicals_by_hash.insert(
                hash,
                CanonicalEntry {
                    canonical_id,
                    text,
                },
            );
            self.next_canonical_id = self.next_canonical_id.max(canonical_id + 1);
        }
        Ok(())
    }

    fn preload_query_events(&mut self, window: usize) -> Result<()> {
        let Some(reader) = self.event_in.as_mut() else {
            return Ok(());
        };
        while self.preload.len() < window {
            match reader.next_record()? {
                Some(record) => {
                    let mut event = decode_query_event(&record, &self.event_path)?;
                    event.canonical = self
                        .canonicals_by_id
                        .get(&event.canonical_id)
                        .cloned()
                        .ok_or(WcarError::UnknownCanonical(event.canonical_id))?;
                    self.preload.push_back(event);
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Iterate replayed reply events; used by `show` and the tests.
    pub fn read_rep_events(&self) -> Result<Vec<RepEvent>> {
        let path = self.base_path.with_extension("rx");
        let mut reader = ArchiveReader::open(&path)?;
        let mut events = Vec::new();
        while let Some(record) = reader.next_record()? {
            events.push(decode_rep_event(&record, &path)?);
        }
        Ok(events)
    }

    pub fn save_transactions(&self, transactions: &[Transaction]) -> Result<()> {
        let path = self.base_path.with_extension("gx");
        let mut writer = ArchiveWriter::create(&path)?;
        for trx in transactions {
            writer.append(&encode_transaction(trx))?;
        }
        writer.sync()
    }

    pub fn load_transactions(&self) -> Result<Vec<Transaction>> {
        let path = self.base_path.with_extension("gx");
        let mut reader = ArchiveReader::open(&path)?;
        let mut transactions = Vec::new();
        while let Some(record) = reader.next_record()? {
            transactions.push(decode_transaction(&record, &path)?);
        }
        Ok(transactions)
    }
}

/// Canonicals are deduplicated by a 64-bit hash of the text.
pub fn canonical_hash(text: &str) -> u64 {
    let mut hasher = twox_hash::XxHash64::with_seed(0);
    hasher.write(text.as_bytes());
    hasher.finish()
}

impl Storage for CaptureStorage {
    fn add_query_event(&mut self, mut event: QueryEvent) -> Result<()> {
        let hash = canonical_hash(&event.canonical);
        let canonical_id = match self.canonicals_by_hash.get(&hash) {
            Some(entry) => {
                event.canonical = Arc::clone(&entry.text);
                entry.canonical_id
            }
            None => {
                let canonical_id = self.next_canonical_id;
                self.next_canonical_id += 1;
                let mut record = Vec::with_capacity(16 + event.canonical.len());
                record.write_i64::<LittleEndian>(canonical_id).unwrap();
                put_string(&mut record, &event.canonical);
                self.canonical_out
                    .as_mut()
                    .expect("storage opened for writing")
                    .append(&record)?;
                self.canonicals_by_hash.insert(
                    hash,
                    CanonicalEntry {
                        canonical_id,
                        text: Arc::clone(&event.canonical),
                    },
                );
                self.canonicals_by_id
                    .insert(canonical_id, Arc::clone(&event.canonical));
                canonical_id
            }
        };
        event.canonical_id = canonical_id;
        self.event_out
            .as_mut()
            .expect("storage opened for writing")
            .append(&encode_query_event(&event))
    }

    fn next_event(&mut self) -> Result<Option<QueryEvent>> {
        if self.preload.is_empty() {
            self.preload_query_events(PRELOAD_WINDOW)?;
        }
        Ok(self.preload.pop_front())
    }

    fn bytes_written(&self) -> u64 {
        self.canonical_out.as_ref().map(ArchiveWriter::bytes_written).unwrap_or(0)
            + self.event_out.as_ref().map(ArchiveWriter::bytes_written).unwrap_or(0)
            + self.rep_out.as_ref().map(ArchiveWriter::bytes_written).unwrap_or(0)
    }

    fn sync(&mut self) -> Result<()> {
        if let Some(writer) = self.canonical_out.as_mut() {
            writer.sync()?;
        }
        if let Some(writer) = self.event_out.as_mut() {
            writer.sync()?;
        }
        if let Some(writer) = self.rep_out.as_mut() {
            writer.sync()?;
        }
        Ok(())
    }
}
