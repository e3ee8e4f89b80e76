//! The write-ahead log manager.
//!
//! An append-only in-memory log buffer with a background flush thread.
//! `append_log_record` assigns LSNs and serializes records into the log
//! buffer; the flusher swaps the log buffer against its flush buffer on a
//! trigger or a timeout, writes the batch to disk, and advances the
//! persistent LSN. Recovery replay is out of scope; this manager only
//! buffers and flushes records.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error};
use parking_lot::{Condvar, Mutex};

use crate::transaction::TxnId;
use crate::{PageId, Rid, Tuple, PAGE_SIZE};

/// A log sequence number, assigned monotonically at append time.
pub type Lsn = i32;

pub const INVALID_LSN: Lsn = -1;

/// Capacity of the in-memory log buffer.
pub const LOG_BUFFER_SIZE: usize = PAGE_SIZE;

/// How long the flush thread sleeps without a trigger before flushing
/// whatever has accumulated.
pub const LOG_TIMEOUT: Duration = Duration::from_secs(1);

/// Fixed header preceding every record: size, lsn, txn id, prev lsn, type.
pub const LOG_RECORD_HEADER_SIZE: usize = 20;

/// The type-specific body of a log record. Only these types reach the log;
/// anything else in the engine is a control record with no wire form.
#[derive(Debug, Clone, PartialEq)]
pub enum LogPayload {
    Insert { rid: Rid, tuple: Tuple },
    MarkDelete { rid: Rid, tuple: Tuple },
    ApplyDelete { rid: Rid, tuple: Tuple },
    RollbackDelete { rid: Rid, tuple: Tuple },
    Update { rid: Rid, old_tuple: Tuple, new_tuple: Tuple },
    NewPage { prev_page_id: PageId },
}

impl LogPayload {
    fn type_id(&self) -> u32 {
        match self {
            LogPayload::Insert { .. } => 1,
            LogPayload::MarkDelete { .. } => 2,
            LogPayload::ApplyDelete { .. } => 3,
            LogPayload::RollbackDelete { .. } => 4,
            LogPayload::Update { .. } => 5,
            LogPayload::NewPage { .. } => 6,
        }
    }

    fn body_size(&self) -> usize {
        const RID_SIZE: usize = 8;
        match self {
            LogPayload::Insert { tuple, .. }
            | LogPayload::MarkDelete { tuple, .. }
            | LogPayload::ApplyDelete { tuple, .. }
            | LogPayload::RollbackDelete { tuple, .. } => RID_SIZE + tuple.serialized_size(),
            LogPayload::Update {
                old_tuple,
                new_tuple,
                ..
            } => RID_SIZE + old_tuple.serialized_size() + new_tuple.serialized_size(),
            LogPayload::NewPage { .. } => 4,
        }
    }

    fn serialize_to(&self, out: &mut Vec<u8>) {
        fn put_rid(out: &mut Vec<u8>, rid: &Rid) {
            out.extend_from_slice(&rid.page_id.to_le_bytes());
            out.extend_from_slice(&rid.slot.to_le_bytes());
        }
        match self {
            LogPayload::Insert { rid, tuple }
            | LogPayload::MarkDelete { rid, tuple }
            | LogPayload::ApplyDelete { rid, tuple }
            | LogPayload::RollbackDelete { rid, tuple } => {
                put_rid(out, rid);
                tuple.serialize_to(out);
            }
            LogPayload::Update {
                rid,
                old_tuple,
                new_tuple,
            } => {
                put_rid(out, rid);
                old_tuple.serialize_to(out);
                new_tuple.serialize_to(out);
            }
            LogPayload::NewPage { prev_page_id } => {
                out.extend_from_slice(&prev_page_id.to_le_bytes());
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub prev_lsn: Lsn,
    pub payload: LogPayload,
}

impl LogRecord {
    pub fn new(txn_id: TxnId, prev_lsn: Lsn, payload: LogPayload) -> Self {
        Self {
            lsn: INVALID_LSN,
            txn_id,
            prev_lsn,
            payload,
        }
    }

    pub fn size(&self) -> usize {
        LOG_RECORD_HEADER_SIZE + self.payload.body_size()
    }

    fn serialize_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.size() as i32).to_le_bytes());
        out.extend_from_slice(&self.lsn.to_le_bytes());
        out.extend_from_slice(&(self.txn_id as i32).to_le_bytes());
        out.extend_from_slice(&self.prev_lsn.to_le_bytes());
        out.extend_from_slice(&self.payload.type_id().to_le_bytes());
        self.payload.serialize_to(out);
    }
}

struct LogState {
    log_buffer: Vec<u8>,
    /// True between the buffer swap and the completion of the disk write.
    flush_pending: bool,
    running: bool,
}

struct LogCore {
    state: Mutex<LogState>,
    /// Wakes the flush thread.
    flush_cv: Condvar,
    /// Wakes appenders blocked on a full buffer.
    flushed_cv: Condvar,
    next_lsn: AtomicI32,
    persistent_lsn: AtomicI32,
    file: Mutex<File>,
}

pub struct LogManager {
    core: Arc<LogCore>,
    /// Serializes appenders so LSN order equals buffer order.
    append_latch: Mutex<()>,
    logging_enabled: AtomicBool,
    flush_thread: Option<thread::JoinHandle<()>>,
}

impl LogManager {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            core: Arc::new(LogCore {
                state: Mutex::new(LogState {
                    log_buffer: Vec::with_capacity(LOG_BUFFER_SIZE),
                    flush_pending: false,
                    running: false,
                }),
                flush_cv: Condvar::new(),
                flushed_cv: Condvar::new(),
                next_lsn: AtomicI32::new(0),
                persistent_lsn: AtomicI32::new(INVALID_LSN),
                file: Mutex::new(file),
            }),
            append_latch: Mutex::new(()),
            logging_enabled: AtomicBool::new(false),
            flush_thread: None,
        })
    }

    /// Starts the background flusher and enables logging.
    pub fn run_flush_thread(&mut self) {
        {
            let mut state = self.core.state.lock();
            if state.running {
                return;
            }
            state.running = true;
        }
        self.logging_enabled.store(true, Ordering::SeqCst);
        let core = Arc::clone(&self.core);
        self.flush_thread = Some(thread::spawn(move || background_flush(&core)));
        debug!("log flush thread started");
    }

    /// Stops and joins the flusher after a final drain; disables logging.
    pub fn stop_flush_thread(&mut self) {
        {
            let mut state = self.core.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
        }
        self.logging_enabled.store(false, Ordering::SeqCst);
        self.trigger_flush();
        if let Some(handle) = self.flush_thread.take() {
            handle.join().expect("flush thread panicked");
        }
        debug!("log flush thread stopped");
    }

    pub fn is_logging_enabled(&self) -> bool {
        self.logging_enabled.load(Ordering::SeqCst)
    }

    /// Assigns the record's LSN and serializes it into the log buffer,
    /// group-flushing first if the record would overflow.
    pub fn append_log_record(&self, record: &mut LogRecord) -> Lsn {
        let _append = self.append_latch.lock();
        let mut state = self.core.state.lock();
        assert!(
            record.size() <= LOG_BUFFER_SIZE,
            "log record larger than the log buffer"
        );
        if state.log_buffer.len() + record.size() > LOG_BUFFER_SIZE {
            drop(state);
            self.trigger_flush();
            self.wait_until_flushed();
            state = self.core.state.lock();
            assert!(state.log_buffer.is_empty());
        }
        record.lsn = self.core.next_lsn.fetch_add(1, Ordering::SeqCst);
        record.serialize_to(&mut state.log_buffer);
        record.lsn
    }

    /// Wakes the flusher if it is sleeping.
    pub fn trigger_flush(&self) {
        self.core.flush_cv.notify_one();
    }

    /// Blocks until the log buffer is empty and no disk write is in
    /// flight.
    pub fn wait_until_flushed(&self) {
        let mut state = self.core.state.lock();
        while state.flush_pending || !state.log_buffer.is_empty() {
            self.core.flushed_cv.wait(&mut state);
        }
    }

    pub fn next_lsn(&self) -> Lsn {
        self.core.next_lsn.load(Ordering::SeqCst)
    }

    /// The highest LSN known durable: records with lsn <= this have been
    /// written to disk.
    pub fn persistent_lsn(&self) -> Lsn {
        self.core.persistent_lsn.load(Ordering::SeqCst)
    }
}

impl Drop for LogManager {
    fn drop(&mut self) {
        self.stop_flush_thread();
    }
}

/// The flusher: sleep until a trigger or the timeout, swap buffers, write
/// the batch, advance the persistent LSN, and notify waiting appenders.
fn background_flush(core: &LogCore) {
    let mut flush_buffer: Vec<u8> = Vec::with_capacity(LOG_BUFFER_SIZE);
    loop {
        let mut state = core.state.lock();
        while state.running && state.log_buffer.is_empty() {
            let timed_out = core.flush_cv.wait_for(&mut state, LOG_TIMEOUT).timed_out();
            if !timed_out {
                break;
            }
        }
        if state.log_buffer.is_empty() {
            if !state.running {
                return;
            }
            continue;
        }

        std::mem::swap(&mut state.log_buffer, &mut flush_buffer);
        state.flush_pending = true;
        let durable_lsn = core.next_lsn.load(Ordering::SeqCst) - 1;
        let running = state.running;
        drop(state);

        {
            let mut file = core.file.lock();
            if let Err(e) = file.write_all(&flush_buffer).and_then(|_| file.sync_all()) {
                error!("log flush failed: {}", e);
            }
        }
        debug!("flushed {} log bytes, lsn {}", flush_buffer.len(), durable_lsn);
        flush_buffer.clear();

        let mut state = core.state.lock();
        state.flush_pending = false;
        core.persistent_lsn.store(durable_lsn, Ordering::SeqCst);
        core.flushed_cv.notify_all();
        if !running && state.log_buffer.is_empty() {
            return;
        }
    }
}
