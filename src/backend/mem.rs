use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, ErrorKind};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::{BlockIo, IoOp, IoRequest, IoStatus};
use crate::types::{page, BufferError, Lsn, PageKey, Result, SpaceId, SpaceVersion};

/// Callback run on every submission, before the transfer happens.
pub type SubmitObserver = Box<dyn Fn(&IoRequest, bool) + Send + Sync>;

/// One submission seen by [`MemBlockIo`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IoRecord {
    /// Read or write.
    pub op: IoOp,
    /// Target page.
    pub key: PageKey,
    /// Whether the caller asked for synchronous completion.
    pub sync: bool,
    /// Header LSN of the written image; zero for reads.
    pub lsn: Lsn,
}

struct MemSpace {
    version: SpaceVersion,
    size: u32,
    pages: HashMap<u32, Box<[u8]>>,
}

#[derive(Default)]
struct MemState {
    spaces: HashMap<SpaceId, MemSpace>,
    queue: VecDeque<IoRequest>,
    records: Vec<IoRecord>,
    syncs: Vec<(SpaceId, usize)>,
    fail_reads: HashSet<PageKey>,
    manual_dispatch: bool,
    write_budget: Option<usize>,
    pending_writes: usize,
    next_version: u64,
}

/// In-memory block device.
///
/// Deterministic: queued requests are executed on the thread that calls
/// [`BlockIo::wake_dispatcher`] (or [`MemBlockIo::run_pending`] when manual
/// dispatch is on). Records every submission and supports read failures and
/// a write budget for crash simulation.
pub struct MemBlockIo {
    state: Mutex<MemState>,
    drained: Condvar,
    observer: Mutex<Option<Arc<SubmitObserver>>>,
}

impl Default for MemBlockIo {
    fn default() -> Self {
        Self::new()
    }
}

impl MemBlockIo {
    /// Creates an empty device.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemState::default()),
            drained: Condvar::new(),
            observer: Mutex::new(None),
        }
    }

    /// Creates (or recreates) a tablespace of `size` pages and returns its
    /// version stamp. Recreating drops old content and bumps the version.
    pub fn create_space(&self, space: SpaceId, size: u32) -> SpaceVersion {
        let mut state = self.state.lock();
        state.next_version += 1;
        let version = SpaceVersion(state.next_version);
        state.spaces.insert(
            space,
            MemSpace {
                version,
                size,
                pages: HashMap::new(),
            },
        );
        version
    }

    /// Removes a tablespace; later requests fail with `TablespaceDeleted`.
    pub fn drop_space(&self, space: SpaceId) {
        self.state.lock().spaces.remove(&space);
    }

    /// Stores a page image directly, bypassing the request log.
    pub fn put_page(&self, key: PageKey, image: &[u8]) {
        let mut state = self.state.lock();
        if let Some(space) = state.spaces.get_mut(&key.space) {
            space.pages.insert(key.page_no.0, image.to_vec().into_boxed_slice());
        }
    }

    /// Returns the stored image of a page, if one was ever written.
    pub fn page(&self, key: PageKey) -> Option<Vec<u8>> {
        let state = self.state.lock();
        state
            .spaces
            .get(&key.space)
            .and_then(|space| space.pages.get(&key.page_no.0))
            .map(|buf| buf.to_vec())
    }

    /// Makes reads of `key` fail with an I/O error.
    pub fn fail_reads_of(&self, key: PageKey) {
        self.state.lock().fail_reads.insert(key);
    }

    /// Allows only `writes` more writes to land; later writes are silently
    /// dropped as if the machine lost power.
    pub fn crash_after_writes(&self, writes: usize) {
        self.state.lock().write_budget = Some(writes);
    }

    /// With manual dispatch on, `wake_dispatcher` leaves the queue alone.
    pub fn set_manual_dispatch(&self, manual: bool) {
        self.state.lock().manual_dispatch = manual;
    }

    /// Installs a callback run on every submission.
    pub fn set_observer(&self, observer: SubmitObserver) {
        *self.observer.lock() = Some(Arc::new(observer));
    }

    /// Every submission so far, in order.
    pub fn records(&self) -> Vec<IoRecord> {
        self.state.lock().records.clone()
    }

    /// Submitted writes, in order.
    pub fn writes(&self) -> Vec<IoRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.op == IoOp::Write)
            .collect()
    }

    /// Tablespaces flushed so far, in order, each paired with the number
    /// of submissions recorded before the flush.
    pub fn syncs(&self) -> Vec<(SpaceId, usize)> {
        self.state.lock().syncs.clone()
    }

    /// Lifts a write budget set by [`MemBlockIo::crash_after_writes`], as
    /// after a restart.
    pub fn power_on(&self) {
        self.state.lock().write_budget = None;
    }

    /// Number of queued, not yet executed requests.
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Executes every queued request and delivers completions.
    pub fn run_pending(&self) -> usize {
        let mut done = 0;
        loop {
            let next = self.state.lock().queue.pop_front();
            let Some(mut request) = next else {
                break;
            };
            let result = self.execute(&mut request);
            let is_write = request.op == IoOp::Write;
            if let Some(completion) = request.completion.clone() {
                completion.io_complete(request, result);
            }
            if is_write {
                let mut state = self.state.lock();
                state.pending_writes = state.pending_writes.saturating_sub(1);
                if state.pending_writes == 0 {
                    self.drained.notify_all();
                }
            }
            done += 1;
        }
        done
    }

    fn execute(&self, request: &mut IoRequest) -> Result<()> {
        let mut state = self.state.lock();
        if request.op == IoOp::Read && state.fail_reads.contains(&request.key) {
            return Err(BufferError::Io(io::Error::new(
                ErrorKind::Other,
                "injected read failure",
            )));
        }
        let drop_write = match (request.op, state.write_budget.as_mut()) {
            (IoOp::Write, Some(0)) => true,
            (IoOp::Write, Some(budget)) => {
                *budget -= 1;
                false
            }
            _ => false,
        };
        let space = state
            .spaces
            .get_mut(&request.key.space)
            .ok_or(BufferError::TablespaceDeleted {
                space: request.key.space,
            })?;
        match request.op {
            IoOp::Read => {
                match space.pages.get(&request.key.page_no.0) {
                    Some(image) if image.len() == request.buf.len() => {
                        request.buf.copy_from_slice(image)
                    }
                    Some(_) => return Err(BufferError::Corruption("block size mismatch")),
                    None => request.buf.fill(0),
                }
                Ok(())
            }
            IoOp::Write => {
                if !drop_write {
                    space
                        .pages
                        .insert(request.key.page_no.0, request.buf.clone());
                    space.size = space.size.max(request.key.page_no.0 + 1);
                }
                Ok(())
            }
        }
    }
}

impl BlockIo for MemBlockIo {
    fn submit(&self, mut request: IoRequest, sync: bool) -> Result<IoStatus> {
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            observer(&request, sync);
        }
        {
            let mut state = self.state.lock();
            if !state.spaces.contains_key(&request.key.space) {
                return Err(BufferError::TablespaceDeleted {
                    space: request.key.space,
                });
            }
            let lsn = match request.op {
                IoOp::Write if request.buf.len() > page::PAGE_HDR_LEN => {
                    page::page_lsn(&request.buf)
                }
                _ => Lsn(0),
            };
            state.records.push(IoRecord {
                op: request.op,
                key: request.key,
                sync,
                lsn,
            });
            if !sync {
                if request.op == IoOp::Write {
                    state.pending_writes += 1;
                }
                state.queue.push_back(request);
                return Ok(IoStatus::Queued);
            }
        }
        self.execute(&mut request)?;
        Ok(IoStatus::Completed(request))
    }

    fn space_size(&self, space: SpaceId) -> Result<u32> {
        self.state
            .lock()
            .spaces
            .get(&space)
            .map(|s| s.size)
            .ok_or(BufferError::TablespaceDeleted { space })
    }

    fn space_version(&self, space: SpaceId) -> Option<SpaceVersion> {
        self.state.lock().spaces.get(&space).map(|s| s.version)
    }

    fn flush_space(&self, space: SpaceId) -> Result<()> {
        let mut state = self.state.lock();
        if !state.spaces.contains_key(&space) {
            return Err(BufferError::TablespaceDeleted { space });
        }
        let submitted = state.records.len();
        state.syncs.push((space, submitted));
        Ok(())
    }

    fn wake_dispatcher(&self) {
        if self.state.lock().manual_dispatch {
            return;
        }
        self.run_pending();
    }

    fn wait_no_pending_writes(&self) {
        let mut state = self.state.lock();
        if state.manual_dispatch || state.pending_writes == 0 {
            return;
        }
        drop(state);
        self.run_pending();
        state = self.state.lock();
        while state.pending_writes > 0 {
            self.drained.wait(&mut state);
        }
    }
}
