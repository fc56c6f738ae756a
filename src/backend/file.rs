use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, warn};

use super::{BlockIo, IoOp, IoRequest, IoStatus};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{BufferError, Result, SpaceId, SpaceVersion};

struct SpaceFile {
    io: StdFileIo,
    version: SpaceVersion,
}

#[derive(Default)]
struct DispatchState {
    pending: VecDeque<IoRequest>,
    pending_writes: usize,
    worker_running: bool,
}

struct Shared {
    dir: PathBuf,
    page_size: usize,
    spaces: RwLock<HashMap<SpaceId, Arc<SpaceFile>>>,
    next_version: Mutex<u64>,
    dispatch: Mutex<DispatchState>,
    drained: Condvar,
}

/// Block device backed by one file per tablespace under a directory.
///
/// Asynchronous requests are queued and executed by a worker thread that is
/// spawned on demand and exits once the queue is empty.
#[derive(Clone)]
pub struct FileBlockIo {
    shared: Arc<Shared>,
}

impl FileBlockIo {
    /// Creates a device rooted at `dir` for pages of `page_size` bytes.
    pub fn new(dir: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(BufferError::from)?;
        Ok(Self {
            shared: Arc::new(Shared {
                dir,
                page_size,
                spaces: RwLock::new(HashMap::new()),
                next_version: Mutex::new(0),
                dispatch: Mutex::new(DispatchState::default()),
                drained: Condvar::new(),
            }),
        })
    }

    /// Opens (creating if needed) the file of `space` and returns its
    /// version stamp. Reopening an open space bumps the version, which
    /// cancels reads issued against the previous incarnation.
    pub fn open_space(&self, space: SpaceId) -> Result<SpaceVersion> {
        let path = self.shared.dir.join(format!("space_{:08}.ibd", space.0));
        let io = StdFileIo::open(&path)?;
        let version = {
            let mut next = self.shared.next_version.lock();
            *next += 1;
            SpaceVersion(*next)
        };
        self.shared
            .spaces
            .write()
            .insert(space, Arc::new(SpaceFile { io, version }));
        debug!(space = space.0, version = version.0, "backend.file.open_space");
        Ok(version)
    }

    /// Forgets a tablespace. Its file stays on disk.
    pub fn close_space(&self, space: SpaceId) {
        self.shared.spaces.write().remove(&space);
    }

    fn space(&self, space: SpaceId) -> Result<Arc<SpaceFile>> {
        self.shared.space(space)
    }

    fn spawn_worker(shared: Arc<Shared>) {
        thread::spawn(move || Shared::worker_loop(shared));
    }
}

impl Shared {
    fn space(&self, space: SpaceId) -> Result<Arc<SpaceFile>> {
        self.spaces
            .read()
            .get(&space)
            .cloned()
            .ok_or(BufferError::TablespaceDeleted { space })
    }

    fn execute(&self, request: &mut IoRequest) -> Result<()> {
        let file = self.space(request.key.space)?;
        let off = request.offset();
        match request.op {
            IoOp::Read => {
                file.io.read_page_at(off, &mut request.buf)?;
            }
            IoOp::Write => file.io.write_at(off, &request.buf)?,
        }
        Ok(())
    }

    fn worker_loop(shared: Arc<Shared>) {
        loop {
            let next = {
                let mut state = shared.dispatch.lock();
                match state.pending.pop_front() {
                    Some(request) => request,
                    None => {
                        state.worker_running = false;
                        debug!("backend.file.worker_exit");
                        break;
                    }
                }
            };
            let mut request = next;
            let result = shared.execute(&mut request);
            if let Err(err) = &result {
                warn!(key = %request.key, error = %err, "backend.file.io_failed");
            }
            let is_write = request.op == IoOp::Write;
            if let Some(completion) = request.completion.clone() {
                completion.io_complete(request, result);
            }
            if is_write {
                let mut state = shared.dispatch.lock();
                state.pending_writes = state.pending_writes.saturating_sub(1);
                if state.pending_writes == 0 {
                    shared.drained.notify_all();
                }
            }
        }
    }
}

impl BlockIo for FileBlockIo {
    fn submit(&self, mut request: IoRequest, sync: bool) -> Result<IoStatus> {
        if sync {
            self.shared.execute(&mut request)?;
            return Ok(IoStatus::Completed(request));
        }
        self.space(request.key.space)?;
        let mut state = self.shared.dispatch.lock();
        if request.op == IoOp::Write {
            state.pending_writes += 1;
        }
        state.pending.push_back(request);
        Ok(IoStatus::Queued)
    }

    fn space_size(&self, space: SpaceId) -> Result<u32> {
        let file = self.space(space)?;
        let pages = file.io.len()? / self.shared.page_size as u64;
        Ok(pages.min(u32::MAX as u64) as u32)
    }

    fn space_version(&self, space: SpaceId) -> Option<SpaceVersion> {
        self.shared.spaces.read().get(&space).map(|f| f.version)
    }

    fn flush_space(&self, space: SpaceId) -> Result<()> {
        self.space(space)?.io.sync_all()
    }

    fn wake_dispatcher(&self) {
        let mut state = self.shared.dispatch.lock();
        if state.pending.is_empty() {
            return;
        }
        if !state.worker_running {
            state.worker_running = true;
            Self::spawn_worker(Arc::clone(&self.shared));
        }
    }

    fn wait_no_pending_writes(&self) {
        self.wake_dispatcher();
        let mut state = self.shared.dispatch.lock();
        while state.pending_writes > 0 {
            self.shared.drained.wait(&mut state);
        }
    }
}
