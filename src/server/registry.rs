/*!
 * Child Registry
 *
 * One contiguous shared-memory block co-owned by the monitor and every
 * worker child:
 *
 * ```text
 * [ child_slot[0..K-1]      fixed per-child records
 *   stats_slot[0..K-1]      per-child statistics blocks
 *   stats_history           cumulative block for exited children
 *   histogram area          shared histogram bins
 *   server header           started/closed/crashed counters, generation
 *   registered blobs        user-registered named regions
 * ]
 * ```
 *
 * Everything inside is addressed by offset from the region base; the only
 * cross-process references are offset/length pairs. Slot mutation happens
 * under the registry proc-mutex; per-slot counters are atomics so readers
 * never take the lock for a single value.
 */

use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use log::{debug, info};

use crate::config::ServerConfig;
use crate::core::errors::{ServerError, StatError};
use crate::core::types::{Fd, Pid, ServerResult, StatResult, Terminate};
use crate::ipc::{ProcMutex, SharedMem};
use crate::stats::histogram::BoundHistograms;
use crate::stats::{HistogramRegistry, StatMemblock, StatRegistry, StatType};

const SLOT_SIZE: usize = 64;
const HEADER_SIZE: usize = 64;

/// Per-child record in shared memory. The child writes its own counters;
/// the monitor writes `to_be_killed` and reads everything.
#[repr(C, align(64))]
pub struct ChildSlot {
    pid: AtomicI32,
    servers: AtomicI32,
    used_servers: AtomicI32,
    free_servers: AtomicI32,
    requests: AtomicU64,
    connections: AtomicU64,
    idle: AtomicI32,
    to_be_killed: AtomicU8,
    father_said: AtomicU8,
    generation: AtomicU32,
    pipe_fd: AtomicI32,
}

impl ChildSlot {
    #[inline]
    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid.load(Ordering::Acquire)
    }

    #[inline]
    #[must_use]
    pub fn servers(&self) -> i32 {
        self.servers.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn used_servers(&self) -> i32 {
        self.used_servers.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn free_servers(&self) -> i32 {
        self.free_servers.load(Ordering::Relaxed)
    }

    pub fn mark_worker_busy(&self) {
        self.used_servers.fetch_add(1, Ordering::Relaxed);
        self.free_servers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn mark_worker_free(&self) {
        self.used_servers.fetch_sub(1, Ordering::Relaxed);
        self.free_servers.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    #[must_use]
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn count_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    #[must_use]
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Relaxed) != 0
    }

    pub fn set_idle(&self, idle: bool) {
        self.idle.store(idle as i32, Ordering::Relaxed);
    }

    #[inline]
    #[must_use]
    pub fn terminate(&self) -> Terminate {
        Terminate::from_u8(self.to_be_killed.load(Ordering::Acquire))
    }

    /// Escalate the termination level; never downgrades.
    pub fn request_terminate(&self, level: Terminate) {
        self.to_be_killed
            .fetch_max(level as u8, Ordering::AcqRel);
    }

    #[inline]
    #[must_use]
    pub fn father_said(&self) -> Terminate {
        Terminate::from_u8(self.father_said.load(Ordering::Acquire))
    }

    pub fn set_father_said(&self, level: Terminate) {
        self.father_said.store(level as u8, Ordering::Release);
    }

    #[inline]
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn pipe_fd(&self) -> Fd {
        self.pipe_fd.load(Ordering::Relaxed)
    }

    fn clear(&self) {
        self.servers.store(0, Ordering::Relaxed);
        self.used_servers.store(0, Ordering::Relaxed);
        self.free_servers.store(0, Ordering::Relaxed);
        self.requests.store(0, Ordering::Relaxed);
        self.connections.store(0, Ordering::Relaxed);
        self.idle.store(0, Ordering::Relaxed);
        self.to_be_killed.store(0, Ordering::Relaxed);
        self.father_said.store(0, Ordering::Relaxed);
        self.generation.store(0, Ordering::Relaxed);
        self.pipe_fd.store(-1, Ordering::Relaxed);
        self.pid.store(0, Ordering::Release);
    }
}

/// Server-wide counters in the registry tail.
#[repr(C, align(64))]
struct ServerHeader {
    started_childs: AtomicU32,
    closed_childs: AtomicU32,
    crashed_childs: AtomicU32,
    generation: AtomicU32,
    history_requests: AtomicU64,
}

/// Named fixed-size regions carved from the registry tail. All
/// registrations must happen before the monitor's first fork.
pub struct BlobRegistry {
    defs: Mutex<Vec<BlobDef>>,
    frozen: AtomicBool,
}

#[derive(Debug, Clone)]
struct BlobDef {
    name: String,
    offset: usize,
    size: usize,
}

impl Default for BlobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            defs: Mutex::new(Vec::new()),
            frozen: AtomicBool::new(false),
        }
    }

    pub fn register(&self, name: &str, size: usize) -> StatResult<usize> {
        if self.frozen.load(Ordering::Acquire) {
            return Err(StatError::BlobRegistry("frozen after fork".to_string()));
        }
        let mut defs = self.defs.lock();
        if let Some(id) = defs.iter().position(|d| d.name == name) {
            if defs[id].size != size {
                return Err(StatError::BlobRegistry(format!(
                    "blob {:?} re-registered with a different size",
                    name
                )));
            }
            return Ok(id);
        }
        let offset = defs
            .last()
            .map(|d| d.offset + align8(d.size))
            .unwrap_or(0);
        defs.push(BlobDef {
            name: name.to_string(),
            offset,
            size,
        });
        Ok(defs.len() - 1)
    }

    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn area_size(&self) -> usize {
        self.defs
            .lock()
            .last()
            .map(|d| d.offset + align8(d.size))
            .unwrap_or(0)
    }

    fn snapshot(&self) -> Vec<BlobDef> {
        self.defs.lock().clone()
    }
}

const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

const fn align64(n: usize) -> usize {
    (n + 63) & !63
}

struct RegionLayout {
    stats_off: usize,
    history_off: usize,
    hist_off: usize,
    hist_size: usize,
    header_off: usize,
    blobs_off: usize,
    total: usize,
}

/// Totals the supervisor scans on every tick.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegistryTotals {
    pub childs: usize,
    pub free_servers: i64,
    pub used_servers: i64,
    pub max_requests: u64,
}

pub struct ChildsRegistry {
    shm: SharedMem,
    kids: usize,
    stat_block_size: usize,
    layout: RegionLayout,
    queue_mutex: ProcMutex,
    accept_mutex: ProcMutex,
    stats: Arc<StatRegistry>,
    slot_types: Vec<StatType>,
    hist: Arc<HistogramRegistry>,
    blobs: Vec<BlobDef>,
}

impl ChildsRegistry {
    /// Freeze every registration table and lay the region out. Called by
    /// the monitor exactly once, before the first fork.
    pub fn create(
        config: &ServerConfig,
        stats: Arc<StatRegistry>,
        hist: Arc<HistogramRegistry>,
        blobs: &BlobRegistry,
    ) -> ServerResult<Self> {
        stats.freeze();
        hist.freeze();
        blobs.freeze();

        let kids = config.registry_slots();
        let stat_block_size = align8(stats.memblock_size());
        let hist_size = align8(hist.area_size());
        let blob_bytes = blobs.area_size();

        let stats_off = kids * SLOT_SIZE;
        let history_off = stats_off + kids * stat_block_size;
        let hist_off = history_off + stat_block_size;
        // The server header is cache-line aligned like the slots.
        let header_off = align64(hist_off + hist_size);
        let blobs_off = header_off + HEADER_SIZE;
        let total = blobs_off + blob_bytes;

        let layout = RegionLayout {
            stats_off,
            history_off,
            hist_off,
            hist_size,
            header_off,
            blobs_off,
            total,
        };

        let shm = SharedMem::create(config.shared_mem_scheme, "icapd-registry", total)?;
        let slot_types = stats.slot_types();

        let registry = Self {
            shm,
            kids,
            stat_block_size,
            layout,
            queue_mutex: ProcMutex::create(config.proc_mutex_scheme, "registry")?,
            accept_mutex: ProcMutex::create(config.proc_mutex_scheme, "accept")?,
            stats,
            slot_types,
            hist,
            blobs: blobs.snapshot(),
        };

        for i in 0..kids {
            registry.slot(i).clear();
        }
        // The history block is written only by the monitor during reaps.
        unsafe {
            StatMemblock::init(
                registry.at(registry.layout.history_off),
                registry.stat_block_size,
                registry.slot_types.len(),
            )?;
        }
        info!(
            "child registry ready: {} slots, {} bytes in {}",
            kids, total, registry.shm
        );
        Ok(registry)
    }

    #[inline]
    fn at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset <= self.layout.total);
        unsafe { NonNull::new_unchecked(self.shm.base().as_ptr().add(offset)) }
    }

    #[inline]
    #[must_use]
    pub fn kids(&self) -> usize {
        self.kids
    }

    #[inline]
    #[must_use]
    pub fn accept_mutex(&self) -> &ProcMutex {
        &self.accept_mutex
    }

    /// Slot view; slots are fixed for the life of the region.
    #[must_use]
    pub fn slot(&self, index: usize) -> &ChildSlot {
        assert!(index < self.kids);
        // Slots live at fixed 64-byte-aligned offsets inside the mapping,
        // which outlives self.
        unsafe { &*self.at(index * SLOT_SIZE).as_ptr().cast::<ChildSlot>() }
    }

    fn header(&self) -> &ServerHeader {
        unsafe { &*self.at(self.layout.header_off).as_ptr().cast::<ServerHeader>() }
    }

    /// The per-child statistics block for a slot.
    pub fn stats_block(&self, index: usize) -> StatResult<StatMemblock> {
        assert!(index < self.kids);
        unsafe {
            StatMemblock::attach(
                self.at(self.layout.stats_off + index * self.stat_block_size),
                self.stat_block_size,
            )
        }
    }

    pub fn history_block(&self) -> StatResult<StatMemblock> {
        unsafe {
            StatMemblock::attach(self.at(self.layout.history_off), self.stat_block_size)
        }
    }

    pub fn bind_histograms(&self) -> StatResult<BoundHistograms> {
        unsafe {
            self.hist
                .bind(self.at(self.layout.hist_off), self.layout.hist_size)
        }
    }

    /// Claim a free slot for a freshly forked child. Runs in the child.
    pub fn register_child(&self, pid: Pid, servers: i32, pipe_fd: Fd) -> ServerResult<usize> {
        self.queue_mutex.lock()?;
        let result = (|| {
            for i in 0..self.kids {
                let slot = self.slot(i);
                if slot.pid() != 0 {
                    continue;
                }
                slot.servers.store(servers, Ordering::Relaxed);
                slot.used_servers.store(0, Ordering::Relaxed);
                slot.free_servers.store(servers, Ordering::Relaxed);
                slot.requests.store(0, Ordering::Relaxed);
                slot.connections.store(0, Ordering::Relaxed);
                slot.idle.store(1, Ordering::Relaxed);
                slot.to_be_killed.store(0, Ordering::Relaxed);
                slot.father_said.store(0, Ordering::Relaxed);
                slot.generation
                    .store(self.header().generation.load(Ordering::Relaxed), Ordering::Relaxed);
                slot.pipe_fd.store(pipe_fd, Ordering::Relaxed);
                unsafe {
                    StatMemblock::init(
                        self.at(self.layout.stats_off + i * self.stat_block_size),
                        self.stat_block_size,
                        self.slot_types.len(),
                    )?;
                }
                slot.pid.store(pid, Ordering::Release);
                debug!("child {} registered in slot {}", pid, i);
                return Ok(i);
            }
            Err(ServerError::Registry("no free child slot".to_string()))
        })();
        self.queue_mutex.unlock()?;
        result
    }

    /// Bump the started-children counter. The monitor calls this exactly
    /// once per child, on first observation of its registered slot.
    pub fn announce_child(&self) {
        self.header().started_childs.fetch_add(1, Ordering::Relaxed);
    }

    /// Free a reaped child's slot, folding its statistics into history.
    pub fn remove_child(&self, pid: Pid, crashed: bool) -> ServerResult<()> {
        self.queue_mutex.lock()?;
        let result = (|| {
            let Some(index) = self.position_of(pid) else {
                return Err(ServerError::Registry(format!(
                    "child {} not in registry",
                    pid
                )));
            };
            let slot = self.slot(index);
            let header = self.header();

            let closed = header.closed_childs.load(Ordering::Relaxed) as u64;
            let src = self.stats_block(index)?;
            self.history_block()?.merge(&src, &self.slot_types, closed);
            header
                .history_requests
                .fetch_add(slot.requests(), Ordering::Relaxed);

            header.closed_childs.fetch_add(1, Ordering::Relaxed);
            if crashed {
                header.crashed_childs.fetch_add(1, Ordering::Relaxed);
            }
            slot.clear();
            Ok(())
        })();
        self.queue_mutex.unlock()?;
        result
    }

    #[must_use]
    pub fn position_of(&self, pid: Pid) -> Option<usize> {
        (0..self.kids).find(|&i| self.slot(i).pid() == pid)
    }

    /// Bump the generation; newly registered children pick up the new one.
    pub fn next_generation(&self) -> u32 {
        self.header().generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[must_use]
    pub fn current_generation(&self) -> u32 {
        self.header().generation.load(Ordering::Relaxed)
    }

    /// Scan live slots, optionally restricted to one generation.
    #[must_use]
    pub fn totals(&self, generation: Option<u32>) -> RegistryTotals {
        let mut t = RegistryTotals::default();
        for i in 0..self.kids {
            let slot = self.slot(i);
            if slot.pid() == 0 {
                continue;
            }
            if generation.map(|g| slot.generation() != g).unwrap_or(false) {
                continue;
            }
            t.childs += 1;
            t.free_servers += slot.free_servers() as i64;
            t.used_servers += slot.used_servers() as i64;
            t.max_requests = t.max_requests.max(slot.requests());
        }
        t
    }

    /// The idle child with the most served requests, for scale-down.
    #[must_use]
    pub fn find_idle_child(&self, generation: Option<u32>) -> Option<usize> {
        let mut best: Option<(usize, u64)> = None;
        for i in 0..self.kids {
            let slot = self.slot(i);
            if slot.pid() == 0 || slot.used_servers() != 0 || !slot.is_idle() {
                continue;
            }
            if generation.map(|g| slot.generation() != g).unwrap_or(false) {
                continue;
            }
            if slot.terminate() != Terminate::None {
                continue;
            }
            if best.map(|(_, r)| slot.requests() > r).unwrap_or(true) {
                best = Some((i, slot.requests()));
            }
        }
        best.map(|(i, _)| i)
    }

    /// A child that served at least `max_requests`, for rolling restart.
    #[must_use]
    pub fn find_overworked_child(&self, max_requests: u64) -> Option<usize> {
        if max_requests == 0 {
            return None;
        }
        (0..self.kids).find(|&i| {
            let slot = self.slot(i);
            slot.pid() != 0
                && slot.requests() >= max_requests
                && slot.terminate() == Terminate::None
        })
    }

    #[must_use]
    pub fn started_childs(&self) -> u32 {
        self.header().started_childs.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn closed_childs(&self) -> u32 {
        self.header().closed_childs.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn crashed_childs(&self) -> u32 {
        self.header().crashed_childs.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn history_requests(&self) -> u64 {
        self.header().history_requests.load(Ordering::Relaxed)
    }

    /// Aggregate raw slot values across live children ("running"), or
    /// across live children plus history ("global"). Counters and KB
    /// accumulators sum; time and mean slots divide by live count or by
    /// live-plus-closed respectively.
    pub fn aggregate(&self, include_history: bool) -> StatResult<Vec<u64>> {
        let n = self.slot_types.len();
        let mut sums = vec![0u64; n];
        let mut live = 0u64;
        for i in 0..self.kids {
            if self.slot(i).pid() == 0 {
                continue;
            }
            live += 1;
            let block = self.stats_block(i)?;
            for (id, sum) in sums.iter_mut().enumerate() {
                *sum += block.get(id);
            }
        }

        let closed = if include_history {
            self.closed_childs() as u64
        } else {
            0
        };
        let history = if include_history {
            Some(self.history_block()?)
        } else {
            None
        };

        let mut out = vec![0u64; n];
        for id in 0..n {
            let hist_v = history.as_ref().map(|h| h.get(id)).unwrap_or(0);
            out[id] = match self.slot_types[id] {
                StatType::Counter | StatType::Kbs => sums[id] + hist_v,
                StatType::TimeUs | StatType::TimeMs | StatType::IntMean => {
                    let instances = live + closed;
                    if instances == 0 {
                        0
                    } else {
                        (sums[id] + hist_v * closed) / instances
                    }
                }
            };
        }
        Ok(out)
    }

    #[must_use]
    pub fn stat_registry(&self) -> &Arc<StatRegistry> {
        &self.stats
    }

    #[must_use]
    pub fn find_blob(&self, name: &str) -> Option<usize> {
        self.blobs.iter().position(|d| d.name == name)
    }

    /// Copy into a registered blob. Single-writer by convention.
    pub fn write_blob(&self, id: usize, data: &[u8]) -> StatResult<()> {
        let def = self
            .blobs
            .get(id)
            .ok_or_else(|| StatError::BlobRegistry(format!("unknown blob id {}", id)))?;
        if data.len() > def.size {
            return Err(StatError::BlobRegistry(format!(
                "blob {:?} overflow: {} > {}",
                def.name,
                data.len(),
                def.size
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.at(self.layout.blobs_off + def.offset).as_ptr(),
                data.len(),
            );
        }
        Ok(())
    }

    /// Copy a registered blob out.
    pub fn read_blob(&self, id: usize) -> StatResult<Vec<u8>> {
        let def = self
            .blobs
            .get(id)
            .ok_or_else(|| StatError::BlobRegistry(format!("unknown blob id {}", id)))?;
        let mut out = vec![0u8; def.size];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.at(self.layout.blobs_off + def.offset).as_ptr(),
                out.as_mut_ptr(),
                def.size,
            );
        }
        Ok(out)
    }

    /// Tear the registry down: remove the mutexes and unlink the region.
    /// Monitor only, after every child is gone; the local mapping stays
    /// valid until the registry is dropped.
    pub fn teardown(&self) -> ServerResult<()> {
        self.queue_mutex.destroy()?;
        self.accept_mutex.destroy()?;
        self.shm.remove();
        Ok(())
    }
}
