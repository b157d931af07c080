/*!
 * Child Lifecycle
 *
 * A forked child claims a registry slot, spins up its worker pool and
 * acceptor, then sits on the monitor's control pipe until it is told to
 * stop, the monitor disappears, or a signal arrives. Termination is
 * cooperative: flags in the shared slot, observed at every suspension
 * point.
 */

use parking_lot::{Condvar, Mutex};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use super::acceptor::run_acceptor;
use super::commands::{flags, CommandRegistry};
use super::listener::Listener;
use super::registry::{ChildSlot, ChildsRegistry};
use super::signals;
use super::worker::{run_worker, RequestHandler};
use super::StatIds;
use crate::config::ServerConfig;
use crate::core::limits::COMMANDS_BUFFER_SIZE;
use crate::core::types::Terminate;
use crate::mem::{BufferPools, ObjectPools};
use crate::queue::ConnQueue;
use crate::stats::StatMemblock;

/// I/O scratch class registered in each child's object pools.
const REQUEST_BUF_SIZE: usize = 32 * 1024;

/// Everything a child's threads share.
pub struct ChildContext {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<ChildsRegistry>,
    pub slot_index: usize,
    pub queue: Arc<ConnQueue>,
    pub listeners: Arc<Vec<Listener>>,
    pub commands: Arc<CommandRegistry>,
    pub memblock: StatMemblock,
    pub stat_ids: StatIds,
    pub buffers: Arc<BufferPools>,
    pub objects: Arc<ObjectPools>,
    pub request_buf_class: usize,
    start_gate: Mutex<bool>,
    start_cond: Condvar,
    free_mutex: Mutex<()>,
    free_cond: Condvar,
    acceptor_live: AtomicBool,
    live_workers: AtomicUsize,
}

impl ChildContext {
    /// Wire up the per-child world around an already-claimed slot. Also
    /// used by the in-process test harness, which is why it is public.
    pub fn build(
        config: Arc<ServerConfig>,
        registry: Arc<ChildsRegistry>,
        slot_index: usize,
        listeners: Arc<Vec<Listener>>,
        commands: Arc<CommandRegistry>,
        memblock: StatMemblock,
        stat_ids: StatIds,
    ) -> Arc<Self> {
        let buffers = BufferPools::new();
        let objects = ObjectPools::new();
        let request_buf_class = objects.register(REQUEST_BUF_SIZE);
        Arc::new(ChildContext {
            queue: Arc::new(ConnQueue::new(config.threads_per_child)),
            live_workers: AtomicUsize::new(config.threads_per_child),
            config,
            registry,
            slot_index,
            listeners,
            commands,
            memblock,
            stat_ids,
            buffers,
            objects,
            request_buf_class,
            start_gate: Mutex::new(false),
            start_cond: Condvar::new(),
            free_mutex: Mutex::new(()),
            free_cond: Condvar::new(),
            acceptor_live: AtomicBool::new(true),
        })
    }

    #[inline]
    #[must_use]
    pub fn slot(&self) -> &ChildSlot {
        self.registry.slot(self.slot_index)
    }

    #[inline]
    #[must_use]
    pub fn terminate_level(&self) -> Terminate {
        self.slot().terminate()
    }

    pub fn request_terminate(&self, level: Terminate) {
        self.slot().request_terminate(level);
    }

    /// Block the acceptor until the workers are up and the monitor has not
    /// already asked for shutdown.
    pub fn wait_start_gate(&self) {
        let mut open = self.start_gate.lock();
        while !*open && self.terminate_level() == Terminate::None {
            self.start_cond.wait_for(&mut open, Duration::from_millis(200));
        }
    }

    pub fn open_start_gate(&self) {
        let mut open = self.start_gate.lock();
        *open = true;
        self.start_cond.notify_all();
    }

    /// Worker-side notification that a request finished.
    pub fn signal_free_worker(&self) {
        let _guard = self.free_mutex.lock();
        self.free_cond.notify_all();
    }

    pub fn wait_free_worker(&self, timeout: Duration) {
        let mut guard = self.free_mutex.lock();
        self.free_cond.wait_for(&mut guard, timeout);
    }

    pub fn mark_worker_done(&self) {
        self.live_workers.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn mark_acceptor_done(&self) {
        self.acceptor_live.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn acceptor_alive(&self) -> bool {
        self.acceptor_live.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::Acquire)
    }
}

/// Run one worker child to completion; the return value becomes the
/// process exit code. Called right after fork (or directly in
/// single-process mode).
pub fn child_main(
    config: Arc<ServerConfig>,
    registry: Arc<ChildsRegistry>,
    listeners: Arc<Vec<Listener>>,
    commands: Arc<CommandRegistry>,
    handler: Arc<dyn RequestHandler>,
    pipe_read: OwnedFd,
) -> i32 {
    let pid = std::process::id() as i32;
    // A fork carries the parent's pending flags along; start clean, and
    // hold SIGTERM until the workers exist.
    signals::reset_flags();
    if signals::ignore_sigterm().is_err() {
        error!("child {}: cannot set signal dispositions", pid);
        return 1;
    }

    let slot_index =
        match registry.register_child(pid, config.threads_per_child as i32, pipe_read.as_raw_fd()) {
            Ok(i) => i,
            Err(e) => {
                error!("child {}: registration failed: {}", pid, e);
                return 1;
            }
        };
    let memblock = match registry.stats_block(slot_index) {
        Ok(b) => b,
        Err(e) => {
            error!("child {}: stats block: {}", pid, e);
            return 1;
        }
    };
    let stat_ids = match StatIds::lookup(registry.stat_registry()) {
        Ok(ids) => ids,
        Err(e) => {
            error!("child {}: stat ids: {}", pid, e);
            return 1;
        }
    };

    let ctx = ChildContext::build(
        Arc::clone(&config),
        Arc::clone(&registry),
        slot_index,
        listeners,
        Arc::clone(&commands),
        memblock,
        stat_ids,
    );

    let mut threads = Vec::with_capacity(config.threads_per_child + 1);
    for i in 0..config.threads_per_child {
        let ctx = Arc::clone(&ctx);
        let handler = Arc::clone(&handler);
        threads.push(
            std::thread::Builder::new()
                .name(format!("worker-{}", i))
                .spawn(move || run_worker(ctx, handler))
                .expect("spawn worker thread"),
        );
    }
    {
        let ctx = Arc::clone(&ctx);
        threads.push(
            std::thread::Builder::new()
                .name("acceptor".to_string())
                .spawn(move || run_acceptor(ctx))
                .expect("spawn acceptor thread"),
        );
    }

    if signals::install_child_handlers().is_err() {
        error!("child {}: cannot install signal handlers", pid);
        ctx.request_terminate(Terminate::Immediately);
    }

    commands.run_flagged(flags::CHILD_START);
    ctx.open_start_gate();
    info!(
        "child {} serving with {} workers (slot {})",
        pid, config.threads_per_child, slot_index
    );

    control_loop(&ctx, &pipe_read);

    // Wind down: stop the queue, give workers the shutdown window, then
    // abandon whatever is still stuck (process exit reaps the threads).
    ctx.queue.shutdown();
    let deadline = Instant::now() + config.child_shutdown_timeout;
    while ctx.live_workers() > 0 && Instant::now() < deadline {
        ctx.queue.shutdown();
        std::thread::sleep(Duration::from_millis(100));
    }
    if ctx.live_workers() > 0 {
        warn!(
            "child {}: {} workers still running at shutdown deadline",
            pid,
            ctx.live_workers()
        );
    }
    for t in threads {
        if ctx.live_workers() == 0 && !ctx.acceptor_alive() {
            let _ = t.join();
        } else {
            drop(t); // leave stuck threads behind; the process is exiting
            break;
        }
    }

    commands.run_flagged(flags::CHILD_STOP);
    ctx.queue.clear();
    info!("child {} exiting", pid);
    0
}

/// Wait on the control pipe, translating signals, monitor commands and
/// parent death into the slot's termination flag.
fn control_loop(ctx: &ChildContext, pipe_read: &OwnedFd) {
    let mut line_buf = Vec::new();
    loop {
        if signals::take_child_term() {
            // SIGTERM: the level is whatever the monitor announced first;
            // an unannounced TERM means the parent is in a hurry.
            let level = match ctx.slot().father_said() {
                Terminate::None => Terminate::Immediately,
                announced => announced,
            };
            ctx.request_terminate(level);
        }
        if ctx.terminate_level() != Terminate::None {
            return;
        }
        if !ctx.acceptor_alive() {
            warn!("acceptor died unexpectedly, terminating child");
            ctx.request_terminate(Terminate::Immediately);
            return;
        }

        ctx.commands.exec_scheduled(Instant::now());

        let mut fds = [PollFd::new(pipe_read.as_fd(), PollFlags::POLLIN)];
        let readable = match poll(&mut fds, PollTimeout::from(1000u16)) {
            Ok(n) if n > 0 => fds[0]
                .revents()
                .map(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))
                .unwrap_or(false),
            _ => false,
        };
        if !readable {
            continue;
        }

        let mut chunk = [0u8; COMMANDS_BUFFER_SIZE];
        match nix::unistd::read(pipe_read.as_raw_fd(), &mut chunk) {
            Ok(0) => {
                // EOF: the monitor is gone.
                warn!("control pipe closed, terminating immediately");
                ctx.request_terminate(Terminate::Immediately);
                return;
            }
            Ok(n) => {
                line_buf.extend_from_slice(&chunk[..n]);
                while let Some(pos) = line_buf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = line_buf.drain(..=pos).collect();
                    if let Ok(text) = std::str::from_utf8(&line[..line.len() - 1]) {
                        debug!("control pipe command: {:?}", text);
                        ctx.commands.execute_line(text, flags::CHILDREN);
                    }
                }
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                warn!("control pipe read failed: {}, terminating", e);
                ctx.request_terminate(Terminate::Immediately);
                return;
            }
        }
    }
}
