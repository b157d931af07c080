/*!
 * Monitor Process
 *
 * The supervisor: owns the listen sockets and the shared registry, forks
 * the worker children, feeds them control commands, reaps them when they
 * exit and scales the pool against load. One tick per second, driven by
 * the control-FIFO poll timeout.
 */

use ahash::{HashMap, HashSet};
use parking_lot::Mutex;
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid as NixPid};

use super::child::child_main;
use super::commands::{flags, CommandRegistry};
use super::listener::{rebind_listeners, Listener};
use super::registry::{BlobRegistry, ChildsRegistry};
use super::signals;
use super::worker::RequestHandler;
use super::StatIds;
use crate::config::ServerConfig;
use crate::core::limits::CHILD_REAP_SPIN_MS;
use crate::core::tokenizer::split_args;
use crate::core::errors::ServerError;
use crate::core::types::{Pid, ServerResult, Terminate};
use crate::stats::{HistogramRegistry, StatRegistry};

pub struct Monitor {
    config: Arc<ServerConfig>,
    registry: Arc<ChildsRegistry>,
    listeners: Arc<Vec<Listener>>,
    commands: Arc<CommandRegistry>,
    handler: Arc<dyn RequestHandler>,
    child_pipes: Mutex<HashMap<Pid, OwnedFd>>,
    /// Pids whose registered slot has been seen, so `started_childs` is
    /// bumped exactly once per child and never for one that died before
    /// claiming a slot.
    announced: HashSet<Pid>,
    fifo: Option<File>,
    fifo_buf: Vec<u8>,
    stop_flag: Arc<AtomicBool>,
    reconfigure_flag: Arc<AtomicBool>,
    saturation_warned: bool,
}

impl Monitor {
    /// Build the whole pre-fork world: registries, listen sockets, control
    /// FIFO, PID file, signal dispositions and built-in commands.
    pub fn new(mut config: ServerConfig, handler: Arc<dyn RequestHandler>) -> ServerResult<Self> {
        config.normalize();

        let stats = Arc::new(StatRegistry::new());
        StatIds::register(&stats)?;
        let histograms = Arc::new(HistogramRegistry::new());
        let blobs = BlobRegistry::new();

        let mut listeners = Vec::new();
        for cfg in &config.listeners {
            listeners.push(Listener::bind(cfg.clone())?);
        }

        let registry = Arc::new(ChildsRegistry::create(
            &config,
            Arc::clone(&stats),
            histograms,
            &blobs,
        )?);

        write_pid_file(&config)?;
        let fifo = open_control_fifo(&config)?;
        signals::install_monitor_handlers()?;

        let commands = Arc::new(CommandRegistry::new());
        let stop_flag = Arc::new(AtomicBool::new(false));
        let reconfigure_flag = Arc::new(AtomicBool::new(false));
        register_builtin_commands(
            &commands,
            &registry,
            Arc::clone(&stop_flag),
            Arc::clone(&reconfigure_flag),
        );

        Ok(Self {
            config: Arc::new(config),
            registry,
            listeners: Arc::new(listeners),
            commands,
            handler,
            child_pipes: Mutex::new(HashMap::default()),
            announced: HashSet::default(),
            fifo: Some(fifo),
            fifo_buf: Vec::new(),
            stop_flag,
            reconfigure_flag,
            saturation_warned: false,
        })
    }

    /// Supervisor main loop. Returns after an orderly shutdown.
    pub fn run(&mut self) -> ServerResult<()> {
        info!(
            "monitor {} starting {} children",
            std::process::id(),
            self.config.start_servers
        );
        for _ in 0..self.config.start_servers {
            self.spawn_child()?;
        }

        loop {
            if signals::terminate_requested() || self.stop_flag.load(Ordering::Relaxed) {
                self.shutdown();
                return Ok(());
            }
            if signals::take_reconfigure() || self.reconfigure_flag.swap(false, Ordering::Relaxed)
            {
                if let Err(e) = self.reconfigure() {
                    error!("reconfigure failed: {}", e);
                }
            }

            self.read_control_fifo();
            self.reap_children();
            self.announce_new_children();
            self.supervise();
            self.commands.exec_scheduled(Instant::now());
        }
    }

    fn spawn_child(&mut self) -> ServerResult<Pid> {
        let (pipe_read, pipe_write) =
            nix::unistd::pipe().map_err(|e| ServerError::ControlPipe(e.into()))?;

        match unsafe { fork() }.map_err(|e| ServerError::Fork(e.into()))? {
            ForkResult::Child => {
                drop(pipe_write);
                // Descriptors meant for the monitor: the FIFO and the other
                // children's pipe ends.
                self.fifo.take();
                self.child_pipes.lock().clear();

                let code = child_main(
                    Arc::clone(&self.config),
                    Arc::clone(&self.registry),
                    Arc::clone(&self.listeners),
                    Arc::clone(&self.commands),
                    Arc::clone(&self.handler),
                    pipe_read,
                );
                std::process::exit(code);
            }
            ForkResult::Parent { child } => {
                drop(pipe_read);
                let pid = child.as_raw();
                self.child_pipes.lock().insert(pid, pipe_write);
                debug!("spawned child {}", pid);
                Ok(pid)
            }
        }
    }

    /// Collect every exited child without blocking.
    fn reap_children(&mut self) {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    let crashed = code != 0;
                    if crashed {
                        warn!("child {} exited abnormally (code {})", pid, code);
                    } else {
                        info!("child {} exited cleanly", pid);
                    }
                    self.forget_child(pid.as_raw(), crashed);
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    warn!("child {} killed by signal {:?}", pid, sig);
                    self.forget_child(pid.as_raw(), true);
                }
                Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::ECHILD) => return,
                Ok(_) => continue,
                Err(e) => {
                    debug!("waitpid: {}", e);
                    return;
                }
            }
        }
    }

    fn forget_child(&mut self, pid: Pid, crashed: bool) {
        self.child_pipes.lock().remove(&pid);
        self.announced.remove(&pid);
        if let Err(e) = self.registry.remove_child(pid, crashed) {
            // A child that died before claiming a slot leaves no record,
            // and was never counted as started either.
            debug!("reap of {}: {}", pid, e);
        }
        self.commands.run_flagged(flags::CHILD_CLEANUP);
    }

    /// Count each child as started the first time its registered slot
    /// shows up, so `started_childs` stays balanced against
    /// `closed_childs` even if a fork dies before registering.
    fn announce_new_children(&mut self) {
        for i in 0..self.registry.kids() {
            let pid = self.registry.slot(i).pid();
            if pid != 0 && self.announced.insert(pid) {
                self.registry.announce_child();
            }
        }
    }

    /// The per-tick scaling decision over the current generation.
    fn supervise(&mut self) {
        let gen = self.registry.current_generation();
        let t = self.registry.totals(Some(gen));
        let cfg = Arc::clone(&self.config);

        // Rolling replacement of a child that served its quota.
        if let Some(idx) = self
            .registry
            .find_overworked_child(cfg.max_requests_per_child)
        {
            let pid = self.registry.slot(idx).pid();
            info!(
                "child {} served {} requests, rolling it over",
                pid,
                self.registry.slot(idx).requests()
            );
            if self.spawn_child().is_ok() {
                self.tell_child_to_die(idx, Terminate::Gracefully);
            }
            return;
        }

        let spare_after_one_less =
            t.free_servers - cfg.threads_per_child as i64;
        if t.free_servers >= cfg.max_spare_threads as i64
            && t.childs > cfg.start_servers
            && spare_after_one_less >= cfg.min_spare_threads as i64
        {
            // Scale down: retire the idle child that has served the most.
            if let Some(idx) = self.registry.find_idle_child(Some(gen)) {
                info!(
                    "{} spare threads, retiring idle child {}",
                    t.free_servers,
                    self.registry.slot(idx).pid()
                );
                self.tell_child_to_die(idx, Terminate::Gracefully);
            }
        } else if (t.free_servers <= cfg.min_spare_threads as i64
            && t.childs < cfg.max_servers)
            || t.childs < cfg.start_servers
        {
            if let Err(e) = self.spawn_child() {
                error!("cannot spawn child: {}", e);
            }
        }

        if t.childs == cfg.max_servers && t.free_servers < cfg.min_spare_threads as i64 {
            if !self.saturation_warned {
                warn!(
                    "server reached {} children with {} spare threads; raise MaxServers",
                    t.childs, t.free_servers
                );
                self.saturation_warned = true;
            }
        } else {
            self.saturation_warned = false;
        }
    }

    fn tell_child_to_die(&self, idx: usize, level: Terminate) {
        let slot = self.registry.slot(idx);
        let pid = slot.pid();
        if pid == 0 {
            return;
        }
        slot.set_father_said(level);
        if let Err(e) = kill(NixPid::from_raw(pid), Signal::SIGTERM) {
            warn!("SIGTERM to {} failed: {}", pid, e);
        }
    }

    /// Read and dispatch complete lines from the control FIFO. An EOF
    /// (every writer closed) re-opens the FIFO.
    fn read_control_fifo(&mut self) {
        let Some(fifo) = self.fifo.as_mut() else {
            return;
        };

        let mut fds = [PollFd::new(fifo.as_fd(), PollFlags::POLLIN)];
        let readable = match poll(&mut fds, PollTimeout::from(1000u16)) {
            Ok(n) if n > 0 => true,
            _ => false,
        };
        if !readable {
            return;
        }

        let mut chunk = [0u8; 512];
        match fifo.read(&mut chunk) {
            Ok(0) => {
                // Writer side closed; re-open so the next command blocks in
                // the FIFO instead of spinning EOF.
                if let Ok(fresh) = open_control_fifo(&self.config) {
                    self.fifo = Some(fresh);
                }
            }
            Ok(n) => {
                self.fifo_buf.extend_from_slice(&chunk[..n]);
                while let Some(pos) = self.fifo_buf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = self.fifo_buf.drain(..=pos).collect();
                    if let Ok(text) = std::str::from_utf8(&line[..line.len() - 1]) {
                        self.dispatch_command_line(text.trim());
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => warn!("control FIFO read failed: {}", e),
        }
    }

    /// Monitor-side command dispatch: run locally, broadcast to children,
    /// then run the post hook.
    fn dispatch_command_line(&self, line: &str) {
        if line.is_empty() {
            return;
        }
        let argv = split_args(line);
        let Some(name) = argv.first() else { return };
        let Some(cmd) = self.commands.find(name) else {
            warn!("unknown control command {:?}", name);
            return;
        };
        info!("control command: {}", line);
        if cmd.flags & flags::MONITOR != 0 {
            cmd.run(&argv[1..], None);
        }
        if cmd.flags & flags::CHILDREN != 0 {
            self.broadcast_to_children(line);
        }
        if cmd.flags & flags::MONITOR_POST != 0 {
            cmd.run(&argv[1..], None);
        }
    }

    fn broadcast_to_children(&self, line: &str) {
        let mut message = line.as_bytes().to_vec();
        message.push(b'\n');
        for (pid, pipe) in self.child_pipes.lock().iter() {
            if let Err(e) = nix::unistd::write(pipe.as_fd(), &message) {
                warn!("cannot forward command to child {}: {}", pid, e);
            }
        }
    }

    /// SIGHUP: retire the current generation gracefully, refresh listeners
    /// whose tuple changed, and start a fresh generation.
    fn reconfigure(&mut self) -> ServerResult<()> {
        info!("reconfigure: retiring generation {}", self.registry.current_generation());
        for i in 0..self.registry.kids() {
            if self.registry.slot(i).pid() != 0 {
                self.tell_child_to_die(i, Terminate::Gracefully);
            }
        }
        self.registry.next_generation();

        let old = Arc::try_unwrap(std::mem::replace(
            &mut self.listeners,
            Arc::new(Vec::new()),
        ))
        .map_err(|_| ServerError::Registry("listeners still shared".to_string()))?;
        self.listeners = Arc::new(rebind_listeners(old, &self.config.listeners)?);

        for _ in 0..self.config.start_servers {
            self.spawn_child()?;
        }
        self.saturation_warned = false;
        Ok(())
    }

    /// Orderly shutdown: tell every child to stop immediately, collect
    /// them within the bounded window, then tear the registry down.
    pub fn shutdown(&mut self) {
        info!("monitor shutting down");
        let mut live = 0usize;
        for i in 0..self.registry.kids() {
            let slot = self.registry.slot(i);
            let pid = slot.pid();
            if pid == 0 {
                continue;
            }
            live += 1;
            slot.set_father_said(Terminate::Immediately);
            let _ = kill(NixPid::from_raw(pid), Signal::SIGTERM);
        }

        let deadline = Instant::now()
            + self.config.child_shutdown_timeout
            + Duration::from_millis(CHILD_REAP_SPIN_MS) * live as u32;
        loop {
            self.reap_children();
            if self.registry.totals(None).childs == 0 {
                break;
            }
            if Instant::now() >= deadline {
                for i in 0..self.registry.kids() {
                    let pid = self.registry.slot(i).pid();
                    if pid != 0 {
                        warn!("child {} ignored shutdown, killing", pid);
                        let _ = kill(NixPid::from_raw(pid), Signal::SIGKILL);
                    }
                }
                self.reap_children();
                break;
            }
            std::thread::sleep(Duration::from_millis(CHILD_REAP_SPIN_MS));
        }

        self.child_pipes.lock().clear();
        self.fifo.take();
        let _ = std::fs::remove_file(&self.config.control_fifo);
        let _ = std::fs::remove_file(&self.config.pid_file);
        if let Err(e) = self.registry.teardown() {
            warn!("registry teardown: {}", e);
        }
        info!("monitor exited cleanly");
    }
}

/// `-S` mode: no supervisor, one child's worker pool in this process.
/// Useful under debuggers and in tests.
pub fn run_single_process(
    mut config: ServerConfig,
    handler: Arc<dyn RequestHandler>,
) -> ServerResult<i32> {
    config.normalize();

    let stats = Arc::new(StatRegistry::new());
    StatIds::register(&stats)?;
    let registry = Arc::new(ChildsRegistry::create(
        &config,
        stats,
        Arc::new(HistogramRegistry::new()),
        &BlobRegistry::new(),
    )?);

    let mut listeners = Vec::new();
    for cfg in &config.listeners {
        listeners.push(Listener::bind(cfg.clone())?);
    }

    // The write end stays open in this process so the control pipe never
    // reports parent death.
    let (pipe_read, _pipe_write) =
        nix::unistd::pipe().map_err(|e| ServerError::ControlPipe(e.into()))?;

    info!("single-process mode: serving without a supervisor");
    let code = child_main(
        Arc::new(config),
        Arc::clone(&registry),
        Arc::new(listeners),
        Arc::new(CommandRegistry::new()),
        handler,
        pipe_read,
    );
    let _ = registry.teardown();
    Ok(code)
}

/// `stop`, `reconfigure`, `dump_statistics` and `test` are always present.
fn register_builtin_commands(
    commands: &Arc<CommandRegistry>,
    registry: &Arc<ChildsRegistry>,
    stop_flag: Arc<AtomicBool>,
    reconfigure_flag: Arc<AtomicBool>,
) {
    commands.register_args("stop", flags::MONITOR, move |_, _| {
        stop_flag.store(true, Ordering::Relaxed);
    });
    commands.register_args("reconfigure", flags::MONITOR, move |_, _| {
        reconfigure_flag.store(true, Ordering::Relaxed);
    });
    {
        let registry = Arc::clone(registry);
        commands.register_args("dump_statistics", flags::MONITOR, move |_, _| {
            match registry.aggregate(true) {
                Ok(values) => {
                    let snapshot = registry.stat_registry().describe(&values);
                    match serde_json::to_string_pretty(&snapshot) {
                        Ok(json) => info!("statistics dump:\n{}", json),
                        Err(e) => warn!("cannot serialize statistics: {}", e),
                    }
                }
                Err(e) => warn!("cannot aggregate statistics: {}", e),
            }
        });
    }
    commands.register_args("test", flags::ALL, |_, args| {
        info!("test command: {:?}", args);
    });
}

fn write_pid_file(config: &ServerConfig) -> ServerResult<()> {
    if let Ok(existing) = std::fs::read_to_string(&config.pid_file) {
        if let Ok(pid) = existing.trim().parse::<i32>() {
            if kill(NixPid::from_raw(pid), None).is_ok() {
                return Err(ServerError::AlreadyRunning(pid));
            }
            warn!("removing stale pid file of dead process {}", pid);
        }
    }
    std::fs::write(&config.pid_file, format!("{}\n", std::process::id())).map_err(|e| {
        ServerError::PidFile {
            path: config.pid_file.display().to_string(),
            reason: e.to_string(),
        }
    })
}

fn open_control_fifo(config: &ServerConfig) -> ServerResult<File> {
    use nix::sys::stat::Mode;

    let path = &config.control_fifo;
    match nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o660)) {
        Ok(()) => {}
        Err(nix::errno::Errno::EEXIST) => {}
        Err(e) => {
            return Err(ServerError::ControlFifo(
                path.display().to_string(),
                e.into(),
            ))
        }
    }
    std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map_err(|e| ServerError::ControlFifo(path.display().to_string(), e))
}
