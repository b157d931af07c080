/*!
 * Command Bus
 *
 * Process-wide command descriptors plus a scheduled-future queue. The
 * monitor reads lines from the control FIFO, runs `MONITOR`-flagged
 * commands locally, broadcasts `CHILDREN`-flagged lines to every child's
 * control pipe, and runs `MONITOR_POST` callbacks after the broadcast.
 * Children drain their pipe and run the `CHILDREN` side. Lifecycle hooks
 * (`CHILD_START`, `CHILD_STOP`, `CHILD_CLEANUP`) fire at spawn, before
 * exit, and on the monitor after a reap.
 */

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};

use crate::containers::List;
use crate::core::tokenizer::split_args;

pub mod flags {
    pub const MONITOR: u32 = 1;
    pub const CHILDREN: u32 = 2;
    pub const MONITOR_POST: u32 = 4;
    pub const ALL: u32 = 7;
    pub const CHILD_START: u32 = 8;
    pub const CHILD_STOP: u32 = 16;
    pub const ON_DEMAND: u32 = 32;
    pub const CHILD_CLEANUP: u32 = 64;
}

/// A command either takes the parsed argument list or an opaque data
/// string carried by the scheduler.
#[derive(Clone)]
pub enum CmdAction {
    Args(Arc<dyn Fn(&str, &[String]) + Send + Sync>),
    Data(Arc<dyn Fn(&str, Option<&str>) + Send + Sync>),
}

#[derive(Clone)]
pub struct Command {
    pub name: String,
    pub flags: u32,
    action: CmdAction,
}

impl Command {
    pub fn run(&self, args: &[String], data: Option<&str>) {
        debug!("executing command {:?}", self.name);
        match &self.action {
            CmdAction::Args(f) => f(&self.name, args),
            CmdAction::Data(f) => f(&self.name, data),
        }
    }
}

struct Scheduled {
    name: String,
    data: Option<String>,
    fire_at: Instant,
}

pub struct CommandRegistry {
    commands: Mutex<Vec<Command>>,
    scheduled: Mutex<List<Scheduled>>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
            scheduled: Mutex::new(List::new()),
        }
    }

    pub fn register_args<F>(&self, name: &str, cmd_flags: u32, action: F)
    where
        F: Fn(&str, &[String]) + Send + Sync + 'static,
    {
        self.register(name, cmd_flags, CmdAction::Args(Arc::new(action)));
    }

    pub fn register_data<F>(&self, name: &str, cmd_flags: u32, action: F)
    where
        F: Fn(&str, Option<&str>) + Send + Sync + 'static,
    {
        self.register(name, cmd_flags, CmdAction::Data(Arc::new(action)));
    }

    fn register(&self, name: &str, cmd_flags: u32, action: CmdAction) {
        let mut commands = self.commands.lock();
        // Re-registration replaces, so reconfigure can rebind callbacks.
        commands.retain(|c| c.name != name);
        commands.push(Command {
            name: name.to_string(),
            flags: cmd_flags,
            action,
        });
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<Command> {
        self.commands.lock().iter().find(|c| c.name == name).cloned()
    }

    /// Parse one line and run it if the named command carries any of
    /// `mask`. Returns the matched command so dispatchers can inspect the
    /// remaining flags (broadcast, post hooks).
    pub fn execute_line(&self, line: &str, mask: u32) -> Option<Command> {
        let argv = split_args(line.trim());
        let name = argv.first()?;
        let Some(cmd) = self.find(name) else {
            warn!("unknown command {:?}", name);
            return None;
        };
        if cmd.flags & mask != 0 {
            cmd.run(&argv[1..], None);
        }
        Some(cmd)
    }

    /// Run every command carrying `flag` (lifecycle hook points).
    pub fn run_flagged(&self, flag: u32) {
        let to_run: Vec<Command> = self
            .commands
            .lock()
            .iter()
            .filter(|c| c.flags & flag != 0)
            .cloned()
            .collect();
        for cmd in to_run {
            cmd.run(&[], None);
        }
    }

    /// Queue `name` to fire at `fire_at` with optional user data.
    pub fn schedule(&self, name: &str, data: Option<String>, fire_at: Instant) {
        self.scheduled.lock().push_back(Scheduled {
            name: name.to_string(),
            data,
            fire_at,
        });
    }

    /// Fire and remove every scheduled command whose time has passed.
    pub fn exec_scheduled(&self, now: Instant) {
        let due = self
            .scheduled
            .lock()
            .drain_matching(|s| s.fire_at < now);
        for entry in due {
            match self.find(&entry.name) {
                Some(cmd) => cmd.run(&[], entry.data.as_deref()),
                None => warn!("scheduled command {:?} is gone", entry.name),
            }
        }
    }

    #[must_use]
    pub fn scheduled_len(&self) -> usize {
        self.scheduled.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn execute_line_respects_the_flag_mask() {
        let reg = CommandRegistry::new();
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        reg.register_args("stop", flags::MONITOR, move |_, _| {
            h.fetch_add(1, Ordering::Relaxed);
        });

        // Child-side mask must not run a monitor-only command.
        let cmd = reg.execute_line("stop", flags::CHILDREN).unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 0);
        assert_eq!(cmd.flags, flags::MONITOR);

        reg.execute_line("stop", flags::MONITOR).unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn arguments_are_tokenized() {
        let reg = CommandRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        reg.register_args("test", flags::ALL, move |_, args| {
            s.lock().extend(args.iter().cloned());
        });
        reg.execute_line(r#"test one "two words" three"#, flags::MONITOR);
        assert_eq!(*seen.lock(), vec!["one", "two words", "three"]);
    }

    #[test]
    fn scheduled_commands_fire_once_when_due() {
        let reg = CommandRegistry::new();
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        reg.register_data("refresh", flags::ON_DEMAND, move |_, data| {
            assert_eq!(data, Some("payload"));
            h.fetch_add(1, Ordering::Relaxed);
        });

        let now = Instant::now();
        reg.schedule("refresh", Some("payload".into()), now + Duration::from_millis(10));

        reg.exec_scheduled(now);
        assert_eq!(hits.load(Ordering::Relaxed), 0);
        assert_eq!(reg.scheduled_len(), 1);

        reg.exec_scheduled(now + Duration::from_millis(20));
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(reg.scheduled_len(), 0);
    }

    #[test]
    fn lifecycle_hooks_run_by_flag() {
        let reg = CommandRegistry::new();
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        reg.register_args("openers", flags::CHILD_START, move |_, _| {
            h.fetch_add(1, Ordering::Relaxed);
        });
        reg.run_flagged(flags::CHILD_STOP);
        assert_eq!(hits.load(Ordering::Relaxed), 0);
        reg.run_flagged(flags::CHILD_START);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn reregistration_replaces() {
        let reg = CommandRegistry::new();
        reg.register_args("x", flags::MONITOR, |_, _| {});
        reg.register_args("x", flags::CHILDREN, |_, _| {});
        assert_eq!(reg.find("x").unwrap().flags, flags::CHILDREN);
    }
}
