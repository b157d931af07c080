/*!
 * Server Configuration
 *
 * Tunables for the supervisor and the per-child pipelines. Values start at
 * the traditional defaults and are adjusted from the command line; parsing
 * a configuration file is the business of an outer layer.
 */

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::types::Protocol;
use crate::ipc::{ProcMutexScheme, SharedMemScheme};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Bind address; `None` means every interface.
    pub address: Option<IpAddr>,
    pub port: u16,
    pub proto: Protocol,
    pub tls: bool,
}

impl ListenerConfig {
    #[must_use]
    pub fn icap(port: u16) -> Self {
        Self {
            address: None,
            port,
            proto: Protocol::Icap,
            tls: false,
        }
    }

    /// Field-by-field endpoint comparison; reconfigure keeps the socket of
    /// every listener whose tuple did not change.
    #[must_use]
    pub fn same_endpoint(&self, other: &ListenerConfig) -> bool {
        self == other
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub start_servers: usize,
    pub max_servers: usize,
    pub threads_per_child: usize,
    pub min_spare_threads: usize,
    pub max_spare_threads: usize,
    /// Requests a child serves before it is rolled over; zero disables.
    pub max_requests_per_child: u64,
    pub keepalive_timeout: Duration,
    pub max_keepalive_requests: i32,
    pub max_secs_to_linger: Duration,
    pub child_shutdown_timeout: Duration,
    pub listeners: Vec<ListenerConfig>,
    pub control_fifo: PathBuf,
    pub pid_file: PathBuf,
    pub proc_mutex_scheme: ProcMutexScheme,
    pub shared_mem_scheme: SharedMemScheme,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            start_servers: 3,
            max_servers: 10,
            threads_per_child: 10,
            min_spare_threads: 10,
            max_spare_threads: 20,
            max_requests_per_child: 0,
            keepalive_timeout: Duration::from_secs(15),
            max_keepalive_requests: crate::core::limits::MAX_KEEPALIVE_REQUESTS,
            max_secs_to_linger: Duration::from_secs(5),
            child_shutdown_timeout: Duration::from_secs(
                crate::core::limits::CHILD_SHUTDOWN_TIMEOUT_SECS,
            ),
            listeners: vec![ListenerConfig::icap(1344)],
            control_fifo: PathBuf::from("/tmp/icapd.ctl"),
            pid_file: PathBuf::from("/tmp/icapd.pid"),
            proc_mutex_scheme: ProcMutexScheme::PosixSem,
            shared_mem_scheme: SharedMemScheme::Mmap,
        }
    }
}

impl ServerConfig {
    /// Clamp inconsistent settings the way the supervisor expects them.
    pub fn normalize(&mut self) {
        if self.start_servers > self.max_servers {
            self.start_servers = self.max_servers;
        }
        if self.threads_per_child == 0 {
            self.threads_per_child = 1;
        }
        if self.start_servers == 0 {
            self.start_servers = 1;
        }
    }

    /// Capacity of the child registry; generous so a reconfigure's old
    /// generation and its replacements coexist.
    #[must_use]
    pub fn registry_slots(&self) -> usize {
        2 * self.max_servers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_clamps_start_servers() {
        let mut cfg = ServerConfig {
            start_servers: 50,
            ..Default::default()
        };
        cfg.normalize();
        assert_eq!(cfg.start_servers, cfg.max_servers);
    }

    #[test]
    fn listener_tuple_comparison() {
        let a = ListenerConfig::icap(1344);
        let mut b = a.clone();
        assert!(a.same_endpoint(&b));
        b.port = 1345;
        assert!(!a.same_endpoint(&b));
        let mut c = a.clone();
        c.proto = Protocol::Http;
        assert!(!a.same_endpoint(&c));
    }
}
