/*!
 * Server Module
 *
 * The accept-dispatch pipeline and the process tree around it: listeners,
 * connections, the per-child acceptor/worker threads, the shared-memory
 * child registry, the command bus and the supervising monitor.
 */

pub mod acceptor;
pub mod child;
pub mod commands;
pub mod connection;
pub mod listener;
pub mod monitor;
pub mod registry;
pub mod signals;
pub mod worker;

pub use child::{child_main, ChildContext};
pub use connection::Connection;
pub use listener::{rebind_listeners, Listener};
pub use monitor::Monitor;
pub use registry::{BlobRegistry, ChildSlot, ChildsRegistry, RegistryTotals};
pub use worker::{HandlerOutcome, OptionsHandler, Request, RequestHandler};

use crate::core::errors::StatError;
use crate::core::types::StatResult;
use crate::stats::{StatRegistry, StatType};

/// Slot ids of the counters every worker updates. Registered by the
/// monitor before the registry freezes; children look the ids back up.
#[derive(Debug, Clone, Copy)]
pub struct StatIds {
    pub requests: usize,
    pub failed_requests: usize,
    pub connections: usize,
    pub bytes_in: usize,
    pub bytes_out: usize,
    pub processing_time_ms: usize,
}

const GENERAL_GROUP: usize = 0;

impl StatIds {
    pub fn register(reg: &StatRegistry) -> StatResult<Self> {
        Ok(Self {
            requests: reg.register("REQUESTS", StatType::Counter, GENERAL_GROUP)?,
            failed_requests: reg.register("FAILED REQUESTS", StatType::Counter, GENERAL_GROUP)?,
            connections: reg.register("ACCEPTED CONNECTIONS", StatType::Counter, GENERAL_GROUP)?,
            bytes_in: reg.register("BYTES IN", StatType::Kbs, GENERAL_GROUP)?,
            bytes_out: reg.register("BYTES OUT", StatType::Kbs, GENERAL_GROUP)?,
            processing_time_ms: reg.register("PROCESSING TIME", StatType::TimeMs, GENERAL_GROUP)?,
        })
    }

    /// Find the ids in an already-frozen registry (child side).
    pub fn lookup(reg: &StatRegistry) -> StatResult<Self> {
        let find = |label: &str| {
            reg.find(label, GENERAL_GROUP)
                .ok_or_else(|| StatError::UnknownGroup(label.to_string()))
        };
        Ok(Self {
            requests: find("REQUESTS")?,
            failed_requests: find("FAILED REQUESTS")?,
            connections: find("ACCEPTED CONNECTIONS")?,
            bytes_in: find("BYTES IN")?,
            bytes_out: find("BYTES OUT")?,
            processing_time_ms: find("PROCESSING TIME")?,
        })
    }
}
