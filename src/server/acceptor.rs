/*!
 * Acceptor Thread
 *
 * One per child. Siblings across the whole server compete for the
 * inter-process accept mutex, so exactly one acceptor anywhere is inside
 * its inner accept loop; that serializes accepts, avoids a thundering herd
 * and bounds each child's accept-to-queue backlog.
 */

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use super::child::ChildContext;
use super::connection::Connection;
use crate::core::errors::IpcError;
use crate::core::types::Terminate;

/// How long one poll on the listen sockets blocks, so termination signals
/// break the acceptor out promptly.
const ACCEPT_POLL_MS: u16 = 300;

pub fn run_acceptor(ctx: Arc<ChildContext>) {
    // Do not accept before every worker is up and the monitor said go.
    ctx.wait_start_gate();
    debug!("acceptor running");

    'outer: loop {
        if ctx.terminate_level() != Terminate::None {
            break;
        }

        match ctx.registry.accept_mutex().lock() {
            Ok(()) => {}
            Err(IpcError::Interrupted) => continue,
            Err(e) => {
                error!("accept mutex failed: {}", e);
                ctx.request_terminate(Terminate::Immediately);
                break;
            }
        }

        let slot = ctx.slot();
        slot.set_idle(false);

        // Inner loop: hold the mutex while this child still has capacity.
        while slot.free_servers() > 0 {
            if ctx.terminate_level() != Terminate::None {
                break;
            }
            let Some(listener_idx) = wait_for_ready_listener(&ctx) else {
                continue; // timeout or EINTR: re-check termination
            };

            let listener = &ctx.listeners[listener_idx];
            let (stream, peer) = match listener.accept(ctx.config.max_secs_to_linger) {
                Ok(pair) => pair,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    if ctx.terminate_level() != Terminate::None {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            };

            let conn = Connection::new(
                stream,
                peer,
                listener.local_addr(),
                listener.protocol(),
            );

            let used = ctx.queue.put(conn);
            if used == 0 {
                // The capacity check makes this unreachable; hitting it
                // means accepts were over-committed.
                error!("no available servers, over-committed accepts");
                ctx.request_terminate(Terminate::Immediately);
                break;
            }
            slot.count_connection();
            ctx.memblock.inc(ctx.stat_ids.connections, 1);

            // Stop once every free worker has work waiting already.
            if slot.free_servers() as i64 - ctx.queue.used() as i64 <= 0 {
                break;
            }
        }

        slot.set_idle(true);
        if let Err(e) = ctx.registry.accept_mutex().unlock() {
            error!("accept mutex unlock failed: {}", e);
            ctx.request_terminate(Terminate::Immediately);
            break 'outer;
        }

        // All workers busy: hand the mutex to a sibling and wait for one of
        // ours to finish a request.
        while slot.free_servers() <= 0 {
            if ctx.terminate_level() != Terminate::None {
                break 'outer;
            }
            ctx.wait_free_worker(Duration::from_millis(500));
        }
    }

    debug!("acceptor exiting");
    ctx.mark_acceptor_done();
}

/// Poll every listen socket; `Some(i)` when listener `i` is readable.
fn wait_for_ready_listener(ctx: &ChildContext) -> Option<usize> {
    let mut fds: Vec<PollFd> = ctx
        .listeners
        .iter()
        .map(|l| PollFd::new(l.fd(), PollFlags::POLLIN))
        .collect();
    match poll(&mut fds, PollTimeout::from(ACCEPT_POLL_MS)) {
        Ok(n) if n > 0 => fds.iter().position(|fd| {
            fd.revents()
                .map(|r| r.contains(PollFlags::POLLIN))
                .unwrap_or(false)
        }),
        _ => None,
    }
}
