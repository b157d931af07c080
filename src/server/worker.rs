/*!
 * Worker Threads
 *
 * Each worker owns one connection at a time, serving keep-alive requests
 * until the client stops, a limit is hit or termination is requested. The
 * request object is recycled between connections; every
 * `MAX_REQUESTS_BEFORE_REALLOCATE_MEM` requests it is torn down so its
 * arenas drop their chained extents.
 */

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::child::ChildContext;
use super::connection::Connection;
use crate::containers::DynamicArray;
use crate::core::limits::MAX_REQUESTS_BEFORE_REALLOCATE_MEM;
use crate::core::types::{MemResult, Terminate};
use crate::mem::{PoolObject, SerialAllocator};

/// What the request processor reports for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// A response went out; keep-alive is possible.
    Ok,
    /// Nothing useful arrived (idle close or timeout before a request).
    NoStatus,
    /// Protocol or I/O failure; the connection must be hard-closed.
    Error,
}

/// Per-request state a worker recycles across connections. Handlers stash
/// named attributes in the arena-backed array; the pooled buffer is the
/// I/O scratch.
pub struct Request {
    pub attributes: DynamicArray,
    pub io_buf: PoolObject,
    /// Cleared by the handler when the client asked for close.
    pub keepalive: bool,
}

impl Request {
    pub fn new(ctx: &ChildContext) -> MemResult<Self> {
        let arena = SerialAllocator::new(Arc::clone(&ctx.buffers))?;
        Ok(Self {
            attributes: DynamicArray::new(arena),
            io_buf: ctx.objects.alloc(ctx.request_buf_class)?,
            keepalive: true,
        })
    }

    /// Make the object ready for the next request on the same connection.
    pub fn reset(&mut self) {
        self.attributes.clear();
        self.keepalive = true;
    }
}

/// Seam to the ICAP request parser and encapsulation logic, which live
/// outside this crate.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, conn: &mut Connection, req: &mut Request) -> HandlerOutcome;
}

/// Stand-in processor: answers OPTIONS-style probes with a canned ICAP
/// response. Enough to drive the pipeline end to end.
pub struct OptionsHandler;

impl RequestHandler for OptionsHandler {
    fn handle(&self, conn: &mut Connection, req: &mut Request) -> HandlerOutcome {
        let stream = conn.stream_mut();
        let _ = stream.set_read_timeout(Some(Duration::from_secs(30)));

        let mut used = 0;
        loop {
            if used == req.io_buf.size() {
                warn!("request header exceeds {} bytes", req.io_buf.size());
                return HandlerOutcome::Error;
            }
            match stream.read(&mut req.io_buf[used..]) {
                Ok(0) => {
                    return if used == 0 {
                        HandlerOutcome::NoStatus
                    } else {
                        HandlerOutcome::Error
                    };
                }
                Ok(n) => {
                    used += n;
                    if req.io_buf[..used].windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return HandlerOutcome::NoStatus;
                }
                Err(_) => return HandlerOutcome::Error,
            }
        }

        let head = String::from_utf8_lossy(&req.io_buf[..used]).into_owned();
        if head.to_ascii_lowercase().contains("connection: close") {
            req.keepalive = false;
        }
        if let Some(method) = head.split_whitespace().next() {
            let _ = req.attributes.add("method", method.as_bytes());
        }
        let response = b"ICAP/1.0 200 OK\r\nMethods: RESPMOD, REQMOD\r\nEncapsulated: null-body=0\r\n\r\n";
        match stream.write_all(response) {
            Ok(()) => HandlerOutcome::Ok,
            Err(_) => HandlerOutcome::Error,
        }
    }
}

pub fn run_worker(ctx: Arc<ChildContext>, handler: Arc<dyn RequestHandler>) {
    let mut request: Option<Request> = None;
    let mut served: u64 = 0;

    loop {
        match ctx.terminate_level() {
            Terminate::Immediately => break,
            Terminate::Gracefully if ctx.queue.used() == 0 => break,
            _ => {}
        }

        let Some(mut conn) = ctx.queue.get() else {
            if ctx.queue.is_shutdown() {
                break;
            }
            ctx.queue.wait_for_queue(Duration::from_secs(1));
            continue;
        };

        let slot = ctx.slot();
        slot.mark_worker_busy();

        // Build or recycle the request object.
        if request.is_none() {
            match Request::new(&ctx) {
                Ok(r) => request = Some(r),
                Err(e) => {
                    warn!("request allocation failed: {}", e);
                    conn.hard_close();
                    ctx.memblock.inc(ctx.stat_ids.failed_requests, 1);
                    slot.mark_worker_free();
                    ctx.signal_free_worker();
                    continue;
                }
            }
        }
        let req = request.as_mut().expect("request object present");

        let mut keepalive_reqs = 0i32;
        let mut hard = false;
        loop {
            let started = Instant::now();
            match handler.handle(&mut conn, req) {
                HandlerOutcome::NoStatus => {
                    req.reset();
                    break;
                }
                HandlerOutcome::Error => {
                    ctx.memblock.inc(ctx.stat_ids.failed_requests, 1);
                    hard = true;
                    break;
                }
                HandlerOutcome::Ok => {
                    served += 1;
                    keepalive_reqs += 1;
                    slot.count_request();
                    ctx.memblock.inc(ctx.stat_ids.requests, 1);
                    ctx.memblock.set(
                        ctx.stat_ids.processing_time_ms,
                        started.elapsed().as_millis() as u64,
                    );
                    info!(
                        "{} {} request served ({} on this connection)",
                        conn.peer(),
                        conn.protocol(),
                        keepalive_reqs
                    );

                    // A gracefully terminating child finishes this request
                    // and drops keep-alive.
                    let max_ka = ctx.config.max_keepalive_requests;
                    if !req.keepalive
                        || (max_ka > 0 && keepalive_reqs >= max_ka)
                        || ctx.terminate_level() != Terminate::None
                    {
                        break;
                    }
                    // Peek for a pipelined request before giving up.
                    if conn.wait_readable(ctx.config.keepalive_timeout) {
                        req.reset();
                        continue;
                    }
                    break;
                }
            }
        }

        if hard || ctx.terminate_level() == Terminate::Immediately {
            conn.hard_close();
        } else {
            conn.linger_close(ctx.config.max_secs_to_linger);
        }

        // Periodically rebuild the request so its arenas start fresh.
        if served > 0 && served % MAX_REQUESTS_BEFORE_REALLOCATE_MEM == 0 {
            debug!("recycling request object after {} requests", served);
            request = None;
        } else if let Some(r) = request.as_mut() {
            r.reset();
        }

        slot.mark_worker_free();
        ctx.signal_free_worker();
    }

    debug!("worker exiting after {} requests", served);
    ctx.mark_worker_done();
}
