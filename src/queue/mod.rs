/*!
 * Connection Queue
 *
 * Bounded FIFO between the single acceptor and the worker threads of one
 * child. The producer never blocks: at `warn_size` entries the fresh
 * connection is dropped with a warning. Consumers wait on a condition
 * variable with its own mutex, so shutdown broadcasts never contend with
 * the producer's queue mutex.
 */

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::warn;

use crate::containers::List;
use crate::server::connection::Connection;

pub struct ConnQueue {
    items: Mutex<List<Connection>>,
    warn_size: usize,
    cond_mutex: Mutex<()>,
    cond: Condvar,
    shutdown: AtomicBool,
}

impl ConnQueue {
    #[must_use]
    pub fn new(warn_size: usize) -> Self {
        Self {
            items: Mutex::new(List::new()),
            warn_size: warn_size.max(1),
            cond_mutex: Mutex::new(()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    #[inline]
    #[must_use]
    pub fn warn_size(&self) -> usize {
        self.warn_size
    }

    /// Enqueue a connection. Returns the post-insert depth, or 0 when the
    /// queue was full and the connection has been dropped.
    pub fn put(&self, conn: Connection) -> usize {
        let used;
        {
            let mut items = self.items.lock();
            if items.len() >= self.warn_size {
                drop(items);
                warn!(
                    "connection queue full ({} entries), dropping connection from {}",
                    self.warn_size,
                    conn.peer()
                );
                return 0;
            }
            items.push_back(conn);
            used = items.len();
        }
        self.cond.notify_one();
        used
    }

    /// Dequeue without blocking.
    pub fn get(&self) -> Option<Connection> {
        self.items.lock().pop_front()
    }

    #[must_use]
    pub fn used(&self) -> usize {
        self.items.lock().len()
    }

    /// Park until the producer signals, the timeout passes or shutdown is
    /// broadcast. Spurious wakeups are expected; callers re-poll `get`.
    pub fn wait_for_queue(&self, timeout: Duration) {
        let mut guard = self.cond_mutex.lock();
        if self.is_shutdown() {
            return;
        }
        self.cond.wait_for(&mut guard, timeout);
    }

    /// Flip the shutdown flag and wake every waiter.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _guard = self.cond_mutex.lock();
        self.cond.notify_all();
    }

    #[inline]
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Drain everything left, hard-closing each connection. Used on child
    /// teardown.
    pub fn clear(&self) {
        while let Some(conn) = self.get() {
            conn.hard_close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::sync::Arc;
    use std::thread;

    use crate::core::types::Protocol;

    fn test_conn(listener: &TcpListener) -> Connection {
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        drop(client);
        Connection::new(stream, peer, addr, Protocol::Icap)
    }

    #[test]
    fn hard_cap_and_fifo_order() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let q = ConnQueue::new(2);

        let c1 = test_conn(&listener);
        let p1 = c1.peer();
        let c2 = test_conn(&listener);
        let p2 = c2.peer();

        assert_eq!(q.put(c1), 1);
        assert_eq!(q.put(c2), 2);
        // Third put drops: the queue treats warn_size as a hard cap.
        assert_eq!(q.put(test_conn(&listener)), 0);
        assert_eq!(q.used(), 2);

        assert_eq!(q.get().unwrap().peer(), p1);
        assert_eq!(q.get().unwrap().peer(), p2);
        assert!(q.get().is_none());

        // After draining, a fourth enqueue reports depth one again.
        assert_eq!(q.put(test_conn(&listener)), 1);
    }

    #[test]
    fn shutdown_wakes_waiters() {
        let q = Arc::new(ConnQueue::new(4));
        let waiter = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                while !q.is_shutdown() {
                    q.wait_for_queue(Duration::from_secs(5));
                }
            })
        };
        thread::sleep(Duration::from_millis(50));
        q.shutdown();
        waiter.join().unwrap();
    }

    #[test]
    fn put_signals_a_waiting_consumer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let q = Arc::new(ConnQueue::new(4));
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || loop {
                if let Some(conn) = q.get() {
                    return conn.peer();
                }
                q.wait_for_queue(Duration::from_secs(5));
            })
        };
        thread::sleep(Duration::from_millis(50));
        let conn = test_conn(&listener);
        let expect = conn.peer();
        assert_eq!(q.put(conn), 1);
        assert_eq!(consumer.join().unwrap(), expect);
    }
}
