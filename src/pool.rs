//! Keyed pools of live connectors with rendezvous task dispatch.
//!
//! Every connector gets a long-running dispatcher task. Idle dispatchers
//! wait on the pool's unbuffered task channel, so a successful non-blocking
//! send proves an idle connector existed at that instant; a failed one is
//! the signal to grow the pool. Buffering here would silently break the
//! grow-on-miss policy, so the channel stays at capacity zero.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use http::HeaderName;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    proto::Connector,
    sync::RwLock,
};

/// One queued exchange attempt, handed to whichever dispatcher is idle.
pub(crate) struct ReqTask {
    pub(crate) request: http::Request<hyper::Body>,
    pub(crate) order: Option<Vec<HeaderName>>,
    pub(crate) reply: oneshot::Sender<TaskReply>,
}

pub(crate) enum TaskReply {
    /// The dispatcher ran the exchange to response headers (or failure).
    Served(Result<http::Response<hyper::Body>>),
    /// The dispatcher was already dying; the request comes back untouched.
    NotServed(http::Request<hyper::Body>),
}

/// A reuse bucket: the connectors dialed for one `(proxy chain, authority)`
/// pool key.
pub(crate) struct ConnPool {
    key: String,
    tasks: flume::Sender<ReqTask>,
    tasks_rx: flume::Receiver<ReqTask>,
    total: AtomicUsize,
    force: CancellationToken,
    safe: CancellationToken,
}

impl ConnPool {
    fn new(key: String, parent: &CancellationToken) -> ConnPool {
        let force = parent.child_token();
        let safe = force.child_token();
        let (tasks, tasks_rx) = flume::bounded(0);
        ConnPool {
            key,
            tasks,
            tasks_rx,
            total: AtomicUsize::new(0),
            force,
            safe,
        }
    }

    /// Hand `task` to an idle dispatcher, or give it back when none is
    /// waiting right now.
    pub(crate) fn try_dispatch(&self, task: ReqTask) -> std::result::Result<(), ReqTask> {
        self.tasks.try_send(task).map_err(|e| match e {
            flume::TrySendError::Full(task) => task,
            flume::TrySendError::Disconnected(task) => task,
        })
    }

    /// Cooperative drain: dispatchers finish their in-flight exchange, then
    /// exit.
    pub(crate) fn safe_close(&self) {
        self.safe.cancel();
    }

    /// Kill every engine now; in-flight exchanges see a transport error.
    pub(crate) fn force_close(&self) {
        self.force.cancel();
    }
}

/// The concurrent pool map owned by the round tripper.
pub(crate) struct ConnPools {
    pools: RwLock<HashMap<String, Arc<ConnPool>>>,
    parent: CancellationToken,
}

impl ConnPools {
    pub(crate) fn new(parent: CancellationToken) -> Arc<ConnPools> {
        Arc::new(ConnPools {
            pools: RwLock::new(HashMap::new()),
            parent,
        })
    }

    pub(crate) fn get(&self, key: &str) -> Option<Arc<ConnPool>> {
        self.pools.read().get(key).cloned()
    }

    /// Attach a freshly dialed connector to the pool for `key`, creating the
    /// pool on first use, and start its dispatcher. Returns once the
    /// dispatcher is up, so the caller's next dispatch can reach it.
    pub(crate) async fn attach(self: &Arc<Self>, key: &str, conn: Connector) -> Arc<ConnPool> {
        let pool = {
            let mut pools = self.pools.write();
            let pool = pools
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(ConnPool::new(key.to_string(), &self.parent)))
                .clone();
            pool.total.fetch_add(1, Ordering::SeqCst);
            pool
        };
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(run_dispatcher(self.clone(), pool.clone(), conn, ready_tx));
        let _ = ready_rx.await;
        pool
    }

    fn detach(&self, pool: &Arc<ConnPool>) {
        let mut pools = self.pools.write();
        if pool.total.fetch_sub(1, Ordering::SeqCst) == 1 {
            if let Some(current) = pools.get(&pool.key) {
                if Arc::ptr_eq(current, pool) {
                    pools.remove(&pool.key);
                }
            }
        }
    }

    /// Drain every pool: in-flight exchanges complete, then dispatchers exit
    /// and the pools deregister themselves.
    pub(crate) fn safe_close_all(&self) {
        for (_, pool) in self.pools.write().drain() {
            pool.safe_close();
        }
    }

    /// Kill every pool now.
    pub(crate) fn force_close_all(&self) {
        for (_, pool) in self.pools.write().drain() {
            pool.force_close();
        }
    }
}

/// The per-connector dispatcher: publish readiness by waiting on the pool's
/// rendezvous channel, serve one task at a time, exit on drain or kill.
async fn run_dispatcher(
    pools: Arc<ConnPools>,
    pool: Arc<ConnPool>,
    conn: Connector,
    ready: oneshot::Sender<()>,
) {
    let Connector {
        mut proto,
        force,
        h2_order,
        proxies: _,
    } = conn;

    // No await between this send and the first channel registration below:
    // when the attach caller resumes, this dispatcher is (or is about to
    // be) parked on the rendezvous channel.
    let _ = ready.send(());
    loop {
        let task = tokio::select! {
            biased;
            _ = force.cancelled() => break,
            _ = pool.force.cancelled() => break,
            _ = pool.safe.cancelled() => break,
            task = pool.tasks_rx.recv_async() => match task {
                Ok(task) => task,
                Err(_) => break,
            },
        };

        let ReqTask {
            request,
            order,
            mut reply,
        } = task;

        if force.is_cancelled() || pool.force.is_cancelled() {
            let _ = reply.send(TaskReply::NotServed(request));
            break;
        }

        // The fingerprint's header order is pinned to the connection and
        // wins over the per-request option.
        let order = h2_order.clone().or(order);
        let outcome = {
            let send = proto.send_request(request, order.as_deref());
            tokio::pin!(send);
            tokio::select! {
                biased;
                _ = force.cancelled() => Err(Error::protocol("connection closed")),
                _ = pool.force.cancelled() => {
                    force.cancel();
                    Err(Error::protocol("connection closed"))
                }
                _ = reply.closed() => {
                    // The waiter gave up (timeout or cancellation). The
                    // engine may be mid-frame, so the connection is not
                    // reusable.
                    force.cancel();
                    break;
                }
                result = &mut send => result,
            }
        };

        match outcome {
            Ok((response, body_done)) => {
                if reply.send(TaskReply::Served(Ok(response))).is_err() {
                    // Raced with the waiter's timeout; the handed-out body
                    // is gone, so the stream state is unknown.
                    force.cancel();
                    break;
                }
                if let Some(done) = body_done {
                    // HTTP/1 serializes exchanges: do not publish readiness
                    // until the response body is through.
                    tokio::select! {
                        biased;
                        _ = force.cancelled() => break,
                        _ = pool.force.cancelled() => break,
                        _ = done => {}
                    }
                }
            }
            Err(err) => {
                let transport = err.is_transport();
                let _ = reply.send(TaskReply::Served(Err(err)));
                if transport {
                    force.cancel();
                    break;
                }
            }
        }
    }

    force.cancel();
    pools.detach(&pool);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_dispatch_without_idle_dispatcher_returns_task() {
        let parent = CancellationToken::new();
        let pool = ConnPool::new("example.com:443".into(), &parent);
        let (reply, _rx) = oneshot::channel();
        let task = ReqTask {
            request: http::Request::new(hyper::Body::empty()),
            order: None,
            reply,
        };
        // no dispatcher is waiting on the rendezvous channel
        assert!(pool.try_dispatch(task).is_err());
    }

    #[tokio::test]
    async fn rendezvous_hand_off_reaches_waiting_receiver() {
        let parent = CancellationToken::new();
        let pool = Arc::new(ConnPool::new("example.com:443".into(), &parent));

        let rx = pool.tasks_rx.clone();
        let waiter = tokio::spawn(async move { rx.recv_async().await });
        // give the receiver a moment to park on the channel
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let (reply, _rx) = oneshot::channel();
        let task = ReqTask {
            request: http::Request::new(hyper::Body::empty()),
            order: None,
            reply,
        };
        assert!(pool.try_dispatch(task).is_ok());
        assert!(waiter.await.unwrap().is_ok());
    }

    #[test]
    fn pool_tokens_cascade() {
        let parent = CancellationToken::new();
        let pool = ConnPool::new("k".into(), &parent);
        parent.cancel();
        assert!(pool.force.is_cancelled());
        assert!(pool.safe.is_cancelled());

        let parent = CancellationToken::new();
        let pool = ConnPool::new("k".into(), &parent);
        pool.safe_close();
        assert!(pool.safe.is_cancelled());
        assert!(!pool.force.is_cancelled());
    }
}
