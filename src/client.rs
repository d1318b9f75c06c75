use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tracing::{info, warn};

use crate::{
    builder::Builder,
    event::Event,
    executor::{elastic::ElasticPool, ExecutorPool},
    handler::{pool::HandlerPool, PeerHandle, PeerRef, ServiceHandler},
    work::{Work, WorkAllocator},
};

/// Outbound sibling of [`Server`](crate::Server).
///
/// Draws child handlers from its own preallocated pool and connects them to
/// a fixed target endpoint, wiring each to a parent handler so the two can
/// relay through parent/child events. Used to build transparent proxies: a
/// server handler's `on_open` calls [`Connector::connect`] with itself as
/// the parent.
pub struct Connector<A: WorkAllocator> {
    target: SocketAddr,
    pool: Arc<HandlerPool<A::Work>>,
    io_pool: Arc<ExecutorPool>,
    work_pool: Arc<ElasticPool>,
    started: AtomicBool,
}

impl<A: WorkAllocator> Connector<A> {
    pub(crate) fn new(cfg: Builder, allocator: A) -> io::Result<Self> {
        let target = cfg.addr.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no target endpoint configured")
        })?;

        let pool = HandlerPool::new(&allocator, cfg.preallocated_handler_count, cfg.handler_config());

        Ok(Self {
            target,
            pool,
            io_pool: Arc::new(ExecutorPool::new(cfg.io_pool_size, "pylon-client-io")),
            work_pool: Arc::new(ElasticPool::new(
                cfg.work_pool_init_size,
                cfg.work_pool_high_watermark,
                cfg.work_pool_thread_load,
                "pylon-client-work",
            )),
            started: AtomicBool::new(false),
        })
    }

    /// Start the connector's executor pools. Must run before any `connect`.
    pub fn start(&self) -> io::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.io_pool.start()?;
        self.work_pool.start();
        info!(
            "connector targeting {} with {} preallocated handler(s)",
            self.target,
            self.pool.capacity(),
        );
        Ok(())
    }

    pub fn stop(&self, graceful: bool) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        if graceful {
            self.pool.close_all();
            self.io_pool.stop(false);
            self.work_pool.stop(false);
        } else {
            self.io_pool.stop(true);
            self.work_pool.stop(true);
        }
    }

    /// Draw a child handler, pair it with `parent` and begin an async
    /// connect to the target.
    ///
    /// The `on_set_parent`/`on_set_child` hooks are posted before the
    /// connect starts, so they are observed ahead of any peer event. On
    /// connect failure the child closes, which notifies the parent with
    /// `child_close`; an exhausted child pool reports the same way.
    pub fn connect<P: Work>(&self, parent: &Arc<ServiceHandler<P>>) {
        let child = self
            .pool
            .get(self.io_pool.next(), self.work_pool.next(self.pool.load()));

        let Some(child) = child else {
            warn!("connector pool exhausted; dropping connect for {}", self.target);
            let epoch = parent.epoch();
            let peer: Arc<dyn PeerHandle> = parent.clone();
            peer.deliver_parent(Event::child_close(), epoch);
            return;
        };

        child.adopt_parent(PeerRef::of(parent));
        parent.adopt_child(PeerRef::of(&child));

        child.activate_connect(self.target);
    }

    /// Child handlers currently connecting or connected.
    pub fn load(&self) -> usize {
        self.pool.load()
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    pub fn is_idle(&self) -> bool {
        self.pool.is_idle() && self.io_pool.is_free() && self.work_pool.is_free()
    }
}
