use std::{io, net, time::Duration};

use crate::{
    client::Connector,
    handler::HandlerConfig,
    server::Server,
    work::WorkAllocator,
};

/// Configuration for a [`Server`] or [`Connector`].
pub struct Builder {
    pub(crate) addr: Option<net::SocketAddr>,
    pub(crate) io_pool_size: usize,
    pub(crate) work_pool_init_size: usize,
    pub(crate) work_pool_high_watermark: usize,
    pub(crate) work_pool_thread_load: usize,
    pub(crate) preallocated_handler_count: usize,
    pub(crate) read_buffer_size: usize,
    pub(crate) write_buffer_size: usize,
    pub(crate) timeout: Duration,
    pub(crate) backlog: u32,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// Create new Builder instance
    pub fn new() -> Self {
        Self {
            addr: None,
            io_pool_size: 1,
            work_pool_init_size: 1,
            work_pool_high_watermark: 32,
            work_pool_thread_load: 100,
            preallocated_handler_count: 1024,
            read_buffer_size: 8192,
            write_buffer_size: 8192,
            timeout: Duration::ZERO,
            backlog: 2048,
        }
    }

    /// Set the endpoint: the listening address of a server, the target
    /// address of a connector.
    pub fn bind<A: net::ToSocketAddrs>(mut self, addr: A) -> io::Result<Self> {
        let addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "Can not parse SocketAddr")
        })?;
        self.addr = Some(addr);
        Ok(self)
    }

    /// Set number of accept executors and I/O executors (both use this).
    ///
    /// Default set to 1.
    ///
    /// # Panics:
    /// When receive 0 as pool size.
    pub fn io_pool_size(mut self, num: usize) -> Self {
        assert_ne!(num, 0, "There must be at least one io executor");
        self.io_pool_size = num;
        self
    }

    /// Starting count of work executors.
    ///
    /// # Panics:
    /// When receive 0 as pool size.
    pub fn work_pool_init_size(mut self, num: usize) -> Self {
        assert_ne!(num, 0, "There must be at least one work executor");
        self.work_pool_init_size = num;
        self
    }

    /// Maximum count of work executors the elastic pool may grow to.
    pub fn work_pool_high_watermark(mut self, num: usize) -> Self {
        self.work_pool_high_watermark = num;
        self
    }

    /// Target count of in-flight handlers per active work executor. The
    /// work pool grows while the load hint exceeds it.
    pub fn work_pool_thread_load(mut self, num: usize) -> Self {
        assert_ne!(num, 0, "Work executor thread load must be positive");
        self.work_pool_thread_load = num;
        self
    }

    /// Capacity of the handler pool. Connections beyond it are refused.
    ///
    /// # Panics:
    /// When receive 0 as handler count.
    pub fn preallocated_handler_count(mut self, num: usize) -> Self {
        assert_ne!(num, 0, "There must be at least one preallocated handler");
        self.preallocated_handler_count = num;
        self
    }

    /// Per-handler read region size: the largest chunk a single
    /// `async_read_some` can produce.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        assert_ne!(size, 0, "Read buffer can not be zero sized");
        self.read_buffer_size = size;
        self
    }

    /// Per-handler write budget: total bytes that may sit in the write
    /// queue. A write exceeding it closes the handler.
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        assert_ne!(size, 0, "Write buffer can not be zero sized");
        self.write_buffer_size = size;
        self
    }

    /// Per-handler inactivity timeout in seconds. 0 disables the timer.
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn backlog(mut self, num: u32) -> Self {
        self.backlog = num;
        self
    }

    /// Build a server listening on the bound endpoint.
    pub fn build<A: WorkAllocator>(self, allocator: A) -> io::Result<Server<A>> {
        Server::new(self, allocator)
    }

    /// Build a connector dialing the bound endpoint.
    pub fn build_connector<A: WorkAllocator>(self, allocator: A) -> io::Result<Connector<A>> {
        Connector::new(self, allocator)
    }

    pub(crate) fn handler_config(&self) -> HandlerConfig {
        HandlerConfig {
            read_buffer_size: self.read_buffer_size,
            write_buffer_size: self.write_buffer_size,
            timeout: self.timeout,
        }
    }
}
