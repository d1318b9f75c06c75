mod handle;

pub use self::handle::ServerHandle;

use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::{
    net::TcpListener,
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        watch,
    },
    time::sleep,
};
use tracing::{debug, error, info, warn};

use crate::{
    builder::Builder,
    executor::{elastic::ElasticPool, ExecutorPool},
    handler::pool::HandlerPool,
    net::bind_listener,
    work::{Work, WorkAllocator},
};

pub(crate) enum Command {
    GracefulStop,
    ForceStop,
}

/// Composes the accept, io and work executor pools with the handler pool
/// and a listening endpoint.
///
/// `run` binds one listening socket per accept executor, spawns the accept
/// loops and blocks the calling thread until a [`ServerHandle`] issues a
/// stop. A server runs once; constructing a fresh one is cheap.
pub struct Server<A: WorkAllocator> {
    addr: SocketAddr,
    backlog: u32,
    pool: Arc<HandlerPool<A::Work>>,
    accept_pool: ExecutorPool,
    io_pool: Arc<ExecutorPool>,
    work_pool: Arc<ElasticPool>,
    cmd_tx: UnboundedSender<Command>,
    cmd_rx: Mutex<UnboundedReceiver<Command>>,
    stop_tx: watch::Sender<bool>,
    started: AtomicBool,
}

impl<A: WorkAllocator> Server<A> {
    pub(crate) fn new(cfg: Builder, allocator: A) -> io::Result<Self> {
        let addr = cfg.addr.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no listen endpoint configured")
        })?;

        let pool = HandlerPool::new(&allocator, cfg.preallocated_handler_count, cfg.handler_config());

        let (cmd_tx, cmd_rx) = unbounded_channel();
        let (stop_tx, _) = watch::channel(false);

        Ok(Self {
            addr,
            backlog: cfg.backlog,
            pool,
            accept_pool: ExecutorPool::new(cfg.io_pool_size, "pylon-accept"),
            io_pool: Arc::new(ExecutorPool::new(cfg.io_pool_size, "pylon-io")),
            work_pool: Arc::new(ElasticPool::new(
                cfg.work_pool_init_size,
                cfg.work_pool_high_watermark,
                cfg.work_pool_thread_load,
                "pylon-work",
            )),
            cmd_tx,
            cmd_rx: Mutex::new(cmd_rx),
            stop_tx,
            started: AtomicBool::new(false),
        })
    }

    /// A handle for stopping the server from another thread.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            tx: self.cmd_tx.clone(),
        }
    }

    /// Bind, start all pools and block until stopped.
    ///
    /// Startup errors (bind failure, invalid endpoint) abort before any
    /// connection is accepted and propagate to the caller.
    pub fn run(&self) -> io::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.run_inner();
        self.started.store(false, Ordering::SeqCst);
        result
    }

    fn run_inner(&self) -> io::Result<()> {
        // Bind every acceptor before anything starts so configuration
        // errors abort startup cleanly.
        let listeners = (0..self.accept_pool.len())
            .map(|_| bind_listener(self.addr, self.backlog))
            .collect::<io::Result<Vec<_>>>()?;

        self.io_pool.start()?;
        self.work_pool.start();
        self.accept_pool.start()?;

        info!(
            "listening on {} with {} acceptor(s), {} preallocated handler(s)",
            self.addr,
            self.accept_pool.len(),
            self.pool.capacity(),
        );

        for (idx, listener) in listeners.into_iter().enumerate() {
            let pool = self.pool.clone();
            let io_pool = self.io_pool.clone();
            let work_pool = self.work_pool.clone();
            let stop_rx = self.stop_tx.subscribe();

            self.accept_pool
                .executor(idx)
                .post_task(move || accept_loop(listener, pool, io_pool, work_pool, stop_rx));
        }

        // Block the caller until a handle issues a stop.
        let cmd = self
            .cmd_rx
            .lock()
            .unwrap()
            .blocking_recv()
            .unwrap_or(Command::ForceStop);

        self.shutdown(matches!(cmd, Command::GracefulStop));
        Ok(())
    }

    fn shutdown(&self, graceful: bool) {
        let _ = self.stop_tx.send(true);
        self.accept_pool.stop(false);

        if graceful {
            // Ask every in-flight handler to close, then drain the io pool
            // (close protocols) and the work pool (`on_close` deliveries
            // and recycles) until both are idle.
            self.pool.close_all();
            self.io_pool.stop(false);
            self.work_pool.stop(false);
            info!("stopped gracefully, {} handler(s) in flight", self.pool.load());
        } else {
            self.io_pool.stop(true);
            self.work_pool.stop(true);
            info!("force stopped, abandoned {} handler(s)", self.pool.load());
        }
    }

    /// Handlers currently serving a connection.
    pub fn load(&self) -> usize {
        self.pool.load()
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// True when every handler is pooled and the io and work pools have no
    /// pending jobs.
    pub fn is_idle(&self) -> bool {
        self.pool.is_idle() && self.io_pool.is_free() && self.work_pool.is_free()
    }
}

async fn accept_loop<W: Work>(
    listener: std::net::TcpListener,
    pool: Arc<HandlerPool<W>>,
    io_pool: Arc<ExecutorPool>,
    work_pool: Arc<ElasticPool>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!("acceptor setup failed: {e}");
            return;
        }
    };

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => return,
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    // Io executor round robin; work executor sized by the
                    // current handler load.
                    match pool.get(io_pool.next(), work_pool.next(pool.load())) {
                        Some(handler) => {
                            debug!("accepted {peer}");
                            handler.activate_accept(stream);
                        }
                        None => {
                            warn!("handler pool exhausted; refusing {peer}");
                            drop(stream);
                        }
                    }
                }
                Err(ref e) if connection_error(e) => continue,
                Err(e) => {
                    error!("error accepting connection: {e}");
                    sleep(Duration::from_secs(1)).await;
                }
            },
        }
    }
}

/// This function defines errors that are per-connection. Which basically
/// means that if we get this error from `accept()` system call it means
/// next connection might be ready to be accepted.
///
/// All other errors will incur a timeout before next `accept()` is
/// performed. The timeout is useful to handle resource exhaustion errors
/// like ENFILE and EMFILE. Otherwise, could enter into tight loop.
fn connection_error(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::ConnectionRefused
        || e.kind() == io::ErrorKind::ConnectionAborted
        || e.kind() == io::ErrorKind::ConnectionReset
}
