#![allow(dead_code)]

use std::{
    io,
    net::TcpStream,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use pylon::{CloseReason, Server, ServerHandle, ServiceHandler, Work, WorkAllocator};

/// Callback counters shared between every work instance of a pool.
#[derive(Default)]
pub struct Stats {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub clean: AtomicUsize,
    pub timeouts: AtomicUsize,
}

impl Stats {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn timeouts(&self) -> usize {
        self.timeouts.load(Ordering::SeqCst)
    }

    pub fn record_close(&self, reason: &CloseReason) {
        self.closed.fetch_add(1, Ordering::SeqCst);
        if reason.is_clean() {
            self.clean.fetch_add(1, Ordering::SeqCst);
        }
        if reason.is_timeout() {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Echoes every read chunk back to the peer.
pub struct EchoWork {
    stats: Arc<Stats>,
}

impl Work for EchoWork {
    type Transport = tokio::net::TcpStream;

    fn on_open(&mut self, handler: &Arc<ServiceHandler<Self>>) {
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        handler.async_read_some();
    }

    fn on_read(&mut self, handler: &Arc<ServiceHandler<Self>>, _n: usize) {
        handler.async_write(handler.read_buffer());
    }

    fn on_write(&mut self, handler: &Arc<ServiceHandler<Self>>, _n: usize) {
        handler.async_read_some();
    }

    fn on_close(&mut self, _handler: &Arc<ServiceHandler<Self>>, reason: &CloseReason) {
        self.stats.record_close(reason);
    }
}

pub struct EchoAlloc(pub Arc<Stats>);

impl WorkAllocator for EchoAlloc {
    type Work = EchoWork;

    fn allocate(&self) -> EchoWork {
        EchoWork {
            stats: self.0.clone(),
        }
    }
}

/// Run the server on its own thread, keeping a shared reference around for
/// load and idleness assertions after stop.
pub fn spawn_server<A: WorkAllocator>(
    server: Server<A>,
) -> (Arc<Server<A>>, ServerHandle, thread::JoinHandle<io::Result<()>>) {
    let server = Arc::new(server);
    let handle = server.handle();
    let runner = server.clone();
    let join = thread::spawn(move || runner.run());
    (server, handle, join)
}

/// Connect with retries while the server finishes binding.
pub fn connect_retry(addr: &str) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return stream,
            Err(e) if Instant::now() >= deadline => panic!("connect {addr}: {e}"),
            Err(_) => thread::sleep(Duration::from_millis(20)),
        }
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}
