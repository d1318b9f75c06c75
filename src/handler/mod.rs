pub(crate) mod pool;

use std::{
    future::pending,
    io,
    net::SocketAddr,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
    time::Duration,
};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::mpsc::{unbounded_channel, UnboundedReceiver},
    time::{self, Instant},
};
use tracing::{debug, error};

use crate::{
    error::CloseReason,
    event::{Event, EventKind},
    executor::Executor,
    net::Transport,
    work::Work,
};

use self::pool::HandlerPool;

/// Lifecycle of a service handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Resting on the pool's free list.
    Pooled,
    /// Adopted a socket, transport setup in progress.
    Opening,
    /// Connected; reads and writes may be issued.
    Open,
    /// Close protocol running on the io executor.
    Closing,
    /// `on_close` delivery in progress; recycles to `Pooled` right after.
    Closed,
}

#[derive(Clone)]
pub(crate) struct HandlerConfig {
    pub(crate) read_buffer_size: usize,
    pub(crate) write_buffer_size: usize,
    pub(crate) timeout: Duration,
}

pub(crate) enum Command {
    ReadSome,
    Write(Bytes),
    Close(CloseReason),
}

pub(crate) enum Setup {
    Accept(TcpStream),
    Connect(SocketAddr),
}

/// Type erased view of a handler held by its peer.
///
/// Every call is stamped with the epoch the link was created under; a
/// recycled handler advanced its epoch, so stale calls fall out silently.
pub(crate) trait PeerHandle: Send + Sync + 'static {
    fn chunk(&self, epoch: u64) -> Bytes;

    /// Enqueue `on_parent(ev)` on this handler's work executor.
    fn deliver_parent(self: Arc<Self>, ev: Event, epoch: u64);

    /// Enqueue `on_child(ev)` on this handler's work executor.
    fn deliver_child(self: Arc<Self>, ev: Event, epoch: u64);
}

/// Non owning reference to a peer handler, valid for one connection.
///
/// Obtained from [`ServiceHandler::parent`]/[`ServiceHandler::child`] or the
/// `on_set_*` hooks. Once the peer closes and recycles, `read_buffer`
/// returns an empty view.
#[derive(Clone)]
pub struct PeerRef {
    peer: Weak<dyn PeerHandle>,
    epoch: u64,
}

impl PeerRef {
    pub(crate) fn of<W: Work>(handler: &Arc<ServiceHandler<W>>) -> Self {
        let epoch = handler.epoch();
        let peer: Arc<dyn PeerHandle> = handler.clone();
        Self {
            peer: Arc::downgrade(&peer),
            epoch,
        }
    }

    /// Zero copy view of the peer's most recent read chunk.
    pub fn read_buffer(&self) -> Bytes {
        self.peer
            .upgrade()
            .map(|peer| peer.chunk(self.epoch))
            .unwrap_or_default()
    }
}

struct Inner {
    status: Status,
    cmd_tx: Option<tokio::sync::mpsc::UnboundedSender<Command>>,
    io_exec: Option<Executor>,
    work_exec: Option<Executor>,
    parent: Option<PeerRef>,
    child: Option<PeerRef>,
    read_chunk: Bytes,
}

/// Per-connection state machine.
///
/// Owned by its pool for the whole program. While active it is pinned to
/// one io executor (where a single driver task owns the transport and the
/// buffers) and one work executor (where the user callbacks run). The two
/// only talk through the command channel and posted jobs, which gives every
/// handler a serial execution domain.
pub struct ServiceHandler<W: Work> {
    slot: usize,
    cfg: HandlerConfig,
    epoch: AtomicU64,
    work: Mutex<W>,
    inner: Mutex<Inner>,
    pool: Weak<HandlerPool<W>>,
    me: Weak<ServiceHandler<W>>,
}

impl<W: Work> ServiceHandler<W> {
    pub(crate) fn new(
        slot: usize,
        cfg: HandlerConfig,
        work: W,
        pool: Weak<HandlerPool<W>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            slot,
            cfg,
            epoch: AtomicU64::new(0),
            work: Mutex::new(work),
            inner: Mutex::new(Inner {
                status: Status::Pooled,
                cmd_tx: None,
                io_exec: None,
                work_exec: None,
                parent: None,
                child: None,
                read_chunk: Bytes::new(),
            }),
            pool,
            me: me.clone(),
        })
    }

    pub fn status(&self) -> Status {
        self.inner.lock().unwrap().status
    }

    /// Issue a single read into the read buffer. Completion posts
    /// `on_read(n)` to the work executor. No-op unless the handler is open.
    pub fn async_read_some(&self) {
        let inner = self.inner.lock().unwrap();
        if inner.status == Status::Open {
            if let Some(tx) = inner.cmd_tx.as_ref() {
                let _ = tx.send(Command::ReadSome);
            }
        }
    }

    /// Queue one full write of `buf`. Completion posts `on_write(n)`.
    /// Exceeding the handler's write budget closes the connection.
    pub fn async_write(&self, buf: Bytes) {
        let inner = self.inner.lock().unwrap();
        if inner.status == Status::Open {
            if let Some(tx) = inner.cmd_tx.as_ref() {
                let _ = tx.send(Command::Write(buf));
            }
        }
    }

    /// Initiate closing. Idempotent: only the first close (or error) is
    /// observed by `on_close`.
    pub fn close(&self) {
        self.close_with(CloseReason::Finished);
    }

    pub fn close_with(&self, reason: CloseReason) {
        let inner = self.inner.lock().unwrap();
        if let Some(tx) = inner.cmd_tx.as_ref() {
            let _ = tx.send(Command::Close(reason));
        }
    }

    /// Deliver `ev` to this handler's parent, which observes it in
    /// `on_parent` on its own work executor. Dropped if the peer is gone.
    pub fn post_parent(&self, ev: Event) {
        let link = self.inner.lock().unwrap().parent.clone();
        if let Some(link) = link {
            if let Some(peer) = link.peer.upgrade() {
                peer.deliver_parent(ev, link.epoch);
            }
        }
    }

    /// Deliver `ev` to this handler's child, which observes it in
    /// `on_child` on its own work executor. Dropped if the peer is gone.
    pub fn post_child(&self, ev: Event) {
        let link = self.inner.lock().unwrap().child.clone();
        if let Some(link) = link {
            if let Some(peer) = link.peer.upgrade() {
                peer.deliver_child(ev, link.epoch);
            }
        }
    }

    /// Shared view of the bytes produced by the most recent read, for this
    /// handler's own callbacks and for peer zero-copy relaying.
    pub fn read_buffer(&self) -> Bytes {
        self.inner.lock().unwrap().read_chunk.clone()
    }

    pub fn parent(&self) -> Option<PeerRef> {
        self.inner.lock().unwrap().parent.clone()
    }

    pub fn child(&self) -> Option<PeerRef> {
        self.inner.lock().unwrap().child.clone()
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Pin the handler to its executors for one connection.
    pub(crate) fn assign(&self, io_exec: Executor, work_exec: Executor) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(inner.status, Status::Pooled);
        inner.io_exec = Some(io_exec);
        inner.work_exec = Some(work_exec);
    }

    /// Wire a parent peer and post the `on_set_parent` hook ahead of any
    /// event that peer may send.
    pub(crate) fn adopt_parent(&self, parent: PeerRef) {
        self.inner.lock().unwrap().parent = Some(parent.clone());
        self.dispatch(move |work, handler| work.on_set_parent(handler, &parent));
    }

    pub(crate) fn adopt_child(&self, child: PeerRef) {
        self.inner.lock().unwrap().child = Some(child.clone());
        self.dispatch(move |work, handler| work.on_set_child(handler, &child));
    }

    pub(crate) fn activate_accept(&self, stream: TcpStream) {
        self.activate(Setup::Accept(stream));
    }

    pub(crate) fn activate_connect(&self, target: SocketAddr) {
        self.activate(Setup::Connect(target));
    }

    /// Invoke `on_clear` in place, without an executor round trip. Used at
    /// pool init; recycling runs the same callback on the work executor.
    pub(crate) fn clear_in_place(&self) {
        if let Some(me) = self.me.upgrade() {
            invoke(&me, |work, handler| work.on_clear(handler));
        }
    }

    fn activate(&self, setup: Setup) {
        let (tx, rx) = unbounded_channel();

        let io_exec = {
            let mut inner = self.inner.lock().unwrap();
            inner.status = Status::Opening;
            inner.cmd_tx = Some(tx);
            inner.io_exec.clone()
        };

        let (Some(io_exec), Some(handler)) = (io_exec, self.me.upgrade()) else {
            debug_assert!(false, "handler activated without an io executor");
            return;
        };

        io_exec.post_task(move || drive(handler, setup, rx));
    }

    /// Post a user callback onto the work executor.
    fn dispatch<F>(&self, f: F)
    where
        F: FnOnce(&mut W, &Arc<ServiceHandler<W>>) + Send + 'static,
    {
        let work_exec = self.inner.lock().unwrap().work_exec.clone();
        if let (Some(work_exec), Some(handler)) = (work_exec, self.me.upgrade()) {
            work_exec.post(move || invoke(&handler, f));
        }
    }

    fn set_status(&self, status: Status) {
        self.inner.lock().unwrap().status = status;
    }

    fn store_chunk(&self, chunk: Bytes) {
        self.inner.lock().unwrap().read_chunk = chunk;
    }

    /// Tail of the close protocol, run as one job on the work executor:
    /// `on_close` exactly once, `on_clear`, then recycle. Nothing can
    /// observe the handler between `on_close` returning and the recycle
    /// because the job runs without interleaving.
    fn finish_on_work(&self, reason: CloseReason) {
        let Some(me) = self.me.upgrade() else { return };

        self.set_status(Status::Closed);

        invoke(&me, move |work, handler| work.on_close(handler, &reason));
        invoke(&me, |work, handler| work.on_clear(handler));

        {
            let mut inner = self.inner.lock().unwrap();
            inner.status = Status::Pooled;
            inner.io_exec = None;
            inner.work_exec = None;
            inner.parent = None;
            inner.child = None;
            inner.read_chunk = Bytes::new();
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);

        if let Some(pool) = self.pool.upgrade() {
            pool.put(self.slot);
        }
    }
}

impl<W: Work> PeerHandle for ServiceHandler<W> {
    fn chunk(&self, epoch: u64) -> Bytes {
        if self.epoch() != epoch {
            return Bytes::new();
        }
        self.read_buffer()
    }

    fn deliver_parent(self: Arc<Self>, ev: Event, epoch: u64) {
        if self.epoch() != epoch {
            return;
        }
        let work_exec = {
            let inner = self.inner.lock().unwrap();
            if !matches!(inner.status, Status::Open | Status::Closing) {
                return;
            }
            inner.work_exec.clone()
        };
        let Some(work_exec) = work_exec else { return };

        let handler = self;
        work_exec.post(move || {
            if handler.epoch() != epoch {
                return;
            }
            // A closing child is done sending; drop the back link before
            // the callback so late posts resolve to "peer gone".
            if ev.kind() == EventKind::ChildClose {
                handler.inner.lock().unwrap().child = None;
            }
            invoke(&handler, move |work, handler| work.on_parent(handler, ev));
        });
    }

    fn deliver_child(self: Arc<Self>, ev: Event, epoch: u64) {
        if self.epoch() != epoch {
            return;
        }
        let work_exec = {
            let inner = self.inner.lock().unwrap();
            if !matches!(inner.status, Status::Open | Status::Closing) {
                return;
            }
            inner.work_exec.clone()
        };
        let Some(work_exec) = work_exec else { return };

        let handler = self;
        work_exec.post(move || {
            if handler.epoch() != epoch {
                return;
            }
            if ev.kind() == EventKind::ParentClose {
                handler.inner.lock().unwrap().parent = None;
            }
            invoke(&handler, move |work, handler| work.on_child(handler, ev));
        });
    }
}

/// Run a user callback, trapping panics so a faulty work object takes down
/// its own connection instead of the executor.
fn invoke<W, F>(handler: &Arc<ServiceHandler<W>>, f: F)
where
    W: Work,
    F: FnOnce(&mut W, &Arc<ServiceHandler<W>>),
{
    let caught = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut work = handler.work.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut work, handler);
    }));

    if caught.is_err() {
        error!("work callback panicked; closing handler {}", handler.slot);
        handler.close_with(CloseReason::Io(io::Error::other("work callback panicked")));
    }
}

/// Driver task: sole owner of the transport and buffers, pinned to the
/// handler's io executor for the lifetime of one connection.
async fn drive<W: Work>(
    handler: Arc<ServiceHandler<W>>,
    setup: Setup,
    mut cmd_rx: UnboundedReceiver<Command>,
) {
    let read_size = handler.cfg.read_buffer_size;
    let write_budget = handler.cfg.write_buffer_size;
    let timeout = handler.cfg.timeout;
    let timer_on = !timeout.is_zero();

    let establish = async {
        match setup {
            Setup::Accept(stream) => W::Transport::accept(stream).await,
            Setup::Connect(addr) => {
                let stream = TcpStream::connect(addr).await?;
                W::Transport::connect(stream).await
            }
        }
    };

    // The inactivity timer also bounds transport setup.
    let established = if timer_on {
        match time::timeout(timeout, establish).await {
            Ok(res) => res.map_err(CloseReason::from),
            Err(_) => Err(CloseReason::Timeout),
        }
    } else {
        establish.await.map_err(CloseReason::from)
    };

    let transport = match established {
        Ok(transport) => transport,
        Err(reason) => return finish(handler, reason, None::<WriteHalf<W::Transport>>, cmd_rx).await,
    };

    handler.set_status(Status::Open);
    handler.dispatch(|work, handler| work.on_open(handler));

    let (mut rd, mut wr) = tokio::io::split(transport);
    let mut read_buf = BytesMut::with_capacity(read_size);
    let mut want_read = false;
    let mut write_q: std::collections::VecDeque<Bytes> = std::collections::VecDeque::new();
    let mut write_off = 0;
    let mut queued = 0;

    let sleep = time::sleep(if timer_on { timeout } else { Duration::from_secs(86400) });
    tokio::pin!(sleep);

    let reason = loop {
        tokio::select! {
            biased;
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Close(reason)) => break reason,
                Some(Command::ReadSome) => want_read = true,
                Some(Command::Write(buf)) => {
                    if queued + buf.len() > write_budget {
                        break CloseReason::BufferExhausted;
                    }
                    queued += buf.len();
                    write_q.push_back(buf);
                }
                None => break CloseReason::Finished,
            },
            res = read_some(&mut rd, &mut read_buf, read_size), if want_read => match res {
                Ok(0) => break CloseReason::Finished,
                Ok(n) => {
                    want_read = false;
                    handler.store_chunk(read_buf.split().freeze());
                    if timer_on {
                        sleep.as_mut().reset(Instant::now() + timeout);
                    }
                    handler.dispatch(move |work, handler| work.on_read(handler, n));
                }
                Err(e) => break CloseReason::Io(e),
            },
            res = write_some(&mut wr, write_q.front(), write_off), if !write_q.is_empty() => match res {
                Ok(0) => break CloseReason::Io(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    write_off += n;
                    let len = write_q.front().map(Bytes::len).unwrap_or(0);
                    if write_off >= len {
                        write_q.pop_front();
                        write_off = 0;
                        queued -= len;
                        if timer_on {
                            sleep.as_mut().reset(Instant::now() + timeout);
                        }
                        handler.dispatch(move |work, handler| work.on_write(handler, len));
                    }
                }
                Err(e) => break CloseReason::Io(e),
            },
            () = sleep.as_mut(), if timer_on => break CloseReason::Timeout,
        }
    };

    finish(handler, reason, Some(wr), cmd_rx).await;
}

async fn read_some<T>(rd: &mut ReadHalf<T>, buf: &mut BytesMut, max: usize) -> io::Result<usize>
where
    T: AsyncRead + AsyncWrite,
{
    if buf.capacity() < max {
        buf.reserve(max);
    }
    rd.read_buf(&mut buf.limit(max)).await
}

async fn write_some<T>(wr: &mut WriteHalf<T>, front: Option<&Bytes>, offset: usize) -> io::Result<usize>
where
    T: AsyncRead + AsyncWrite,
{
    match front {
        Some(buf) => wr.write(&buf[offset..]).await,
        None => pending().await,
    }
}

/// Close protocol, io executor side: capture the winning reason, shut the
/// transport down, notify peers, then hand `on_close` and the recycle to
/// the work executor.
async fn finish<W: Work, T>(
    handler: Arc<ServiceHandler<W>>,
    reason: CloseReason,
    wr: Option<WriteHalf<T>>,
    cmd_rx: UnboundedReceiver<Command>,
) where
    T: AsyncRead + AsyncWrite,
{
    let (parent, child, work_exec) = {
        let mut inner = handler.inner.lock().unwrap();
        inner.status = Status::Closing;
        inner.cmd_tx = None;
        (inner.parent.take(), inner.child.take(), inner.work_exec.clone())
    };

    if let Some(mut wr) = wr {
        let _ = wr.shutdown().await;
    }

    if let Some(link) = parent {
        if let Some(peer) = link.peer.upgrade() {
            peer.deliver_parent(Event::child_close(), link.epoch);
        }
    }
    if let Some(link) = child {
        if let Some(peer) = link.peer.upgrade() {
            peer.deliver_child(Event::parent_close(), link.epoch);
        }
    }

    // Commands sent from here on are dropped at the sender.
    drop(cmd_rx);

    // Routine connection breakage closes silently.
    if !reason.is_clean() && !reason.is_transport() && !matches!(reason, CloseReason::Stopped) {
        debug!("handler {} closing: {reason}", handler.slot);
    }

    if let Some(work_exec) = work_exec {
        let handler = handler.clone();
        work_exec.post(move || handler.finish_on_work(reason));
    }
}
