pub(crate) mod elastic;

use std::{
    future::Future,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
};

use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    task::LocalSet,
};
use tracing::debug;

type LocalBoxFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;

/// A job crosses threads as a `Send` closure and only then builds the
/// (possibly `!Send`) future it runs on the destination's `LocalSet`.
type Job = Box<dyn FnOnce() -> LocalBoxFuture + Send>;

/// One event loop: a named worker thread driving a current thread runtime.
///
/// Jobs posted from any thread are spawned as local tasks in post order and
/// run cooperatively one at a time. The handle is cheap to clone; handlers
/// keep a clone for each executor they are pinned to.
#[derive(Clone)]
pub(crate) struct Executor {
    core: Arc<Core>,
}

struct Core {
    name: String,
    tx: Mutex<Option<UnboundedSender<Job>>>,
    rx: Mutex<Option<UnboundedReceiver<Job>>>,
    // queued plus running jobs. decremented when a job's future completes.
    pending: AtomicUsize,
    force: AtomicBool,
}

impl Executor {
    pub(crate) fn new(name: String) -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            core: Arc::new(Core {
                name,
                tx: Mutex::new(Some(tx)),
                rx: Mutex::new(Some(rx)),
                pending: AtomicUsize::new(0),
                force: AtomicBool::new(false),
            }),
        }
    }

    /// Spawn the worker thread and begin the job receive loop.
    pub(crate) fn start(&self) -> io::Result<thread::JoinHandle<()>> {
        let core = self.core.clone();
        thread::Builder::new()
            .name(self.core.name.clone())
            .spawn(move || worker_main(core))
    }

    /// Post a synchronous job. Silently dropped once the executor stopped.
    pub(crate) fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_task(move || async move { f() });
    }

    /// Post a job that runs as a local task on this executor.
    pub(crate) fn post_task<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let job: Job = Box::new(move || Box::pin(f()));
        let guard = self.core.tx.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            self.core.pending.fetch_add(1, Ordering::SeqCst);
            if tx.send(job).is_err() {
                self.core.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.core.pending.load(Ordering::SeqCst)
    }

    pub(crate) fn is_free(&self) -> bool {
        self.pending() == 0
    }

    /// Request shutdown. With `force` the worker abandons queued jobs and
    /// in-flight tasks; otherwise it drains them all before exiting.
    pub(crate) fn close(&self, force: bool) {
        self.core.force.store(force, Ordering::SeqCst);
        drop(self.core.tx.lock().unwrap().take());
    }
}

fn worker_main(core: Arc<Core>) {
    let Some(mut rx) = core.rx.lock().unwrap().take() else {
        return;
    };

    // Runtime construction only fails on resource exhaustion at thread
    // start; nothing useful can run afterwards either way.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let local = LocalSet::new();

    debug!("{} started", core.name);

    local.block_on(&rt, async {
        while let Some(job) = rx.recv().await {
            let guard = PendingGuard(core.clone());
            tokio::task::spawn_local(async move {
                job().await;
                drop(guard);
            });
        }
    });

    // Channel closed. A graceful stop lets every spawned task run to
    // completion; a forced stop drops them here.
    if !core.force.load(Ordering::SeqCst) {
        rt.block_on(local);
    }

    debug!("{} stopped", core.name);
}

struct PendingGuard(Arc<Core>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Fixed size pool of executors with a round robin cursor. Used for the
/// accept and I/O pools.
pub(crate) struct ExecutorPool {
    executors: Vec<Executor>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    cursor: AtomicUsize,
}

impl ExecutorPool {
    pub(crate) fn new(size: usize, name_prefix: &str) -> Self {
        assert_ne!(size, 0, "executor pool must hold at least one executor");

        let executors = (0..size)
            .map(|idx| Executor::new(format!("{name_prefix}-{idx}")))
            .collect();

        Self {
            executors,
            threads: Mutex::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    pub(crate) fn start(&self) -> io::Result<()> {
        let mut threads = self.threads.lock().unwrap();
        if !threads.is_empty() {
            return Ok(());
        }
        for executor in &self.executors {
            threads.push(executor.start()?);
        }
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.executors.len()
    }

    pub(crate) fn executor(&self, idx: usize) -> &Executor {
        &self.executors[idx]
    }

    /// Round robin pick.
    pub(crate) fn next(&self) -> Executor {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.executors.len();
        self.executors[idx].clone()
    }

    pub(crate) fn is_free(&self) -> bool {
        self.executors.iter().all(Executor::is_free)
    }

    /// Stop every executor and join its thread. Graceful stop returns only
    /// after every queued job and in-flight task has completed.
    pub(crate) fn stop(&self, force: bool) {
        for executor in &self.executors {
            executor.close(force);
        }
        for handle in std::mem::take(&mut *self.threads.lock().unwrap()) {
            let _ = handle.join();
        }
    }
}
