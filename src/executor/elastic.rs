use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    thread,
};

use tracing::{error, info};

use super::Executor;

/// Elastic pool of work executors.
///
/// All `high_watermark` executors exist up front; only the active prefix
/// has a worker thread. `next` grows the prefix whenever the caller's load
/// hint exceeds `thread_load` work units per active executor. Workers never
/// retire: an idle executor parks on its empty job channel.
pub(crate) struct ElasticPool {
    executors: Vec<Executor>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    active: AtomicUsize,
    init_size: usize,
    thread_load: usize,
    cursor: AtomicUsize,
}

impl ElasticPool {
    pub(crate) fn new(init_size: usize, high_watermark: usize, thread_load: usize, name_prefix: &str) -> Self {
        assert_ne!(init_size, 0, "work pool must start with at least one executor");
        assert!(
            high_watermark >= init_size,
            "work pool high watermark below its init size"
        );
        assert_ne!(thread_load, 0, "work pool thread load must be positive");

        let executors = (0..high_watermark)
            .map(|idx| Executor::new(format!("{name_prefix}-{idx}")))
            .collect();

        Self {
            executors,
            threads: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            init_size,
            thread_load,
            cursor: AtomicUsize::new(0),
        }
    }

    pub(crate) fn start(&self) {
        self.activate(self.init_size);
    }

    /// Round robin pick over the active prefix, growing it first when the
    /// load hint asks for more capacity.
    pub(crate) fn next(&self, load: usize) -> Executor {
        let active = self.active.load(Ordering::Acquire);
        if active < self.executors.len() && load > active * self.thread_load {
            self.activate(active + 1);
        }

        let active = self.active.load(Ordering::Acquire).max(1);
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % active;
        self.executors[idx].clone()
    }

    pub(crate) fn is_free(&self) -> bool {
        let active = self.active.load(Ordering::Acquire);
        self.executors[..active].iter().all(Executor::is_free)
    }

    pub(crate) fn stop(&self, force: bool) {
        for executor in &self.executors {
            executor.close(force);
        }
        for handle in std::mem::take(&mut *self.threads.lock().unwrap()) {
            let _ = handle.join();
        }
    }

    fn activate(&self, target: usize) {
        let mut threads = self.threads.lock().unwrap();
        while threads.len() < target.min(self.executors.len()) {
            let idx = threads.len();
            match self.executors[idx].start() {
                Ok(handle) => {
                    threads.push(handle);
                    if idx >= self.init_size {
                        info!("work pool grown to {} executors", idx + 1);
                    }
                }
                Err(e) => {
                    error!("failed to spawn work executor {idx}: {e}");
                    break;
                }
            }
        }
        self.active.store(threads.len(), Ordering::Release);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn grows_with_load_up_to_watermark() {
        let pool = ElasticPool::new(1, 3, 2, "pylon-test-work");
        pool.start();
        assert_eq!(pool.active.load(Ordering::SeqCst), 1);

        // Load within budget: no growth.
        let _ = pool.next(2);
        assert_eq!(pool.active.load(Ordering::SeqCst), 1);

        // Load above budget grows one executor per pick, up to the watermark.
        let _ = pool.next(3);
        assert_eq!(pool.active.load(Ordering::SeqCst), 2);
        let _ = pool.next(100);
        assert_eq!(pool.active.load(Ordering::SeqCst), 3);
        let _ = pool.next(1000);
        assert_eq!(pool.active.load(Ordering::SeqCst), 3);

        pool.stop(false);
    }

    #[test]
    fn distributes_over_active_prefix() {
        let pool = ElasticPool::new(2, 4, 1000, "pylon-test-prefix");
        pool.start();

        let a = pool.next(0);
        let b = pool.next(0);
        let a2 = pool.next(0);

        assert!(std::sync::Arc::ptr_eq(&a.core, &a2.core));
        assert!(!std::sync::Arc::ptr_eq(&a.core, &b.core));

        pool.stop(false);
    }
}
