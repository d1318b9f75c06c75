use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::{error::CloseReason, executor::Executor, work::Work, work::WorkAllocator};

use super::{HandlerConfig, ServiceHandler, Status};

/// Fixed pool of preallocated service handlers.
///
/// The pool owns every handler for the whole program; `get` hands out
/// non-owning references which stay valid for exactly one connection.
/// Buffer sizes and the inactivity timeout are pool wide configuration
/// shared by all handlers.
pub(crate) struct HandlerPool<W: Work> {
    handlers: Vec<Arc<ServiceHandler<W>>>,
    free: Mutex<Vec<usize>>,
    capacity: usize,
}

impl<W: Work> HandlerPool<W> {
    pub(crate) fn new<A>(allocator: &A, capacity: usize, cfg: HandlerConfig) -> Arc<Self>
    where
        A: WorkAllocator<Work = W>,
    {
        assert_ne!(capacity, 0, "handler pool must preallocate at least one handler");

        let pool = Arc::new_cyclic(|weak: &Weak<HandlerPool<W>>| {
            let handlers = (0..capacity)
                .map(|slot| ServiceHandler::new(slot, cfg.clone(), allocator.allocate(), weak.clone()))
                .collect();

            HandlerPool {
                handlers,
                // popped from the back; reversed so low slots go out first.
                free: Mutex::new((0..capacity).rev().collect()),
                capacity,
            }
        });

        for handler in &pool.handlers {
            handler.clear_in_place();
        }

        pool
    }

    /// Next free handler, pinned to the given executors. `None` when the
    /// pool is exhausted; the accept path then refuses the connection.
    pub(crate) fn get(
        &self,
        io_exec: Executor,
        work_exec: Executor,
    ) -> Option<Arc<ServiceHandler<W>>> {
        let slot = self.free.lock().unwrap().pop()?;
        let handler = self.handlers[slot].clone();
        handler.assign(io_exec, work_exec);
        Some(handler)
    }

    /// Return a recycled handler to the free list.
    pub(crate) fn put(&self, slot: usize) {
        let mut free = self.free.lock().unwrap();
        debug_assert!(free.len() < self.capacity);
        debug_assert!(!free.contains(&slot));
        free.push(slot);
        debug!("handler {slot} recycled, load {}", self.capacity - free.len());
    }

    /// Handlers currently out of the free list.
    pub(crate) fn load(&self) -> usize {
        self.capacity - self.free.lock().unwrap().len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.load() == 0
    }

    /// Ask every in-flight handler to close. Used by graceful stop before
    /// the io pool drains.
    pub(crate) fn close_all(&self) {
        for handler in &self.handlers {
            if handler.status() != Status::Pooled {
                handler.close_with(CloseReason::Stopped);
            }
        }
    }
}
