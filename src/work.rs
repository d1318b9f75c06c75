use std::sync::Arc;

use crate::{error::CloseReason, event::Event, handler::PeerRef, net::Transport, ServiceHandler};

/// Per-connection callback receiver supplied by the user.
///
/// One `Work` instance is constructed for every preallocated handler and
/// lives for the whole program, reset through [`Work::on_clear`] between
/// connections. Callbacks are synchronous and run to completion on the
/// handler's work executor; they reach handler state only through the
/// handler's `async_*`/`close`/`post_*` operations, which post back to the
/// handler's io executor.
pub trait Work: Sized + Send + 'static {
    type Transport: Transport;

    /// Reset per-connection state. Called once at pool init and again after
    /// every recycle.
    fn on_clear(&mut self, handler: &Arc<ServiceHandler<Self>>) {
        let _ = handler;
    }

    /// The connection is established and usable.
    fn on_open(&mut self, handler: &Arc<ServiceHandler<Self>>);

    /// `n` bytes arrived and are visible through `handler.read_buffer()`.
    fn on_read(&mut self, handler: &Arc<ServiceHandler<Self>>, n: usize);

    /// A previously queued write of `n` bytes completed.
    fn on_write(&mut self, handler: &Arc<ServiceHandler<Self>>, n: usize);

    /// The connection is terminating with cause `reason`. Invoked exactly
    /// once; no other callback fires afterwards.
    fn on_close(&mut self, handler: &Arc<ServiceHandler<Self>>, reason: &CloseReason);

    /// Event posted by this handler's child through `post_parent`.
    fn on_parent(&mut self, handler: &Arc<ServiceHandler<Self>>, ev: Event) {
        let _ = (handler, ev);
    }

    /// Event posted by this handler's parent through `post_child`.
    fn on_child(&mut self, handler: &Arc<ServiceHandler<Self>>, ev: Event) {
        let _ = (handler, ev);
    }

    /// A parent peer was wired to this handler.
    fn on_set_parent(&mut self, handler: &Arc<ServiceHandler<Self>>, parent: &PeerRef) {
        let _ = (handler, parent);
    }

    /// A child peer was wired to this handler.
    fn on_set_child(&mut self, handler: &Arc<ServiceHandler<Self>>, child: &PeerRef) {
        let _ = (handler, child);
    }
}

/// Factory constructing one [`Work`] per preallocated handler.
pub trait WorkAllocator: Send + Sync + 'static {
    type Work: Work;

    fn allocate(&self) -> Self::Work;
}

impl<F, W> WorkAllocator for F
where
    F: Fn() -> W + Send + Sync + 'static,
    W: Work,
{
    type Work = W;

    fn allocate(&self) -> W {
        self()
    }
}
