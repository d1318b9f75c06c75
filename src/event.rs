/// Kind of a paired-handler event.
///
/// `Child*` kinds travel child to parent and are observed in
/// [`Work::on_parent`](crate::Work::on_parent); `Parent*` kinds travel
/// parent to child and are observed in [`Work::on_child`](crate::Work::on_child).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Child is connected; the parent may start reading.
    ChildOpen,
    /// Parent's read buffer holds `value` bytes for the child to transmit.
    ParentWrite,
    /// Child's read buffer holds `value` bytes for the parent to transmit.
    ChildWrite,
    /// Parent has terminated.
    ParentClose,
    /// Child has terminated.
    ChildClose,
}

/// Small value record exchanged between paired handlers.
///
/// Events for a given peer are delivered in the order posted, on the
/// destination's work executor. Events addressed to a peer that has
/// already closed are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    kind: EventKind,
    value: usize,
}

impl Event {
    pub fn new(kind: EventKind, value: usize) -> Self {
        Self { kind, value }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Payload: a byte count for the write kinds, zero otherwise.
    pub fn value(&self) -> usize {
        self.value
    }

    pub fn child_open() -> Self {
        Self::new(EventKind::ChildOpen, 0)
    }

    pub fn parent_write(n: usize) -> Self {
        Self::new(EventKind::ParentWrite, n)
    }

    pub fn child_write(n: usize) -> Self {
        Self::new(EventKind::ChildWrite, n)
    }

    pub fn parent_close() -> Self {
        Self::new(EventKind::ParentClose, 0)
    }

    pub fn child_close() -> Self {
        Self::new(EventKind::ChildClose, 0)
    }
}
