use tokio::sync::mpsc::UnboundedSender;

use super::Command;

#[derive(Clone)]
pub struct ServerHandle {
    pub(super) tx: UnboundedSender<Command>,
}

impl ServerHandle {
    /// Stop the server with graceful flag.
    ///
    /// Graceful stop drains in-flight connections through their close
    /// protocol so every handler observes `on_close`; forced stop abandons
    /// them.
    pub fn stop(&self, graceful: bool) {
        let cmd = if graceful {
            Command::GracefulStop
        } else {
            Command::ForceStop
        };

        let _ = self.tx.send(cmd);
    }
}
