use std::sync::Arc;

use parking_lot::RwLock;
use quorum_network::{encode_frame, Dispatcher, MsgSender, NetworkError, WireMessage};
use tracing::debug;

/// Message sender used while no external transport is wired: frames are
/// encoded and fed straight back into the local dispatcher, which keeps the
/// full cast/verify loop running on a standalone node. An embedding with a
/// real transport supplies its own [`MsgSender`] instead.
#[derive(Default)]
pub struct LoopbackSender {
    dispatcher: RwLock<Option<Arc<Dispatcher>>>,
}

impl LoopbackSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// The dispatcher is built after the sender (they reference each other
    /// through the processor), so it is attached late.
    pub fn attach(&self, dispatcher: Arc<Dispatcher>) {
        *self.dispatcher.write() = Some(dispatcher);
    }

    fn deliver(&self, msg: WireMessage) -> quorum_network::Result<()> {
        let Some(dispatcher) = self.dispatcher.read().clone() else {
            debug!(msg = msg.name(), "no dispatcher attached, message dropped");
            return Ok(());
        };
        let frame = encode_frame(&msg)?;
        match dispatcher.dispatch("local", &frame) {
            Ok(()) | Err(NetworkError::Handler(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl MsgSender for LoopbackSender {
    fn send(&self, _id: &str, msg: WireMessage) -> quorum_network::Result<()> {
        self.deliver(msg)
    }

    fn broadcast_group(&self, msg: WireMessage) -> quorum_network::Result<()> {
        self.deliver(msg)
    }
}
