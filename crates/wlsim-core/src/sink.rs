// ── Transmit sink ──
//
// Where every frame the core builds goes. Fire-and-forget: a sink never
// reports delivery and never blocks the caller.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

pub trait PacketSink: Send + Sync {
    fn send(&self, packet: Bytes);
}

impl<F> PacketSink for F
where
    F: Fn(Bytes) + Send + Sync,
{
    fn send(&self, packet: Bytes) {
        self(packet);
    }
}

/// Sink backed by an unbounded channel, drained by the I/O side.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PacketSink for ChannelSink {
    fn send(&self, packet: Bytes) {
        if self.tx.send(packet).is_err() {
            trace!("transmit channel closed, dropping frame");
        }
    }
}
