//! Per-client state and packet preparation helpers

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::Instant;

use meshmonitor_proto::mesh::MeshPacket;

/// Handle to one connected virtual-node client.
///
/// Writes go through an unbounded per-client queue drained by the client's
/// writer task, so fan-out to one slow client never blocks the others.
pub struct ClientHandle {
    pub id: String,
    pub addr: SocketAddr,
    writer_tx: mpsc::UnboundedSender<Vec<u8>>,
    last_activity: RwLock<Instant>,
    shutdown: Notify,
}

impl ClientHandle {
    pub fn new(id: String, addr: SocketAddr) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        (
            ClientHandle {
                id,
                addr,
                writer_tx,
                last_activity: RwLock::new(Instant::now()),
                shutdown: Notify::new(),
            },
            writer_rx,
        )
    }

    /// Queue one framed payload; false means the client is gone.
    pub fn send_frame(&self, frame: Vec<u8>) -> bool {
        self.writer_tx.send(frame).is_ok()
    }

    pub async fn touch(&self) {
        *self.last_activity.write().await = Instant::now();
    }

    pub async fn idle_for(&self) -> Duration {
        self.last_activity.read().await.elapsed()
    }

    /// Ask the client's reader loop to wind down.
    pub fn request_shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    pub async fn shutdown_requested(&self) {
        self.shutdown.notified().await;
    }
}

/// Native clients frequently send with `from = 0`, expecting the radio to
/// fill in its own number. For local storage the echo must carry the real
/// local node number instead.
pub fn substitute_zero_from(packet: &mut MeshPacket, local_node_num: u32) {
    if packet.from == 0 {
        packet.from = local_node_num;
    }
}

/// Prepare a client packet for the radio. PKI-flagged packets with
/// `from = 0` would be rejected by the firmware, so the flag and key are
/// stripped; the radio applies its own key handling on send.
pub fn prepare_forward(packet: &MeshPacket) -> MeshPacket {
    let mut forward = packet.clone();
    if forward.from == 0 && forward.pki_encrypted {
        forward.pki_encrypted = false;
        forward.public_key.clear();
    }
    forward
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_from_substitution() {
        let mut packet = MeshPacket {
            from: 0,
            to: 0x20,
            ..Default::default()
        };
        substitute_zero_from(&mut packet, 0x10);
        assert_eq!(packet.from, 0x10);

        // A real sender number is left alone.
        substitute_zero_from(&mut packet, 0x99);
        assert_eq!(packet.from, 0x10);
    }

    #[test]
    fn test_pki_strip_only_for_zero_from() {
        let packet = MeshPacket {
            from: 0,
            to: 0x20,
            pki_encrypted: true,
            public_key: vec![1, 2, 3],
            ..Default::default()
        };
        let forward = prepare_forward(&packet);
        assert!(!forward.pki_encrypted);
        assert!(forward.public_key.is_empty());

        let packet = MeshPacket {
            from: 0x30,
            to: 0x20,
            pki_encrypted: true,
            public_key: vec![1, 2, 3],
            ..Default::default()
        };
        let forward = prepare_forward(&packet);
        assert!(forward.pki_encrypted);
        assert_eq!(forward.public_key, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_send_frame_after_receiver_drop() {
        let addr: SocketAddr = "127.0.0.1:4403".parse().unwrap();
        let (handle, writer_rx) = ClientHandle::new("vn-1".to_string(), addr);

        assert!(handle.send_frame(vec![1]));
        drop(writer_rx);
        assert!(!handle.send_frame(vec![2]));
    }
}
