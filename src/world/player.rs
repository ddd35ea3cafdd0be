use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use crate::net::packet::PacketWriter;
use crate::world::entity::{lock_unpoisoned, EntityHandle, Lifecycle};
use crate::world::position::Point3D;

/// Where finished packets for one client go. The transport side implements
/// this; the world core only ever writes bytes into it.
pub trait PacketSink: Send + Sync {
    fn send(&self, bytes: &[u8]);
}

struct DiscardingSink;

impl PacketSink for DiscardingSink {
    fn send(&self, _bytes: &[u8]) {}
}

/// Negotiated session state for a connected client.
pub struct PlayerSession {
    version: u16,
    sink: Arc<dyn PacketSink>,
}

impl PlayerSession {
    pub fn new(version: u16, sink: Arc<dyn PacketSink>) -> Self {
        Self { version, sink }
    }

    /// A session that drops everything, for tests and load tools.
    pub fn discarding(version: u16) -> Self {
        Self {
            version,
            sink: Arc::new(DiscardingSink),
        }
    }

    pub fn version(&self) -> u16 {
        self.version
    }
}

/// A connected player as the world sees it: a position, a lifecycle and an
/// outbound session. Everything else about players lives outside this core.
pub struct Player {
    lifecycle: Lifecycle,
    handle: Mutex<EntityHandle>,
    object_id: AtomicU16,
    name: String,
    position: Mutex<Point3D>,
    session: PlayerSession,
}

impl Player {
    pub fn new(name: &str, position: Point3D, session: PlayerSession) -> Arc<Self> {
        Arc::new(Self {
            lifecycle: Lifecycle::new(),
            handle: Mutex::new(EntityHandle::DETACHED),
            object_id: AtomicU16::new(0),
            name: name.to_owned(),
            position: Mutex::new(position),
            session,
        })
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> EntityHandle {
        *lock_unpoisoned(&self.handle)
    }

    pub(crate) fn set_handle(&self, handle: EntityHandle) {
        *lock_unpoisoned(&self.handle) = handle;
    }

    pub fn object_id(&self) -> u16 {
        self.object_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_object_id(&self, id: u16) {
        self.object_id.store(id, Ordering::Release);
    }

    pub fn version(&self) -> u16 {
        self.session.version()
    }

    pub fn position(&self) -> Point3D {
        *lock_unpoisoned(&self.position)
    }

    pub fn set_position(&self, position: Point3D) {
        *lock_unpoisoned(&self.position) = position;
    }

    /// Finalizes the length field and hands the bytes to the session sink.
    pub fn send_packet(&self, mut packet: PacketWriter) {
        packet.write_packet_length();
        self.session.sink.send(packet.as_bytes());
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Captures every packet sent to it, newest last.
    pub struct CapturingSink {
        pub packets: Mutex<Vec<Vec<u8>>>,
    }

    impl CapturingSink {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                packets: Mutex::new(Vec::new()),
            })
        }

        pub fn count(&self) -> usize {
            self.packets.lock().unwrap().len()
        }

        pub fn opcodes(&self) -> Vec<u8> {
            self.packets
                .lock()
                .unwrap()
                .iter()
                .map(|p| p[2])
                .collect()
        }
    }

    impl PacketSink for CapturingSink {
        fn send(&self, bytes: &[u8]) {
            self.packets.lock().unwrap().push(bytes.to_vec());
        }
    }
}
