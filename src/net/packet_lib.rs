use std::collections::BTreeMap;
use std::sync::Arc;

use crate::net::packet::PacketWriter;
use crate::world::position::Point3D;

pub mod opcodes {
    pub const NPC_UPDATE: u8 = 0x09;
    pub const OBJECT_REMOVE: u8 = 0x0a;
    pub const DOOR_STATE: u8 = 0x0d;
    pub const NPC_CREATE: u8 = 0x12;
    pub const EQUIPMENT_UPDATE: u8 = 0x15;
}

/// Everything a builder needs to describe an NPC on the wire, captured
/// outside any entity lock.
#[derive(Debug, Clone)]
pub struct NpcSnapshot {
    pub object_id: u16,
    pub name: String,
    pub guild_name: String,
    pub model: u16,
    pub level: u8,
    pub realm: u8,
    pub flags: u8,
    pub position: Point3D,
    pub heading: u16,
    pub speed: u16,
    pub target: Option<Point3D>,
    pub health_percent: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct EquipmentSlot {
    pub slot: u8,
    pub model: u16,
}

#[derive(Debug, Clone, Default)]
pub struct EquipmentSnapshot {
    pub slots: Vec<EquipmentSlot>,
}

#[derive(Debug, Clone, Copy)]
pub struct DoorSnapshot {
    pub door_id: u32,
    pub object_id: u16,
    pub open: bool,
}

/// One outbound builder per protocol version. Adding a version means adding
/// a struct here; entity and AI code only ever hands snapshots to the
/// registry's pick.
pub trait PacketLib: Send + Sync {
    fn version(&self) -> u16;
    fn npc_create(&self, npc: &NpcSnapshot) -> PacketWriter;
    fn npc_update(&self, npc: &NpcSnapshot) -> PacketWriter;
    fn object_remove(&self, object_id: u16) -> PacketWriter;
    fn equipment_update(&self, object_id: u16, equipment: &EquipmentSnapshot) -> PacketWriter;
    fn door_state(&self, door: &DoorSnapshot) -> PacketWriter;
}

/// Base layout, clients 1.68 and up.
pub struct PacketLib168;

impl PacketLib for PacketLib168 {
    fn version(&self) -> u16 {
        168
    }

    fn npc_create(&self, npc: &NpcSnapshot) -> PacketWriter {
        let mut pkt = PacketWriter::tcp(opcodes::NPC_CREATE);
        pkt.write_short(npc.object_id);
        pkt.write_short(npc.speed);
        pkt.write_short(npc.heading);
        pkt.write_short(npc.position.z as u16);
        pkt.write_int(npc.position.x as u32);
        pkt.write_int(npc.position.y as u32);
        pkt.write_short(npc.model);
        pkt.write_byte(npc.level);
        pkt.write_byte(npc.realm);
        pkt.write_byte(npc.flags);
        pkt.write_byte(0);
        pkt.write_pascal_string(&npc.name);
        pkt.write_pascal_string(&npc.guild_name);
        pkt.write_byte(0);
        pkt
    }

    fn npc_update(&self, npc: &NpcSnapshot) -> PacketWriter {
        let mut pkt = PacketWriter::tcp(opcodes::NPC_UPDATE);
        pkt.write_short(npc.object_id);
        pkt.write_short(npc.speed);
        pkt.write_short(npc.heading);
        pkt.write_int(npc.position.x as u32);
        pkt.write_int(npc.position.y as u32);
        pkt.write_short(npc.position.z as u16);
        match npc.target {
            Some(target) => {
                pkt.write_int(target.x as u32);
                pkt.write_int(target.y as u32);
                pkt.write_short(target.z as u16);
            }
            None => {
                pkt.fill(0, 10);
            }
        }
        pkt.write_byte(npc.flags);
        pkt
    }

    fn object_remove(&self, object_id: u16) -> PacketWriter {
        let mut pkt = PacketWriter::tcp(opcodes::OBJECT_REMOVE);
        pkt.write_short(object_id);
        pkt.write_short(1);
        pkt
    }

    fn equipment_update(&self, object_id: u16, equipment: &EquipmentSnapshot) -> PacketWriter {
        let mut pkt = PacketWriter::tcp(opcodes::EQUIPMENT_UPDATE);
        pkt.write_short(object_id);
        pkt.write_byte(equipment.slots.len() as u8);
        for slot in &equipment.slots {
            pkt.write_byte(slot.slot);
            pkt.write_short(slot.model);
        }
        pkt
    }

    fn door_state(&self, door: &DoorSnapshot) -> PacketWriter {
        let mut pkt = PacketWriter::tcp(opcodes::DOOR_STATE);
        pkt.write_int(door.door_id);
        pkt.write_short(door.object_id);
        pkt.write_byte(if door.open { 1 } else { 0 });
        pkt.fill(0, 3);
        pkt
    }
}

/// 1.73 reworked the create layout: flags grew a second byte and the name
/// block moved behind it. Everything else delegates down.
pub struct PacketLib173 {
    base: PacketLib168,
}

impl PacketLib173 {
    pub fn new() -> Self {
        Self { base: PacketLib168 }
    }
}

impl Default for PacketLib173 {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketLib for PacketLib173 {
    fn version(&self) -> u16 {
        173
    }

    fn npc_create(&self, npc: &NpcSnapshot) -> PacketWriter {
        let mut pkt = PacketWriter::tcp(opcodes::NPC_CREATE);
        pkt.write_short(npc.object_id);
        pkt.write_short(npc.speed);
        pkt.write_short(npc.heading);
        pkt.write_short(npc.position.z as u16);
        pkt.write_int(npc.position.x as u32);
        pkt.write_int(npc.position.y as u32);
        pkt.write_short(npc.model);
        pkt.write_byte(npc.level);
        pkt.write_byte(npc.realm);
        pkt.write_short(u16::from(npc.flags));
        pkt.write_pascal_string(&npc.name);
        pkt.write_pascal_string(&npc.guild_name);
        pkt.write_byte(0);
        pkt
    }

    fn npc_update(&self, npc: &NpcSnapshot) -> PacketWriter {
        self.base.npc_update(npc)
    }

    fn object_remove(&self, object_id: u16) -> PacketWriter {
        self.base.object_remove(object_id)
    }

    fn equipment_update(&self, object_id: u16, equipment: &EquipmentSnapshot) -> PacketWriter {
        self.base.equipment_update(object_id, equipment)
    }

    fn door_state(&self, door: &DoorSnapshot) -> PacketWriter {
        self.base.door_state(door)
    }
}

/// 1.94 appends the health percentage to the update packet.
pub struct PacketLib194 {
    base: PacketLib173,
}

impl PacketLib194 {
    pub fn new() -> Self {
        Self {
            base: PacketLib173::new(),
        }
    }
}

impl Default for PacketLib194 {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketLib for PacketLib194 {
    fn version(&self) -> u16 {
        194
    }

    fn npc_create(&self, npc: &NpcSnapshot) -> PacketWriter {
        self.base.npc_create(npc)
    }

    fn npc_update(&self, npc: &NpcSnapshot) -> PacketWriter {
        let mut pkt = self.base.npc_update(npc);
        pkt.write_byte(npc.health_percent);
        pkt
    }

    fn object_remove(&self, object_id: u16) -> PacketWriter {
        self.base.object_remove(object_id)
    }

    fn equipment_update(&self, object_id: u16, equipment: &EquipmentSnapshot) -> PacketWriter {
        self.base.equipment_update(object_id, equipment)
    }

    fn door_state(&self, door: &DoorSnapshot) -> PacketWriter {
        self.base.door_state(door)
    }
}

/// 1.95 changed nothing on these packets; it exists so clients reporting
/// 195 resolve to a lib of their own version.
pub struct PacketLib195 {
    base: PacketLib194,
}

impl PacketLib195 {
    pub fn new() -> Self {
        Self {
            base: PacketLib194::new(),
        }
    }
}

impl Default for PacketLib195 {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketLib for PacketLib195 {
    fn version(&self) -> u16 {
        195
    }

    fn npc_create(&self, npc: &NpcSnapshot) -> PacketWriter {
        self.base.npc_create(npc)
    }

    fn npc_update(&self, npc: &NpcSnapshot) -> PacketWriter {
        self.base.npc_update(npc)
    }

    fn object_remove(&self, object_id: u16) -> PacketWriter {
        self.base.object_remove(object_id)
    }

    fn equipment_update(&self, object_id: u16, equipment: &EquipmentSnapshot) -> PacketWriter {
        self.base.equipment_update(object_id, equipment)
    }

    fn door_state(&self, door: &DoorSnapshot) -> PacketWriter {
        self.base.door_state(door)
    }
}

/// Maps a client-reported version to a builder: exact match, else the
/// highest registered version below it. Versions under the oldest
/// registered lib are a configuration error.
pub struct PacketLibRegistry {
    libs: BTreeMap<u16, Arc<dyn PacketLib>>,
}

impl PacketLibRegistry {
    pub fn new() -> Self {
        Self {
            libs: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, lib: Arc<dyn PacketLib>) {
        self.libs.insert(lib.version(), lib);
    }

    /// All shipped builders.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PacketLib168));
        registry.register(Arc::new(PacketLib173::new()));
        registry.register(Arc::new(PacketLib194::new()));
        registry.register(Arc::new(PacketLib195::new()));
        registry
    }

    pub fn for_version(&self, version: u16) -> Result<Arc<dyn PacketLib>, String> {
        match self.libs.range(..=version).next_back() {
            Some((_, lib)) => Ok(Arc::clone(lib)),
            None => Err(format!(
                "no packet lib for client version {} (oldest supported is {})",
                version,
                self.libs
                    .keys()
                    .next()
                    .copied()
                    .unwrap_or(0)
            )),
        }
    }
}

impl Default for PacketLibRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
