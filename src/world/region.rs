use std::sync::{Arc, RwLock};

use log::debug;

use crate::net::packet_lib::PacketLibRegistry;
use crate::world::door::Door;
use crate::world::entity::{
    read_unpoisoned, write_unpoisoned, EntityHandle, EntityTable, WorldEntity,
};
use crate::world::npc::Npc;
use crate::world::player::Player;
use crate::world::position::Point3D;
use crate::world::timer::{RegionClock, Scheduler};
use crate::world::visibility;

/// One region: an entity table, a time base, an action scheduler and the
/// packet builders for every client version connected to it.
pub struct Region {
    me: std::sync::Weak<Region>,
    id: u16,
    name: String,
    broadcast_radius: i32,
    clock: Arc<RegionClock>,
    scheduler: Scheduler,
    packet_libs: Arc<PacketLibRegistry>,
    entities: RwLock<EntityTable>,
}

impl Region {
    pub fn new(id: u16, name: &str, broadcast_radius: i32, clock: Arc<RegionClock>) -> Arc<Self> {
        let scheduler = Scheduler::new(Arc::clone(&clock));
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            id,
            name: name.to_owned(),
            broadcast_radius,
            clock,
            scheduler,
            packet_libs: Arc::new(PacketLibRegistry::standard()),
            entities: RwLock::new(EntityTable::new()),
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn broadcast_radius(&self) -> i32 {
        self.broadcast_radius
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn clock(&self) -> &Arc<RegionClock> {
        &self.clock
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn packet_libs(&self) -> &Arc<PacketLibRegistry> {
        &self.packet_libs
    }

    pub fn start_workers(&self, count: usize) {
        self.scheduler.spawn_workers(count);
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    pub fn entity_count(&self) -> usize {
        read_unpoisoned(&self.entities).len()
    }

    pub fn resolve(&self, handle: EntityHandle) -> Option<WorldEntity> {
        read_unpoisoned(&self.entities).resolve(handle).cloned()
    }

    /// Active players within the broadcast radius of a spot. Recomputed on
    /// every call; the result is a snapshot, released before any sends.
    pub fn players_in_radius(&self, center: Point3D) -> Vec<Arc<Player>> {
        let entities = read_unpoisoned(&self.entities);
        entities
            .iter()
            .filter_map(|(_, entity)| entity.as_player())
            .filter(|player| player.lifecycle().is_active())
            .filter(|player| player.position().within_radius(center, self.broadcast_radius))
            .cloned()
            .collect()
    }

    pub fn add_player(&self, player: Arc<Player>) -> EntityHandle {
        let (handle, object_id) = {
            let mut entities = write_unpoisoned(&self.entities);
            let object_id = entities.allocate_object_id();
            let handle = entities.insert(WorldEntity::Player(Arc::clone(&player)));
            (handle, object_id)
        };
        player.set_handle(handle);
        player.set_object_id(object_id);
        player.lifecycle().activate();
        debug!("player {} entered region {}", player.name(), self.id);
        handle
    }

    pub fn remove_player(&self, player: &Arc<Player>) {
        let handle = player.handle();
        write_unpoisoned(&self.entities).remove(handle);
        player.lifecycle().delete();
    }

    /// Puts an NPC into the world: slot and wire id, spawn-point capture,
    /// the entry broadcast, and the brain's first think.
    pub fn add_npc(&self, npc: Arc<Npc>) -> EntityHandle {
        let (handle, object_id) = {
            let mut entities = write_unpoisoned(&self.entities);
            let object_id = entities.allocate_object_id();
            let handle = entities.insert(WorldEntity::Npc(Arc::clone(&npc)));
            (handle, object_id)
        };
        let Some(me) = self.me.upgrade() else {
            return handle;
        };
        npc.attach(&me, handle, object_id);
        npc.lifecycle().activate();
        npc.capture_spawn_point();
        visibility::broadcast_npc_create(&me, &npc);
        npc.start_brain(&me);
        handle
    }

    /// Takes an NPC out of the world: observers get the removal packet,
    /// then the slot is freed and the entity torn down. Safe to call twice.
    pub fn remove_npc(&self, npc: &Arc<Npc>) {
        if npc.lifecycle().is_deleted() {
            return;
        }
        if let Some(me) = self.me.upgrade() {
            visibility::broadcast_object_remove(&me, npc.object_id(), npc.position(self.now_ms()));
        }
        let handle = npc.handle();
        write_unpoisoned(&self.entities).remove(handle);
        npc.tear_down();
    }

    pub fn add_door(&self, door: Arc<Door>) -> EntityHandle {
        let (handle, object_id) = {
            let mut entities = write_unpoisoned(&self.entities);
            let object_id = entities.allocate_object_id();
            let handle = entities.insert(WorldEntity::Door(Arc::clone(&door)));
            (handle, object_id)
        };
        if let Some(me) = self.me.upgrade() {
            door.attach(&me, handle, object_id);
        }
        door.lifecycle().activate();
        handle
    }

    pub fn remove_door(&self, door: &Arc<Door>) {
        if door.lifecycle().is_deleted() {
            return;
        }
        if let Some(me) = self.me.upgrade() {
            visibility::broadcast_object_remove(&me, door.object_id(), door.position());
        }
        write_unpoisoned(&self.entities).remove(door.handle());
        door.tear_down();
    }
}
