use std::sync::Arc;

use log::warn;

use crate::world::door::Door;
use crate::world::npc::Npc;
use crate::world::position::Point3D;
use crate::world::region::Region;

/// Sends the full create packet (plus equipment, if any) to everyone who
/// can currently see the NPC. Used on world entry and whenever an
/// identity field changes, since clients only read those from the create.
pub fn broadcast_npc_create(region: &Arc<Region>, npc: &Arc<Npc>) {
    if !npc.lifecycle().is_active() {
        return;
    }
    let now = region.now_ms();
    let snapshot = npc.snapshot(now);
    let equipment = npc.equipment();
    let observers = region.players_in_radius(snapshot.position);
    npc.mark_updated(now);

    let mut delivered = false;
    for player in &observers {
        let lib = match region.packet_libs().for_version(player.version()) {
            Ok(lib) => lib,
            Err(err) => {
                warn!("dropping create for {}: {}", player.name(), err);
                continue;
            }
        };
        player.send_packet(lib.npc_create(&snapshot));
        if let Some(equipment) = &equipment {
            player.send_packet(lib.equipment_update(snapshot.object_id, equipment));
        }
        delivered = true;
    }
    if delivered {
        npc.npc_updated_callback(region, now);
    }
}

/// Sends the lightweight movement/heading/speed update. Exactly one packet
/// per observer, built for that observer's negotiated version.
pub fn broadcast_npc_update(region: &Arc<Region>, npc: &Arc<Npc>) {
    if !npc.lifecycle().is_active() {
        return;
    }
    let now = region.now_ms();
    let snapshot = npc.snapshot(now);
    let observers = region.players_in_radius(snapshot.position);
    npc.mark_updated(now);

    let mut delivered = false;
    for player in &observers {
        let lib = match region.packet_libs().for_version(player.version()) {
            Ok(lib) => lib,
            Err(err) => {
                warn!("dropping update for {}: {}", player.name(), err);
                continue;
            }
        };
        player.send_packet(lib.npc_update(&snapshot));
        delivered = true;
    }
    if delivered {
        npc.npc_updated_callback(region, now);
    }
}

/// Tells everyone near `position` that an object left the world.
pub fn broadcast_object_remove(region: &Arc<Region>, object_id: u16, position: Point3D) {
    for player in region.players_in_radius(position) {
        let lib = match region.packet_libs().for_version(player.version()) {
            Ok(lib) => lib,
            Err(err) => {
                warn!("dropping removal for {}: {}", player.name(), err);
                continue;
            }
        };
        player.send_packet(lib.object_remove(object_id));
    }
}

pub fn broadcast_door_state(region: &Arc<Region>, door: &Door) {
    if !door.lifecycle().is_active() {
        return;
    }
    let snapshot = door.snapshot();
    for player in region.players_in_radius(door.position()) {
        let lib = match region.packet_libs().for_version(player.version()) {
            Ok(lib) => lib,
            Err(err) => {
                warn!("dropping door state for {}: {}", player.name(), err);
                continue;
            }
        };
        player.send_packet(lib.door_state(&snapshot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::packet_lib::opcodes;
    use crate::world::player::testing::CapturingSink;
    use crate::world::player::{Player, PlayerSession};
    use crate::world::timer::RegionClock;

    fn region_with_radius(radius: i32) -> (Arc<RegionClock>, Arc<Region>) {
        let clock = RegionClock::manual();
        let region = Region::new(7, "emain macha", radius, Arc::clone(&clock));
        (clock, region)
    }

    fn observer(
        region: &Arc<Region>,
        name: &str,
        position: Point3D,
        version: u16,
    ) -> Arc<CapturingSink> {
        let sink = CapturingSink::new();
        let player = Player::new(name, position, PlayerSession::new(version, sink.clone()));
        region.add_player(player);
        sink
    }

    #[test]
    fn update_reaches_only_players_in_radius() {
        let (_clock, region) = region_with_radius(500);
        let near = observer(&region, "nearby", Point3D::new(400, 0, 0), 168);
        let far = observer(&region, "faraway", Point3D::new(2000, 0, 0), 168);

        let npc = Npc::new("roaming boar", 410, 3, Point3D::new(0, 0, 0));
        region.add_npc(Arc::clone(&npc));
        near.packets.lock().unwrap().clear();
        far.packets.lock().unwrap().clear();

        // Teleport to a spot 300 units from the near player.
        npc.move_to(Point3D::new(100, 0, 0), 0);

        assert_eq!(near.count(), 1);
        assert_eq!(near.opcodes(), vec![opcodes::NPC_UPDATE]);
        assert_eq!(far.count(), 0);
    }

    #[test]
    fn create_goes_out_on_world_entry() {
        let (_clock, region) = region_with_radius(500);
        let sink = observer(&region, "watcher", Point3D::new(0, 0, 0), 168);

        let npc = Npc::new("town crier", 7, 20, Point3D::new(50, 50, 0));
        region.add_npc(npc);

        assert_eq!(sink.opcodes(), vec![opcodes::NPC_CREATE]);
    }

    #[test]
    fn identity_change_resends_create() {
        let (_clock, region) = region_with_radius(500);
        let sink = observer(&region, "watcher", Point3D::new(0, 0, 0), 168);

        let npc = Npc::new("renamed one", 7, 20, Point3D::new(50, 50, 0));
        region.add_npc(Arc::clone(&npc));
        sink.packets.lock().unwrap().clear();

        npc.set_name("the renamed one");
        assert_eq!(sink.opcodes(), vec![opcodes::NPC_CREATE]);

        sink.packets.lock().unwrap().clear();
        npc.set_heading(2048);
        assert_eq!(sink.opcodes(), vec![opcodes::NPC_UPDATE]);
    }

    #[test]
    fn each_observer_gets_its_own_version_layout() {
        let (_clock, region) = region_with_radius(500);
        let old_client = observer(&region, "old", Point3D::new(10, 0, 0), 168);
        let new_client = observer(&region, "new", Point3D::new(20, 0, 0), 194);

        let npc = Npc::new("versioned", 7, 20, Point3D::new(0, 0, 0));
        region.add_npc(Arc::clone(&npc));
        old_client.packets.lock().unwrap().clear();
        new_client.packets.lock().unwrap().clear();

        npc.set_heading(1024);
        let old_pkt = old_client.packets.lock().unwrap()[0].clone();
        let new_pkt = new_client.packets.lock().unwrap()[0].clone();
        // 1.94 appends the health byte to the update.
        assert_eq!(new_pkt.len(), old_pkt.len() + 1);
    }

    #[test]
    fn removal_notifies_observers() {
        let (_clock, region) = region_with_radius(500);
        let sink = observer(&region, "watcher", Point3D::new(0, 0, 0), 168);

        let npc = Npc::new("short lived", 7, 1, Point3D::new(10, 10, 0));
        region.add_npc(Arc::clone(&npc));
        sink.packets.lock().unwrap().clear();

        region.remove_npc(&npc);
        assert_eq!(sink.opcodes(), vec![opcodes::OBJECT_REMOVE]);
        assert_eq!(region.entity_count(), 1);
    }

    #[test]
    fn delivered_update_marks_npc_visible() {
        let (clock, region) = region_with_radius(500);
        let npc = Npc::new("lonely", 7, 1, Point3D::new(0, 0, 0));
        region.add_npc(Arc::clone(&npc));

        // Nobody around: no delivery, never visible.
        npc.set_heading(100);
        assert!(!npc.is_visible_to_players(region.now_ms()));

        observer(&region, "watcher", Point3D::new(0, 0, 0), 168);
        npc.set_heading(200);
        assert!(npc.is_visible_to_players(region.now_ms()));

        // The window closes 60s after the last delivered update.
        clock.advance(60_000);
        assert!(npc.is_visible_to_players(region.now_ms()));
        clock.advance(1);
        assert!(!npc.is_visible_to_players(region.now_ms()));
    }

    #[test]
    fn equipment_rides_the_create_resend() {
        use crate::net::packet_lib::{EquipmentSlot, EquipmentSnapshot};

        let (_clock, region) = region_with_radius(500);
        let sink = observer(&region, "watcher", Point3D::new(0, 0, 0), 168);

        let npc = Npc::new("armored guard", 8, 50, Point3D::new(5, 5, 0));
        region.add_npc(Arc::clone(&npc));
        sink.packets.lock().unwrap().clear();

        npc.set_equipment(Some(EquipmentSnapshot {
            slots: vec![EquipmentSlot { slot: 12, model: 61 }],
        }));
        assert_eq!(
            sink.opcodes(),
            vec![opcodes::NPC_CREATE, opcodes::EQUIPMENT_UPDATE]
        );
    }
}
