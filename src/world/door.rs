use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::net::packet_lib::DoorSnapshot;
use crate::world::entity::{lock_unpoisoned, EntityHandle, Lifecycle};
use crate::world::position::Point3D;
use crate::world::region::Region;
use crate::world::timer::RegionTimer;
use crate::world::visibility;

/// Doors swing shut on their own after this long.
pub const AUTO_CLOSE_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorState {
    Open,
    Closed,
}

/// A door in the world. Opening broadcasts the new state and arms the
/// auto-close action; nothing polls doors.
pub struct Door {
    me: Weak<Door>,
    lifecycle: Lifecycle,
    object_id: AtomicU16,
    handle: Mutex<EntityHandle>,
    region: Mutex<Weak<Region>>,
    door_id: u32,
    position: Point3D,
    state: Mutex<DoorState>,
    close_timer: Mutex<Option<RegionTimer>>,
}

impl Door {
    pub fn new(door_id: u32, position: Point3D) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            lifecycle: Lifecycle::new(),
            object_id: AtomicU16::new(0),
            handle: Mutex::new(EntityHandle::DETACHED),
            region: Mutex::new(Weak::new()),
            door_id,
            position,
            state: Mutex::new(DoorState::Closed),
            close_timer: Mutex::new(None),
        })
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn door_id(&self) -> u32 {
        self.door_id
    }

    pub fn object_id(&self) -> u16 {
        self.object_id.load(Ordering::Acquire)
    }

    pub fn handle(&self) -> EntityHandle {
        *lock_unpoisoned(&self.handle)
    }

    pub fn position(&self) -> Point3D {
        self.position
    }

    pub fn state(&self) -> DoorState {
        *lock_unpoisoned(&self.state)
    }

    pub(crate) fn attach(&self, region: &Arc<Region>, handle: EntityHandle, object_id: u16) {
        *lock_unpoisoned(&self.region) = Arc::downgrade(region);
        *lock_unpoisoned(&self.handle) = handle;
        self.object_id.store(object_id, Ordering::Release);
    }

    pub(crate) fn tear_down(&self) {
        if !self.lifecycle.delete() {
            return;
        }
        if let Some(timer) = lock_unpoisoned(&self.close_timer).take() {
            timer.stop();
        }
    }

    pub fn open(&self, region: &Arc<Region>) {
        {
            let mut state = lock_unpoisoned(&self.state);
            if *state == DoorState::Open {
                return;
            }
            *state = DoorState::Open;
        }
        visibility::broadcast_door_state(region, self);

        let closing = self.me.clone();
        let region_ref = Arc::downgrade(region);
        let timer = region.scheduler().entity_timer(
            region,
            self.handle(),
            Box::new(move |_now| {
                if let (Some(door), Some(region)) = (closing.upgrade(), region_ref.upgrade()) {
                    door.close(&region);
                }
                0
            }),
        );
        timer.start(AUTO_CLOSE_MS);
        let mut slot = lock_unpoisoned(&self.close_timer);
        if let Some(old) = slot.replace(timer) {
            old.stop();
        }
    }

    pub fn close(&self, region: &Arc<Region>) {
        {
            let mut state = lock_unpoisoned(&self.state);
            if *state == DoorState::Closed {
                return;
            }
            *state = DoorState::Closed;
        }
        if let Some(timer) = lock_unpoisoned(&self.close_timer).take() {
            timer.stop();
        }
        visibility::broadcast_door_state(region, self);
    }

    /// Field assignment only; never arms the close action.
    pub fn load_from_record(&self, record: &crate::persistence::record::Record) {
        if let Some(open) = record.byte("open") {
            *lock_unpoisoned(&self.state) = if open != 0 {
                DoorState::Open
            } else {
                DoorState::Closed
            };
        }
    }

    pub fn save_to_record(&self) -> crate::persistence::record::Record {
        let mut record = crate::persistence::record::Record::new();
        record.set_int("door_id", i64::from(self.door_id));
        record.set_int("x", i64::from(self.position.x));
        record.set_int("y", i64::from(self.position.y));
        record.set_int("z", i64::from(self.position.z));
        record.set_byte("open", u8::from(self.state() == DoorState::Open));
        record
    }

    pub fn snapshot(&self) -> DoorSnapshot {
        DoorSnapshot {
            door_id: self.door_id,
            object_id: self.object_id(),
            open: self.state() == DoorState::Open,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::packet_lib::opcodes;
    use crate::world::player::testing::CapturingSink;
    use crate::world::player::{Player, PlayerSession};
    use crate::world::timer::RegionClock;

    fn door_scene() -> (Arc<RegionClock>, Arc<Region>, Arc<Door>, Arc<CapturingSink>) {
        let clock = RegionClock::manual();
        let region = Region::new(3, "keep gate", 500, Arc::clone(&clock));
        let sink = CapturingSink::new();
        let player = Player::new(
            "gatekeeper",
            Point3D::new(0, 0, 0),
            PlayerSession::new(168, sink.clone()),
        );
        region.add_player(player);
        let door = Door::new(901, Point3D::new(10, 10, 0));
        region.add_door(Arc::clone(&door));
        (clock, region, door, sink)
    }

    #[test]
    fn open_broadcasts_then_auto_closes() {
        let (clock, region, door, sink) = door_scene();

        door.open(&region);
        assert_eq!(door.state(), DoorState::Open);
        assert_eq!(sink.opcodes(), vec![opcodes::DOOR_STATE]);

        clock.advance(AUTO_CLOSE_MS - 1);
        region.scheduler().run_due();
        assert_eq!(door.state(), DoorState::Open);

        clock.advance(1);
        region.scheduler().run_due();
        assert_eq!(door.state(), DoorState::Closed);
        assert_eq!(sink.count(), 2);
    }

    #[test]
    fn reopening_rearms_the_close_action() {
        let (clock, region, door, sink) = door_scene();

        door.open(&region);
        clock.advance(6000);
        region.scheduler().run_due();
        door.close(&region);
        door.open(&region);

        // The original deadline passes with the door freshly reopened.
        clock.advance(4000);
        region.scheduler().run_due();
        assert_eq!(door.state(), DoorState::Open);

        clock.advance(6000);
        region.scheduler().run_due();
        assert_eq!(door.state(), DoorState::Closed);
        // open, close, open, auto-close.
        assert_eq!(sink.count(), 4);
    }

    #[test]
    fn opening_an_open_door_is_a_noop() {
        let (_clock, region, door, sink) = door_scene();
        door.open(&region);
        door.open(&region);
        assert_eq!(sink.count(), 1);
    }
}
