use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLockReadGuard, RwLockWriteGuard};

use crate::world::door::Door;
use crate::world::npc::Npc;
use crate::world::player::Player;

/// Lifecycle of a world object. The only transitions are
/// Inactive -> Active and Active -> Deleted; Deleted is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectState {
    Inactive = 0,
    Active = 1,
    Deleted = 2,
}

/// Lifecycle cell shared by every entity kind.
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ObjectState::Inactive as u8),
        }
    }

    pub fn state(&self) -> ObjectState {
        match self.state.load(Ordering::Acquire) {
            0 => ObjectState::Inactive,
            1 => ObjectState::Active,
            _ => ObjectState::Deleted,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == ObjectState::Active
    }

    pub fn is_deleted(&self) -> bool {
        self.state() == ObjectState::Deleted
    }

    /// Inactive -> Active. False if the object was already active or is
    /// past deletion.
    pub fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                ObjectState::Inactive as u8,
                ObjectState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Any state -> Deleted. True only for the caller that performed the
    /// transition, so teardown runs once.
    pub fn delete(&self) -> bool {
        self.state.swap(ObjectState::Deleted as u8, Ordering::AcqRel) != ObjectState::Deleted as u8
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Slot index plus a generation counter. A handle whose generation no
/// longer matches the slot's is stale; resolving it yields nothing instead
/// of the slot's new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityHandle {
    pub index: u32,
    pub generation: u32,
}

impl EntityHandle {
    /// A handle that never resolves, for entities not yet in a region.
    pub const DETACHED: EntityHandle = EntityHandle {
        index: u32::MAX,
        generation: 0,
    };

    pub fn is_detached(self) -> bool {
        self.index == u32::MAX
    }
}

#[derive(Clone)]
pub enum WorldEntity {
    Npc(Arc<Npc>),
    Player(Arc<Player>),
    Door(Arc<Door>),
}

impl WorldEntity {
    pub fn as_npc(&self) -> Option<&Arc<Npc>> {
        match self {
            WorldEntity::Npc(npc) => Some(npc),
            _ => None,
        }
    }

    pub fn as_player(&self) -> Option<&Arc<Player>> {
        match self {
            WorldEntity::Player(player) => Some(player),
            _ => None,
        }
    }

    pub fn as_door(&self) -> Option<&Arc<Door>> {
        match self {
            WorldEntity::Door(door) => Some(door),
            _ => None,
        }
    }
}

struct Slot {
    generation: u32,
    occupant: Option<WorldEntity>,
}

/// Region-owned slab of entities. Handles into it survive the entity's
/// removal as stale references, never as dangling ones.
pub struct EntityTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    next_object_id: u16,
}

impl EntityTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            next_object_id: 1,
        }
    }

    /// Session-scoped wire id. Not a handle; purely for the client.
    pub fn allocate_object_id(&mut self) -> u16 {
        let id = self.next_object_id;
        self.next_object_id = self.next_object_id.wrapping_add(1).max(1);
        id
    }

    pub fn insert(&mut self, entity: WorldEntity) -> EntityHandle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.occupant = Some(entity);
            return EntityHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            occupant: Some(entity),
        });
        EntityHandle {
            index,
            generation: 0,
        }
    }

    /// Frees the slot and bumps its generation so outstanding handles go
    /// stale. Returns the former occupant.
    pub fn remove(&mut self, handle: EntityHandle) -> Option<WorldEntity> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let entity = slot.occupant.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Some(entity)
    }

    pub fn resolve(&self, handle: EntityHandle) -> Option<&WorldEntity> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.occupant.as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityHandle, &WorldEntity)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.occupant.as_ref().map(|entity| {
                (
                    EntityHandle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    entity,
                )
            })
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EntityTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock helpers that keep going if a panicking thread poisoned the lock.
/// The world state is guarded by short critical sections that never leave
/// it half-written, so the data behind a poisoned lock is still sound.
pub fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn read_unpoisoned<T>(lock: &std::sync::RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub fn write_unpoisoned<T>(lock: &std::sync::RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
