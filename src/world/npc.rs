use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::debug;

use crate::ai::brain::Brain;
use crate::net::packet_lib::{EquipmentSnapshot, NpcSnapshot};
use crate::world::entity::{lock_unpoisoned, EntityHandle, Lifecycle, WorldEntity};
use crate::world::position::{heading_to_spot, Point3D};
use crate::world::region::Region;
use crate::world::timer::{Mailbox, RegionTimer};
use crate::world::visibility;

/// Client-visible state bits.
pub mod flags {
    pub const GHOST: u8 = 0x01;
    pub const STEALTH: u8 = 0x02;
    pub const DONT_SHOW_NAME: u8 = 0x04;
    pub const CANT_TARGET: u8 = 0x08;
    pub const DEAD: u8 = 0x10;
}

/// Follow checks run on this cadence.
pub const FOLLOW_CHECK_INTERVAL_MS: u64 = 500;

/// Pre-arrival notification leads the arrival by this much.
const CLOSE_TO_TARGET_LEAD_MS: u64 = 200;

/// NPCs go dormant after this long without a delivered update.
const VISIBILITY_WINDOW_MS: u64 = 60_000;

/// Sentinel for "never", so a fresh NPC is not considered observed at
/// region time 0.
const NEVER: u64 = u64::MAX;

/// Movement and identity events, dispatched to the active brain and to any
/// registered listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NpcEvent {
    WalkTo { target: Point3D, speed: i32 },
    ArriveAtTarget,
    CloseToTarget,
    FollowLostTarget,
    FollowTargetInRange,
    TurnTo { heading: u16 },
    Died,
}

pub type NpcListener = Arc<dyn Fn(&Arc<Npc>, &NpcEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct FollowState {
    target: EntityHandle,
    min_distance: i32,
    max_distance: i32,
    was_in_range: bool,
}

struct NpcData {
    name: String,
    guild_name: String,
    model: u16,
    level: u8,
    realm: u8,
    flags: u8,
    max_speed: i32,
    current_speed: i32,
    /// Where interpolation starts from; the live position is derived, never
    /// stored.
    origin: Point3D,
    heading: u16,
    /// Walk destination. `None` means the NPC is static and its position is
    /// exactly `origin`.
    target: Option<Point3D>,
    x_addition: f64,
    y_addition: f64,
    z_addition: f64,
    movement_start: u64,
    spawn_point: Point3D,
    spawn_heading: u16,
    health: i32,
    max_health: i32,
    attack_state: bool,
    last_attack_tick: u64,
    last_attacked_tick: u64,
    equipment: Option<EquipmentSnapshot>,
    follow: Option<FollowState>,
}

struct BrainStack {
    own: Arc<Brain>,
    overrides: Vec<Arc<Brain>>,
}

impl BrainStack {
    fn top(&self) -> &Arc<Brain> {
        self.overrides.last().unwrap_or(&self.own)
    }
}

#[derive(Default)]
struct NpcTimers {
    arrive: Option<RegionTimer>,
    close: Option<RegionTimer>,
    follow: Option<RegionTimer>,
    restore_heading: Option<RegionTimer>,
}

impl NpcTimers {
    fn stop_all(&mut self) {
        for timer in [
            self.arrive.take(),
            self.close.take(),
            self.follow.take(),
            self.restore_heading.take(),
        ]
        .into_iter()
        .flatten()
        {
            timer.stop();
        }
    }
}

/// A mobile world object. Position is interpolated from a movement start
/// snapshot, so nothing per-tick ever runs for a walking NPC; the timed
/// actions are the arrival pair and the follow check.
pub struct Npc {
    me: Weak<Npc>,
    lifecycle: Lifecycle,
    object_id: AtomicU16,
    handle: Mutex<EntityHandle>,
    region: Mutex<Weak<Region>>,
    data: Mutex<NpcData>,
    brains: Mutex<BrainStack>,
    mailbox: Mailbox,
    listeners: Mutex<Vec<NpcListener>>,
    timers: Mutex<NpcTimers>,
    last_update_tick: AtomicU64,
    last_visible_tick: AtomicU64,
}

impl Npc {
    pub fn new(name: &str, model: u16, level: u8, position: Point3D) -> Arc<Self> {
        let max_health = i32::from(level) * 20 + 20;
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            lifecycle: Lifecycle::new(),
            object_id: AtomicU16::new(0),
            handle: Mutex::new(EntityHandle::DETACHED),
            region: Mutex::new(Weak::new()),
            data: Mutex::new(NpcData {
                name: name.to_owned(),
                guild_name: String::new(),
                model,
                level,
                realm: 0,
                flags: 0,
                max_speed: 191,
                current_speed: 0,
                origin: position,
                heading: 0,
                target: None,
                x_addition: 0.0,
                y_addition: 0.0,
                z_addition: 0.0,
                movement_start: 0,
                spawn_point: position,
                spawn_heading: 0,
                health: max_health,
                max_health,
                attack_state: false,
                last_attack_tick: 0,
                last_attacked_tick: 0,
                equipment: None,
                follow: None,
            }),
            brains: Mutex::new(BrainStack {
                own: Brain::idle(),
                overrides: Vec::new(),
            }),
            mailbox: Mailbox::new(),
            listeners: Mutex::new(Vec::new()),
            timers: Mutex::new(NpcTimers::default()),
            last_update_tick: AtomicU64::new(NEVER),
            last_visible_tick: AtomicU64::new(NEVER),
        })
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn object_id(&self) -> u16 {
        self.object_id.load(Ordering::Acquire)
    }

    pub fn handle(&self) -> EntityHandle {
        *lock_unpoisoned(&self.handle)
    }

    pub fn hosting_region(&self) -> Option<Arc<Region>> {
        lock_unpoisoned(&self.region).upgrade()
    }

    pub(crate) fn attach(&self, region: &Arc<Region>, handle: EntityHandle, object_id: u16) {
        *lock_unpoisoned(&self.region) = Arc::downgrade(region);
        *lock_unpoisoned(&self.handle) = handle;
        self.object_id.store(object_id, Ordering::Release);
    }

    pub(crate) fn capture_spawn_point(&self) {
        let mut data = lock_unpoisoned(&self.data);
        data.spawn_point = data.origin;
        data.spawn_heading = data.heading;
    }

    /// Final teardown. Runs once no matter how many paths race into it.
    pub(crate) fn tear_down(&self) {
        if !self.lifecycle.delete() {
            return;
        }
        lock_unpoisoned(&self.timers).stop_all();
        let stack = lock_unpoisoned(&self.brains);
        stack.own.stop();
        for brain in &stack.overrides {
            brain.stop();
        }
    }

    // ------------------------------------------------------------------
    // Identity

    pub fn name(&self) -> String {
        lock_unpoisoned(&self.data).name.clone()
    }

    pub fn level(&self) -> u8 {
        lock_unpoisoned(&self.data).level
    }

    pub fn realm(&self) -> u8 {
        lock_unpoisoned(&self.data).realm
    }

    pub fn flags(&self) -> u8 {
        lock_unpoisoned(&self.data).flags
    }

    pub fn max_health(&self) -> i32 {
        lock_unpoisoned(&self.data).max_health
    }

    pub fn health(&self) -> i32 {
        lock_unpoisoned(&self.data).health
    }

    pub fn is_alive(&self) -> bool {
        lock_unpoisoned(&self.data).health > 0
    }

    pub fn set_max_speed(&self, speed: i32) {
        lock_unpoisoned(&self.data).max_speed = speed.max(0);
    }

    pub fn max_speed(&self) -> i32 {
        lock_unpoisoned(&self.data).max_speed
    }

    pub fn set_realm_quiet(&self, realm: u8) {
        lock_unpoisoned(&self.data).realm = realm;
    }

    pub fn set_max_health(&self, max_health: i32) {
        let mut data = lock_unpoisoned(&self.data);
        data.max_health = max_health.max(1);
        data.health = data.health.min(data.max_health);
    }

    /// Identity setters resend the full create packet: the client only
    /// reads these fields from it.
    pub fn set_name(&self, name: &str) {
        lock_unpoisoned(&self.data).name = name.to_owned();
        self.broadcast_create();
    }

    pub fn set_guild_name(&self, guild_name: &str) {
        lock_unpoisoned(&self.data).guild_name = guild_name.to_owned();
        self.broadcast_create();
    }

    pub fn set_model(&self, model: u16) {
        lock_unpoisoned(&self.data).model = model;
        self.broadcast_create();
    }

    pub fn set_level(&self, level: u8) {
        {
            let mut data = lock_unpoisoned(&self.data);
            data.level = level;
        }
        self.broadcast_create();
    }

    pub fn set_realm(&self, realm: u8) {
        lock_unpoisoned(&self.data).realm = realm;
        self.broadcast_create();
    }

    pub fn set_flags(&self, flags: u8) {
        lock_unpoisoned(&self.data).flags = flags;
        self.broadcast_create();
    }

    pub fn set_equipment(&self, equipment: Option<EquipmentSnapshot>) {
        lock_unpoisoned(&self.data).equipment = equipment;
        self.broadcast_create();
    }

    pub fn equipment(&self) -> Option<EquipmentSnapshot> {
        lock_unpoisoned(&self.data).equipment.clone()
    }

    // ------------------------------------------------------------------
    // Position and movement

    pub fn position(&self, now: u64) -> Point3D {
        position_locked(&lock_unpoisoned(&self.data), now)
    }

    pub fn heading(&self) -> u16 {
        lock_unpoisoned(&self.data).heading
    }

    pub fn current_speed(&self) -> i32 {
        lock_unpoisoned(&self.data).current_speed
    }

    pub fn is_moving(&self) -> bool {
        lock_unpoisoned(&self.data).target.is_some()
    }

    pub fn spawn_point(&self) -> Point3D {
        lock_unpoisoned(&self.data).spawn_point
    }

    pub fn walk_target(&self) -> Option<Point3D> {
        lock_unpoisoned(&self.data).target
    }

    /// Starts a walk. One update packet goes out now; clients interpolate,
    /// the server interpolates the same way on demand.
    pub fn walk_to(&self, region: &Arc<Region>, target: Point3D, speed: i32) {
        let now = region.now_ms();
        let speed = speed.min(self.max_speed()).max(0);
        self.notify(&NpcEvent::WalkTo { target, speed });

        let time_to_target = {
            let mut data = lock_unpoisoned(&self.data);
            let origin = position_locked(&data, now);
            data.origin = origin;
            data.movement_start = now;
            data.target = Some(target);
            data.current_speed = speed;
            data.heading = heading_to_spot(origin, target.x, target.y);
            recalculate_position_addition(&mut data);
            let dist = origin.distance_to(target);
            if speed > 0 {
                (dist * 1000.0 / f64::from(speed)) as u64
            } else {
                0
            }
        };

        self.schedule_walk_actions(region, time_to_target);
        self.broadcast_update();
    }

    fn schedule_walk_actions(&self, region: &Arc<Region>, time_to_target: u64) {
        let handle = self.handle();
        let scheduler = region.scheduler();

        let arriving = self.me.clone();
        let arrive = scheduler.entity_timer(
            region,
            handle,
            Box::new(move |_now| {
                if let Some(npc) = arriving.upgrade() {
                    npc.finish_walk();
                }
                0
            }),
        );
        arrive.start(time_to_target.max(1));

        let closing = self.me.clone();
        let close = scheduler.entity_timer(
            region,
            handle,
            Box::new(move |_now| {
                if let Some(npc) = closing.upgrade() {
                    npc.notify(&NpcEvent::CloseToTarget);
                }
                0
            }),
        );
        close.start(time_to_target.saturating_sub(CLOSE_TO_TARGET_LEAD_MS).max(1));

        let mut timers = lock_unpoisoned(&self.timers);
        if let Some(old) = timers.arrive.replace(arrive) {
            old.stop();
        }
        if let Some(old) = timers.close.replace(close) {
            old.stop();
        }
    }

    /// Arrival: snap to the destination and go static. No broadcast; the
    /// client ran the same interpolation and is already there.
    fn finish_walk(&self) {
        {
            let mut data = lock_unpoisoned(&self.data);
            if let Some(target) = data.target.take() {
                data.origin = target;
            }
            data.current_speed = 0;
            data.x_addition = 0.0;
            data.y_addition = 0.0;
            data.z_addition = 0.0;
        }
        self.notify(&NpcEvent::ArriveAtTarget);
    }

    /// Halts mid-walk at the interpolated spot.
    pub fn stop_moving(&self, region: &Arc<Region>) {
        let now = region.now_ms();
        {
            let mut timers = lock_unpoisoned(&self.timers);
            if let Some(timer) = timers.arrive.take() {
                timer.stop();
            }
            if let Some(timer) = timers.close.take() {
                timer.stop();
            }
        }
        let was_moving = {
            let mut data = lock_unpoisoned(&self.data);
            let was_moving = data.target.is_some();
            data.origin = position_locked(&data, now);
            data.target = None;
            data.current_speed = 0;
            data.x_addition = 0.0;
            data.y_addition = 0.0;
            data.z_addition = 0.0;
            was_moving
        };
        if was_moving {
            self.broadcast_update();
        }
    }

    /// Heads home at a trot.
    pub fn walk_to_spawn(&self, region: &Arc<Region>) {
        let spawn = self.spawn_point();
        let speed = (f64::from(self.max_speed()) / 2.5) as i32;
        self.walk_to(region, spawn, speed.max(1));
    }

    /// Instant relocation. Stops any walk and tells observers of the new
    /// spot once; observers are computed at the destination.
    pub fn move_to(&self, position: Point3D, heading: u16) {
        {
            let mut timers = lock_unpoisoned(&self.timers);
            if let Some(timer) = timers.arrive.take() {
                timer.stop();
            }
            if let Some(timer) = timers.close.take() {
                timer.stop();
            }
        }
        {
            let mut data = lock_unpoisoned(&self.data);
            data.origin = position;
            data.heading = heading;
            data.target = None;
            data.current_speed = 0;
            data.x_addition = 0.0;
            data.y_addition = 0.0;
            data.z_addition = 0.0;
        }
        self.broadcast_update();
    }

    pub fn set_heading(&self, heading: u16) {
        lock_unpoisoned(&self.data).heading = heading & crate::world::position::HEADING_MAX;
        self.broadcast_update();
    }

    /// Speed changes re-anchor the interpolation so the position function
    /// stays continuous.
    pub fn set_current_speed(&self, region: &Arc<Region>, speed: i32) {
        let now = region.now_ms();
        {
            let mut data = lock_unpoisoned(&self.data);
            data.origin = position_locked(&data, now);
            data.movement_start = now;
            data.current_speed = speed.min(data.max_speed).max(0);
            recalculate_position_addition(&mut data);
        }
        self.broadcast_update();
    }

    /// Faces a spot. With `restore_after_ms` the previous heading comes
    /// back on a timed action, the way guards glance at passers-by.
    pub fn turn_to(
        &self,
        region: &Arc<Region>,
        tx: i32,
        ty: i32,
        restore_after_ms: Option<u64>,
    ) {
        let heading = {
            let data = lock_unpoisoned(&self.data);
            heading_to_spot(position_locked(&data, region.now_ms()), tx, ty)
        };
        self.turn_to_heading(region, heading, restore_after_ms);
    }

    pub fn turn_to_heading(
        &self,
        region: &Arc<Region>,
        heading: u16,
        restore_after_ms: Option<u64>,
    ) {
        let old_heading = self.heading();
        self.notify(&NpcEvent::TurnTo { heading });
        self.set_heading(heading);

        if let Some(delay) = restore_after_ms {
            let restoring = self.me.clone();
            let timer = region.scheduler().entity_timer(
                region,
                self.handle(),
                Box::new(move |_now| {
                    if let Some(npc) = restoring.upgrade() {
                        // Only restore if nothing turned us again meanwhile.
                        npc.set_heading(old_heading);
                    }
                    0
                }),
            );
            timer.start(delay.max(1));
            let mut timers = lock_unpoisoned(&self.timers);
            if let Some(old) = timers.restore_heading.replace(timer) {
                old.stop();
            }
        }
    }

    // ------------------------------------------------------------------
    // Follow

    /// Keeps this NPC within `[min_distance, max_distance]` of the target,
    /// re-checked every half second.
    pub fn follow(
        &self,
        region: &Arc<Region>,
        target: EntityHandle,
        min_distance: i32,
        max_distance: i32,
    ) {
        {
            let mut data = lock_unpoisoned(&self.data);
            data.follow = Some(FollowState {
                target,
                min_distance,
                max_distance,
                was_in_range: false,
            });
        }
        let following = self.me.clone();
        let region_ref = Arc::downgrade(region);
        let timer = region.scheduler().entity_timer(
            region,
            self.handle(),
            Box::new(move |now| {
                match (following.upgrade(), region_ref.upgrade()) {
                    (Some(npc), Some(region)) => npc.follow_tick(&region, now),
                    _ => 0,
                }
            }),
        );
        timer.start(FOLLOW_CHECK_INTERVAL_MS);
        let mut timers = lock_unpoisoned(&self.timers);
        if let Some(old) = timers.follow.replace(timer) {
            old.stop();
        }
    }

    pub fn stop_follow(&self) {
        if let Some(timer) = lock_unpoisoned(&self.timers).follow.take() {
            timer.stop();
        }
        lock_unpoisoned(&self.data).follow = None;
    }

    pub fn is_following(&self) -> bool {
        lock_unpoisoned(&self.data).follow.is_some()
    }

    /// One follow check. Returns the next check interval, 0 to stop.
    pub fn follow_tick(&self, region: &Arc<Region>, now: u64) -> u64 {
        let Some(follow) = lock_unpoisoned(&self.data).follow else {
            return 0;
        };

        let target_pos = match region.resolve(follow.target) {
            Some(WorldEntity::Player(player)) if player.lifecycle().is_active() => {
                player.position()
            }
            Some(WorldEntity::Npc(other)) if other.lifecycle().is_active() && other.is_alive() => {
                other.position(now)
            }
            _ => {
                return self.give_up_follow(region);
            }
        };

        if self.chase_timed_out(now) {
            self.stop_attack();
            return self.give_up_follow(region);
        }

        let my_pos = self.position(now);
        let dist = my_pos.legacy_distance_to(target_pos);

        if dist > f64::from(follow.max_distance) {
            return self.give_up_follow(region);
        }

        if dist <= f64::from(follow.min_distance) {
            if self.is_moving() {
                self.stop_moving(region);
            }
            let newly_in_range = {
                let mut data = lock_unpoisoned(&self.data);
                match data.follow.as_mut() {
                    Some(state) if !state.was_in_range => {
                        state.was_in_range = true;
                        true
                    }
                    _ => false,
                }
            };
            if newly_in_range {
                self.notify(&NpcEvent::FollowTargetInRange);
            }
            return FOLLOW_CHECK_INTERVAL_MS;
        }

        {
            let mut data = lock_unpoisoned(&self.data);
            if let Some(state) = data.follow.as_mut() {
                state.was_in_range = false;
            }
        }

        // Walk to the point min_distance short of the target along the
        // connecting vector.
        let dx = f64::from(target_pos.x - my_pos.x);
        let dy = f64::from(target_pos.y - my_pos.y);
        let dz = f64::from(target_pos.z - my_pos.z);
        let full = (dx * dx + dy * dy + dz * dz).sqrt();
        let scale = if full > 0.0 {
            f64::from(follow.min_distance) / full
        } else {
            0.0
        };
        let destination = Point3D::new(
            target_pos.x - (dx * scale) as i32,
            target_pos.y - (dy * scale) as i32,
            target_pos.z - (dz * scale) as i32,
        );
        let speed = self.max_speed();
        self.walk_to(region, destination, speed);
        FOLLOW_CHECK_INTERVAL_MS
    }

    fn give_up_follow(&self, region: &Arc<Region>) -> u64 {
        lock_unpoisoned(&self.data).follow = None;
        self.notify(&NpcEvent::FollowLostTarget);
        self.walk_to_spawn(region);
        0
    }

    /// A chase with no blows exchanged ends after a grace period that grows
    /// with the accumulated aggro.
    fn chase_timed_out(&self, now: u64) -> bool {
        let (attacking, last_exchange, max_health, target) = {
            let data = lock_unpoisoned(&self.data);
            (
                data.attack_state,
                data.last_attack_tick.max(data.last_attacked_tick),
                data.max_health,
                data.follow.map(|f| f.target),
            )
        };
        if !attacking {
            return false;
        }
        let aggro = match target {
            Some(target) => self.brain().aggro_amount(target),
            None => 0,
        };
        // Negative banked aggro must shorten the grace, never wrap it.
        let timeout_secs = (10 + (aggro / i64::from(max_health + 1)) * 100).max(0);
        now.saturating_sub(last_exchange) > (timeout_secs as u64) * 1000
    }

    // ------------------------------------------------------------------
    // Combat bookkeeping

    pub fn start_attack(&self, region: &Arc<Region>, target: EntityHandle) {
        let now = region.now_ms();
        {
            let mut data = lock_unpoisoned(&self.data);
            data.attack_state = true;
            data.last_attack_tick = now;
        }
        self.follow(region, target, 90, 3000);
    }

    pub fn stop_attack(&self) {
        lock_unpoisoned(&self.data).attack_state = false;
    }

    pub fn is_attacking(&self) -> bool {
        lock_unpoisoned(&self.data).attack_state
    }

    /// Incoming damage keeps a chase alive.
    pub fn attacked_by_enemy(&self, now: u64) {
        lock_unpoisoned(&self.data).last_attacked_tick = now;
    }

    pub fn die(&self, region: &Arc<Region>) {
        let now = region.now_ms();
        {
            let mut data = lock_unpoisoned(&self.data);
            if data.flags & flags::DEAD != 0 {
                return;
            }
            data.origin = position_locked(&data, now);
            data.health = 0;
            data.flags |= flags::DEAD;
            data.attack_state = false;
            data.follow = None;
            data.target = None;
            data.current_speed = 0;
            data.x_addition = 0.0;
            data.y_addition = 0.0;
            data.z_addition = 0.0;
        }
        lock_unpoisoned(&self.timers).stop_all();
        self.notify(&NpcEvent::Died);
        self.brain().stop();
        self.broadcast_update();
    }

    // ------------------------------------------------------------------
    // Brains

    /// The currently deciding brain: the newest override, else the own one.
    pub fn brain(&self) -> Arc<Brain> {
        Arc::clone(lock_unpoisoned(&self.brains).top())
    }

    pub fn brain_depth(&self) -> usize {
        lock_unpoisoned(&self.brains).overrides.len() + 1
    }

    /// Replaces the permanent brain. The replacement must not already be
    /// running somewhere. The stop/start pair happens under the stack lock,
    /// so at no point do two brains of this NPC think at once.
    pub fn set_own_brain(&self, brain: Arc<Brain>) -> Arc<Brain> {
        assert!(!brain.is_active(), "own brain replacement is already active");
        let region = self.hosting_region();
        let me = self.me.upgrade();
        let mut stack = lock_unpoisoned(&self.brains);
        let old = Arc::clone(&stack.own);
        let was_top = stack.overrides.is_empty();
        old.stop();
        stack.own = Arc::clone(&brain);
        if was_top && self.lifecycle.is_active() {
            if let (Some(region), Some(me)) = (&region, &me) {
                brain.start(region, me);
            }
        }
        old
    }

    /// Pushes a temporary override; it thinks until removed.
    pub fn add_brain(&self, brain: Arc<Brain>) {
        assert!(!brain.is_active(), "override brain is already active");
        let region = self.hosting_region();
        let me = self.me.upgrade();
        let mut stack = lock_unpoisoned(&self.brains);
        stack.top().stop();
        stack.overrides.push(Arc::clone(&brain));
        if self.lifecycle.is_active() {
            if let (Some(region), Some(me)) = (&region, &me) {
                brain.start(region, me);
            }
        }
    }

    /// Pops an override; the one below resumes. Removing a brain that is
    /// not on the stack is a caller bug.
    pub fn remove_brain(&self, brain: &Arc<Brain>) {
        let region = self.hosting_region();
        let me = self.me.upgrade();
        let mut stack = lock_unpoisoned(&self.brains);
        let index = stack
            .overrides
            .iter()
            .position(|b| Arc::ptr_eq(b, brain))
            .expect("brain is not on this npc's stack");
        let removed = stack.overrides.remove(index);
        removed.stop();
        if self.lifecycle.is_active() {
            if let (Some(region), Some(me)) = (&region, &me) {
                Arc::clone(stack.top()).start(region, me);
            }
        }
    }

    pub(crate) fn start_brain(&self, region: &Arc<Region>) {
        if self.lifecycle.is_active() {
            if let Some(me) = self.me.upgrade() {
                let stack = lock_unpoisoned(&self.brains);
                Arc::clone(stack.top()).start(region, &me);
            }
        }
    }

    // ------------------------------------------------------------------
    // Events

    pub fn add_listener(&self, listener: NpcListener) {
        lock_unpoisoned(&self.listeners).push(listener);
    }

    /// Dispatches to the active brain and every listener. No entity lock is
    /// held while handlers run.
    pub fn notify(&self, event: &NpcEvent) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let brain = self.brain();
        let listeners: Vec<NpcListener> = lock_unpoisoned(&self.listeners).clone();
        brain.handle_event(&me, event);
        for listener in listeners {
            listener(&me, event);
        }
    }

    // ------------------------------------------------------------------
    // Visibility bookkeeping

    pub(crate) fn mark_updated(&self, now: u64) {
        self.last_update_tick.store(now, Ordering::Release);
    }

    pub fn last_update_tick(&self) -> Option<u64> {
        match self.last_update_tick.load(Ordering::Acquire) {
            NEVER => None,
            tick => Some(tick),
        }
    }

    /// Called when an update actually reached at least one client: the NPC
    /// is being watched, so its brain must be thinking.
    pub(crate) fn npc_updated_callback(&self, region: &Arc<Region>, now: u64) {
        self.last_visible_tick.store(now, Ordering::Release);
        self.start_brain(region);
    }

    pub fn is_visible_to_players(&self, now: u64) -> bool {
        match self.last_visible_tick.load(Ordering::Acquire) {
            NEVER => false,
            tick => now.saturating_sub(tick) <= VISIBILITY_WINDOW_MS,
        }
    }

    // ------------------------------------------------------------------
    // Wire

    pub fn snapshot(&self, now: u64) -> NpcSnapshot {
        let data = lock_unpoisoned(&self.data);
        let position = position_locked(&data, now);
        let health_percent = if data.max_health > 0 {
            ((data.health.max(0) as i64 * 100) / data.max_health as i64) as u8
        } else {
            0
        };
        NpcSnapshot {
            object_id: self.object_id(),
            name: data.name.clone(),
            guild_name: data.guild_name.clone(),
            model: data.model,
            level: data.level,
            realm: data.realm,
            flags: data.flags,
            position,
            heading: data.heading,
            speed: data.current_speed.max(0) as u16,
            target: data.target,
            health_percent,
        }
    }

    // ------------------------------------------------------------------
    // Persistence boundary

    /// Field assignment only. Loading never schedules actions and never
    /// broadcasts, so loading twice is the same as loading once.
    pub fn load_from_record(&self, record: &crate::persistence::record::Record) {
        let mut data = lock_unpoisoned(&self.data);
        if let Some(name) = record.str("name") {
            data.name = name.to_owned();
        }
        if let Some(guild) = record.str("guild_name") {
            data.guild_name = guild.to_owned();
        }
        if let Some(model) = record.int("model") {
            data.model = model as u16;
        }
        if let Some(level) = record.byte("level") {
            data.level = level;
        }
        if let Some(realm) = record.byte("realm") {
            data.realm = realm;
        }
        if let Some(flags) = record.byte("flags") {
            data.flags = flags;
        }
        if let (Some(x), Some(y), Some(z)) =
            (record.int("x"), record.int("y"), record.int("z"))
        {
            let spot = Point3D::new(x as i32, y as i32, z as i32);
            data.origin = spot;
            data.spawn_point = spot;
            data.target = None;
            data.current_speed = 0;
            data.x_addition = 0.0;
            data.y_addition = 0.0;
            data.z_addition = 0.0;
        }
        if let Some(heading) = record.int("heading") {
            data.heading = (heading as u16) & crate::world::position::HEADING_MAX;
            data.spawn_heading = data.heading;
        }
        if let Some(max_speed) = record.int("max_speed") {
            data.max_speed = max_speed as i32;
        }
        if let Some(max_health) = record.int("max_health") {
            data.max_health = (max_health as i32).max(1);
        }
        if let Some(health) = record.int("health") {
            data.health = (health as i32).min(data.max_health);
        }
    }

    pub fn save_to_record(&self) -> crate::persistence::record::Record {
        let data = lock_unpoisoned(&self.data);
        let mut record = crate::persistence::record::Record::new();
        record.set_str("name", &data.name);
        record.set_str("guild_name", &data.guild_name);
        record.set_int("model", i64::from(data.model));
        record.set_byte("level", data.level);
        record.set_byte("realm", data.realm);
        record.set_byte("flags", data.flags);
        record.set_int("x", i64::from(data.spawn_point.x));
        record.set_int("y", i64::from(data.spawn_point.y));
        record.set_int("z", i64::from(data.spawn_point.z));
        record.set_int("heading", i64::from(data.spawn_heading));
        record.set_int("max_speed", i64::from(data.max_speed));
        record.set_int("health", i64::from(data.health));
        record.set_int("max_health", i64::from(data.max_health));
        record
    }

    fn broadcast_create(&self) {
        if let Some(region) = self.hosting_region() {
            if let Some(entities) = region.resolve(self.handle()) {
                if let Some(npc) = entities.as_npc() {
                    visibility::broadcast_npc_create(&region, npc);
                    return;
                }
            }
            debug!("create broadcast skipped for detached npc {}", self.object_id());
        }
    }

    fn broadcast_update(&self) {
        if let Some(region) = self.hosting_region() {
            if let Some(entity) = region.resolve(self.handle()) {
                if let Some(npc) = entity.as_npc() {
                    visibility::broadcast_npc_update(&region, npc);
                }
            }
        }
    }
}

/// Per-axis velocities in units per millisecond.
fn recalculate_position_addition(data: &mut NpcData) {
    let Some(target) = data.target else {
        data.x_addition = 0.0;
        data.y_addition = 0.0;
        data.z_addition = 0.0;
        return;
    };
    let dist = data.origin.distance_to(target);
    if dist <= 0.0 || data.current_speed <= 0 {
        data.x_addition = 0.0;
        data.y_addition = 0.0;
        data.z_addition = 0.0;
        return;
    }
    let speed = f64::from(data.current_speed);
    data.x_addition = f64::from(target.x - data.origin.x) * speed / dist * 0.001;
    data.y_addition = f64::from(target.y - data.origin.y) * speed / dist * 0.001;
    data.z_addition = f64::from(target.z - data.origin.z) * speed / dist * 0.001;
}

/// Pure interpolation: same inputs, same answer, on any thread.
fn position_locked(data: &NpcData, now: u64) -> Point3D {
    let Some(target) = data.target else {
        return data.origin;
    };
    let elapsed = now.saturating_sub(data.movement_start) as f64;
    Point3D::new(
        interpolate_axis(data.origin.x, data.x_addition, target.x, elapsed),
        interpolate_axis(data.origin.y, data.y_addition, target.y, elapsed),
        interpolate_axis(data.origin.z, data.z_addition, target.z, elapsed),
    )
}

fn interpolate_axis(origin: i32, addition: f64, target: i32, elapsed_ms: f64) -> i32 {
    if addition == 0.0 {
        return origin;
    }
    let value = f64::from(origin) + addition * elapsed_ms;
    if addition > 0.0 {
        value.min(f64::from(target)) as i32
    } else {
        value.max(f64::from(target)) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::timer::RegionClock;

    fn quiet_region() -> (Arc<RegionClock>, Arc<Region>) {
        let clock = RegionClock::manual();
        let region = Region::new(1, "test vale", 500, Arc::clone(&clock));
        (clock, region)
    }

    fn spawned_npc(region: &Arc<Region>, position: Point3D) -> Arc<Npc> {
        let npc = Npc::new("graystone golem", 402, 10, position);
        region.add_npc(Arc::clone(&npc));
        npc
    }

    #[test]
    fn static_npc_stays_put() {
        let (clock, region) = quiet_region();
        let npc = spawned_npc(&region, Point3D::new(1000, 1000, 0));
        clock.advance(50_000);
        assert_eq!(npc.position(region.now_ms()), Point3D::new(1000, 1000, 0));
        assert!(!npc.is_moving());
    }

    #[test]
    fn interpolation_is_deterministic_and_monotonic() {
        let (clock, region) = quiet_region();
        let npc = spawned_npc(&region, Point3D::new(0, 0, 0));
        npc.walk_to(&region, Point3D::new(1000, 0, 0), 100);

        // 100 units/s: after 2s we are at x=200, bit-for-bit repeatable.
        clock.advance(2000);
        let now = region.now_ms();
        let first = npc.position(now);
        assert_eq!(first, Point3D::new(200, 0, 0));
        assert_eq!(npc.position(now), first);

        let mut last_x = first.x;
        for _ in 0..5 {
            clock.advance(500);
            let pos = npc.position(region.now_ms());
            assert!(pos.x >= last_x);
            last_x = pos.x;
        }
    }

    #[test]
    fn walk_snaps_exactly_to_target() {
        let (clock, region) = quiet_region();
        let npc = spawned_npc(&region, Point3D::new(0, 0, 0));
        let target = Point3D::new(333, 777, 15);
        npc.walk_to(&region, target, 150);

        // Well past the travel time the position is the target, exactly.
        clock.advance(60_000);
        assert_eq!(npc.position(region.now_ms()), target);

        // After the arrival action the walk state is cleared too.
        region.scheduler().run_due();
        assert!(!npc.is_moving());
        assert_eq!(npc.current_speed(), 0);
        assert_eq!(npc.position(region.now_ms()), target);
    }

    #[test]
    fn walk_events_fire_close_then_arrive() {
        let (clock, region) = quiet_region();
        let npc = spawned_npc(&region, Point3D::new(0, 0, 0));
        let events = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&events);
        npc.add_listener(Arc::new(move |_npc, event| {
            if matches!(
                event,
                NpcEvent::CloseToTarget | NpcEvent::ArriveAtTarget
            ) {
                log.lock().unwrap().push(*event);
            }
        }));

        // 1000 units at 100/s: close fires at 9800ms, arrive at 10000ms.
        npc.walk_to(&region, Point3D::new(1000, 0, 0), 100);

        clock.advance(9799);
        region.scheduler().run_due();
        assert!(events.lock().unwrap().is_empty());

        clock.advance(1);
        region.scheduler().run_due();
        assert_eq!(*events.lock().unwrap(), vec![NpcEvent::CloseToTarget]);

        clock.advance(200);
        region.scheduler().run_due();
        assert_eq!(
            *events.lock().unwrap(),
            vec![NpcEvent::CloseToTarget, NpcEvent::ArriveAtTarget]
        );
    }

    #[test]
    fn rewalk_cancels_previous_arrival_actions() {
        let (clock, region) = quiet_region();
        let npc = spawned_npc(&region, Point3D::new(0, 0, 0));
        let events = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&events);
        npc.add_listener(Arc::new(move |_npc, event| {
            if matches!(event, NpcEvent::ArriveAtTarget) {
                log.lock().unwrap().push(*event);
            }
        }));

        npc.walk_to(&region, Point3D::new(100, 0, 0), 100);
        clock.advance(500);
        npc.walk_to(&region, Point3D::new(0, 2000, 0), 100);

        // Only the second walk's arrival may fire.
        clock.advance(60_000);
        region.scheduler().run_due();
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn stop_moving_freezes_at_interpolated_spot() {
        let (clock, region) = quiet_region();
        let npc = spawned_npc(&region, Point3D::new(0, 0, 0));
        npc.walk_to(&region, Point3D::new(1000, 0, 0), 100);
        clock.advance(3000);
        npc.stop_moving(&region);

        let frozen = npc.position(region.now_ms());
        assert_eq!(frozen, Point3D::new(300, 0, 0));
        clock.advance(10_000);
        region.scheduler().run_due();
        assert_eq!(npc.position(region.now_ms()), frozen);
        assert!(!npc.is_moving());
    }

    #[test]
    fn timer_after_delete_is_silent_noop() {
        let (clock, region) = quiet_region();
        let npc = spawned_npc(&region, Point3D::new(0, 0, 0));
        let events = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&events);
        npc.add_listener(Arc::new(move |_npc, event| {
            if matches!(
                event,
                NpcEvent::CloseToTarget | NpcEvent::ArriveAtTarget
            ) {
                log.lock().unwrap().push(*event);
            }
        }));

        npc.walk_to(&region, Point3D::new(500, 0, 0), 100);
        region.remove_npc(&npc);

        // The arrival deadline passes after deletion; nothing may fire and
        // nothing may panic.
        clock.advance(60_000);
        region.scheduler().run_due();
        assert!(events.lock().unwrap().is_empty());
        assert!(npc.lifecycle().is_deleted());
    }

    #[test]
    fn walk_to_spawn_returns_home() {
        let (clock, region) = quiet_region();
        let npc = spawned_npc(&region, Point3D::new(100, 100, 0));
        npc.walk_to(&region, Point3D::new(2000, 100, 0), 150);
        clock.advance(60_000);
        region.scheduler().run_due();

        npc.walk_to_spawn(&region);
        clock.advance(600_000);
        region.scheduler().run_due();
        assert_eq!(npc.position(region.now_ms()), Point3D::new(100, 100, 0));
    }

    #[test]
    fn speed_clamps_to_max() {
        let (_clock, region) = quiet_region();
        let npc = spawned_npc(&region, Point3D::new(0, 0, 0));
        npc.set_max_speed(200);
        npc.walk_to(&region, Point3D::new(1000, 0, 0), 9999);
        assert_eq!(npc.current_speed(), 200);
    }

    #[test]
    fn heading_points_at_walk_target() {
        let (_clock, region) = quiet_region();
        let npc = spawned_npc(&region, Point3D::new(0, 1000, 0));
        npc.walk_to(&region, Point3D::new(1000, 1000, 0), 100);
        assert_eq!(npc.heading(), 1024);
    }

    #[test]
    fn follow_notifies_in_range_exactly_once_per_approach() {
        use crate::world::player::{Player, PlayerSession};

        let (clock, region) = quiet_region();
        let player = Player::new(
            "quarry",
            Point3D::new(100, 0, 0),
            PlayerSession::discarding(168),
        );
        region.add_player(Arc::clone(&player));

        let npc = spawned_npc(&region, Point3D::new(1000, 0, 0));
        let in_range = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&in_range);
        npc.add_listener(Arc::new(move |_npc, event| {
            if matches!(event, NpcEvent::FollowTargetInRange) {
                *counter.lock().unwrap() += 1;
            }
        }));

        npc.follow(&region, player.handle(), 150, 5000);
        for _ in 0..20 {
            clock.advance(FOLLOW_CHECK_INTERVAL_MS);
            region.scheduler().run_due();
        }
        // Many in-range checks, one edge.
        assert_eq!(*in_range.lock().unwrap(), 1);

        // Target breaks away and is caught again: a second edge.
        player.set_position(Point3D::new(3000, 0, 0));
        for _ in 0..40 {
            clock.advance(FOLLOW_CHECK_INTERVAL_MS);
            region.scheduler().run_due();
        }
        assert_eq!(*in_range.lock().unwrap(), 2);
    }

    #[test]
    fn follow_gives_up_when_target_leaves_world() {
        use crate::world::player::{Player, PlayerSession};

        let (clock, region) = quiet_region();
        let player = Player::new(
            "quarry",
            Point3D::new(2000, 0, 0),
            PlayerSession::discarding(168),
        );
        region.add_player(Arc::clone(&player));

        let npc = spawned_npc(&region, Point3D::new(0, 0, 0));
        let lost = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&lost);
        npc.add_listener(Arc::new(move |_npc, event| {
            if matches!(event, NpcEvent::FollowLostTarget) {
                *counter.lock().unwrap() += 1;
            }
        }));

        npc.follow(&region, player.handle(), 100, 5000);
        clock.advance(FOLLOW_CHECK_INTERVAL_MS);
        region.scheduler().run_due();
        assert!(npc.is_following());

        region.remove_player(&player);
        clock.advance(FOLLOW_CHECK_INTERVAL_MS);
        region.scheduler().run_due();
        assert_eq!(*lost.lock().unwrap(), 1);
        assert!(!npc.is_following());

        // And the walk home ends at the spawn point.
        clock.advance(600_000);
        region.scheduler().run_due();
        assert_eq!(npc.position(region.now_ms()), npc.spawn_point());
    }

    #[test]
    fn chase_ends_after_grace_period_without_blows() {
        use crate::world::player::{Player, PlayerSession};

        let (clock, region) = quiet_region();
        let player = Player::new(
            "runner",
            Point3D::new(0, 2000, 0),
            PlayerSession::discarding(168),
        );
        region.add_player(Arc::clone(&player));

        let npc = spawned_npc(&region, Point3D::new(0, 0, 0));
        npc.set_max_speed(50);
        npc.start_attack(&region, player.handle());
        assert!(npc.is_attacking());

        // No aggro banked: the chase is abandoned 10 seconds after the
        // last exchange.
        for _ in 0..19 {
            clock.advance(FOLLOW_CHECK_INTERVAL_MS);
            region.scheduler().run_due();
        }
        assert!(npc.is_following());

        for _ in 0..3 {
            clock.advance(FOLLOW_CHECK_INTERVAL_MS);
            region.scheduler().run_due();
        }
        assert!(!npc.is_following());
        assert!(!npc.is_attacking());
    }

    #[test]
    fn negative_aggro_shortens_the_chase_instead_of_wrapping() {
        use crate::world::player::{Player, PlayerSession};

        let (clock, region) = quiet_region();
        let player = Player::new(
            "taunter",
            Point3D::new(0, 2000, 0),
            PlayerSession::discarding(168),
        );
        region.add_player(Arc::clone(&player));

        let npc = spawned_npc(&region, Point3D::new(0, 0, 0));
        npc.set_max_speed(50);
        let brain = Brain::standard(0, 500);
        npc.set_own_brain(Arc::clone(&brain));
        brain.add_aggro(player.handle(), -100_000);

        npc.start_attack(&region, player.handle());
        assert!(npc.is_attacking());

        // With the grace clamped at zero the very first follow check after
        // the last exchange abandons the chase.
        clock.advance(FOLLOW_CHECK_INTERVAL_MS);
        region.scheduler().run_due();
        assert!(!npc.is_following());
        assert!(!npc.is_attacking());
    }

    #[test]
    fn record_round_trip_preserves_fields() {
        let (_clock, region) = quiet_region();
        let npc = spawned_npc(&region, Point3D::new(10, 20, 30));
        npc.set_max_speed(120);
        let record = npc.save_to_record();

        let restored = Npc::new("placeholder", 0, 1, Point3D::default());
        restored.load_from_record(&record);
        region.add_npc(Arc::clone(&restored));
        assert_eq!(restored.name(), "graystone golem");
        assert_eq!(restored.position(region.now_ms()), Point3D::new(10, 20, 30));
        assert_eq!(restored.max_speed(), 120);
        assert_eq!(restored.save_to_record(), record);
    }

    #[test]
    fn loading_twice_schedules_nothing() {
        let (_clock, region) = quiet_region();
        let npc = spawned_npc(&region, Point3D::new(10, 20, 30));
        let record = npc.save_to_record();

        let pending_before = region.scheduler().pending();
        npc.load_from_record(&record);
        npc.load_from_record(&record);
        assert_eq!(region.scheduler().pending(), pending_before);
        assert!(!npc.is_moving());
    }

    #[test]
    fn die_clears_motion_and_marks_flags() {
        let (clock, region) = quiet_region();
        let npc = spawned_npc(&region, Point3D::new(0, 0, 0));
        npc.walk_to(&region, Point3D::new(1000, 0, 0), 100);
        clock.advance(1000);
        npc.die(&region);
        assert!(!npc.is_alive());
        assert_ne!(npc.flags() & flags::DEAD, 0);
        let frozen = npc.position(region.now_ms());
        clock.advance(10_000);
        assert_eq!(npc.position(region.now_ms()), frozen);
    }
}
