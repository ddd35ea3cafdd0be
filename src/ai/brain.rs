use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::world::entity::{lock_unpoisoned, EntityHandle, WorldEntity};
use crate::world::npc::{Npc, NpcEvent};
use crate::world::region::Region;
use crate::world::timer::RegionTimer;

/// Default think cadence.
pub const THINK_INTERVAL_MS: u64 = 2500;

pub type ThinkHook = Arc<dyn Fn(&Arc<Npc>, u64) + Send + Sync>;
pub type EventHook = Arc<dyn Fn(&Arc<Npc>, &NpcEvent) + Send + Sync>;

/// Aggressive wandering-monster behavior: scan for players, hold a grudge
/// table, chase the biggest grudge.
pub struct StandardMobBrain {
    pub aggro_level: u8,
    pub aggro_range: i32,
    aggro: HashMap<EntityHandle, i64>,
}

pub struct ControlledBrain {
    pub owner: EntityHandle,
}

pub struct ScriptedBrain {
    think: Option<ThinkHook>,
    on_event: Option<EventHook>,
}

pub enum BrainBehavior {
    /// Decides nothing. The default own brain of a freshly made NPC.
    Idle,
    Standard(StandardMobBrain),
    Controlled(ControlledBrain),
    Scripted(ScriptedBrain),
}

/// One brain: a behavior plus the think loop driving it. A brain belongs
/// to at most one NPC at a time and thinks only while that NPC is being
/// observed; delivery of an update wakes it back up.
pub struct Brain {
    behavior: Mutex<BrainBehavior>,
    active: AtomicBool,
    body: Mutex<Weak<Npc>>,
    think_timer: Mutex<Option<RegionTimer>>,
    think_interval: u64,
}

enum Decision {
    Nothing,
    Attack(EntityHandle),
    WalkHome,
    HeelTo(EntityHandle),
    RunHook(ThinkHook),
}

impl Brain {
    fn with_behavior(behavior: BrainBehavior, think_interval: u64) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            active: AtomicBool::new(false),
            body: Mutex::new(Weak::new()),
            think_timer: Mutex::new(None),
            think_interval,
        })
    }

    pub fn idle() -> Arc<Self> {
        Self::with_behavior(BrainBehavior::Idle, THINK_INTERVAL_MS)
    }

    pub fn standard(aggro_level: u8, aggro_range: i32) -> Arc<Self> {
        Self::with_behavior(
            BrainBehavior::Standard(StandardMobBrain {
                aggro_level,
                aggro_range,
                aggro: HashMap::new(),
            }),
            THINK_INTERVAL_MS,
        )
    }

    pub fn controlled(owner: EntityHandle) -> Arc<Self> {
        Self::with_behavior(
            BrainBehavior::Controlled(ControlledBrain { owner }),
            THINK_INTERVAL_MS,
        )
    }

    pub fn scripted(think: Option<ThinkHook>, on_event: Option<EventHook>) -> Arc<Self> {
        Self::with_behavior(
            BrainBehavior::Scripted(ScriptedBrain { think, on_event }),
            THINK_INTERVAL_MS,
        )
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn body(&self) -> Option<Arc<Npc>> {
        lock_unpoisoned(&self.body).upgrade()
    }

    /// Binds the brain to a body and arms the think loop. Starting a brain
    /// that already runs is a no-op, so delivery-driven restarts are cheap.
    pub fn start(self: Arc<Self>, region: &Arc<Region>, npc: &Arc<Npc>) {
        if self.active.swap(true, Ordering::AcqRel) {
            return;
        }
        *lock_unpoisoned(&self.body) = Arc::downgrade(npc);

        let brain = Arc::downgrade(&self);
        let body = Arc::downgrade(npc);
        let region_ref = Arc::downgrade(region);
        let timer = region.scheduler().entity_timer(
            region,
            npc.handle(),
            Box::new(move |now| {
                match (brain.upgrade(), body.upgrade(), region_ref.upgrade()) {
                    (Some(brain), Some(npc), Some(region)) => brain.think(&region, &npc, now),
                    _ => 0,
                }
            }),
        );
        timer.start(self.think_interval);
        let mut slot = lock_unpoisoned(&self.think_timer);
        if let Some(old) = slot.replace(timer) {
            old.stop();
        }
    }

    pub fn stop(&self) {
        self.active.store(false, Ordering::Release);
        if let Some(timer) = lock_unpoisoned(&self.think_timer).take() {
            timer.stop();
        }
    }

    /// One think pass. Returns the next interval, 0 to go dormant.
    pub fn think(&self, region: &Arc<Region>, npc: &Arc<Npc>, now: u64) -> u64 {
        if !self.active.load(Ordering::Acquire) {
            return 0;
        }
        // Unwatched NPCs stop deciding; the next delivered update restarts
        // the loop.
        if !npc.is_visible_to_players(now) {
            self.active.store(false, Ordering::Release);
            return 0;
        }

        let decision = {
            let mut behavior = lock_unpoisoned(&self.behavior);
            match &mut *behavior {
                BrainBehavior::Idle => Decision::Nothing,
                BrainBehavior::Standard(standard) => standard.decide(region, npc, now),
                BrainBehavior::Controlled(controlled) => {
                    if npc.is_following() {
                        Decision::Nothing
                    } else {
                        Decision::HeelTo(controlled.owner)
                    }
                }
                BrainBehavior::Scripted(scripted) => match &scripted.think {
                    Some(hook) => Decision::RunHook(Arc::clone(hook)),
                    None => Decision::Nothing,
                },
            }
        };

        match decision {
            Decision::Nothing => {}
            Decision::Attack(target) => {
                if !npc.is_attacking() {
                    npc.start_attack(region, target);
                }
            }
            Decision::WalkHome => {
                npc.stop_attack();
                npc.walk_to_spawn(region);
            }
            Decision::HeelTo(owner) => npc.follow(region, owner, 128, 5000),
            Decision::RunHook(hook) => hook(npc, now),
        }
        self.think_interval
    }

    /// Movement and lifecycle events from the body. Hooks run with no
    /// brain lock held.
    pub fn handle_event(&self, npc: &Arc<Npc>, event: &NpcEvent) {
        let hook = {
            let mut behavior = lock_unpoisoned(&self.behavior);
            match &mut *behavior {
                BrainBehavior::Standard(standard) => {
                    if matches!(event, NpcEvent::Died | NpcEvent::FollowLostTarget) {
                        standard.aggro.clear();
                    }
                    None
                }
                BrainBehavior::Scripted(scripted) => scripted.on_event.clone(),
                _ => None,
            }
        };
        if let Some(hook) = hook {
            hook(npc, event);
        }
    }

    /// How much this brain resents a particular entity.
    pub fn aggro_amount(&self, target: EntityHandle) -> i64 {
        match &*lock_unpoisoned(&self.behavior) {
            BrainBehavior::Standard(standard) => {
                standard.aggro.get(&target).copied().unwrap_or(0)
            }
            _ => 0,
        }
    }

    /// Damage and taunts feed the grudge table.
    pub fn add_aggro(&self, target: EntityHandle, amount: i64) {
        if let BrainBehavior::Standard(standard) = &mut *lock_unpoisoned(&self.behavior) {
            *standard.aggro.entry(target).or_insert(0) += amount;
        }
    }
}

impl StandardMobBrain {
    fn decide(&mut self, region: &Arc<Region>, npc: &Arc<Npc>, now: u64) -> Decision {
        if !npc.is_alive() {
            return Decision::Nothing;
        }

        // Passive scan: everyone close enough earns a base grudge.
        if self.aggro_level > 0 {
            let my_pos = npc.position(now);
            for player in region.players_in_radius(my_pos) {
                let within = my_pos.legacy_distance_to(player.position())
                    <= f64::from(self.aggro_range);
                if within {
                    *self.aggro.entry(player.handle()).or_insert(0) +=
                        i64::from(self.aggro_level);
                }
            }
        }

        // Drop grudges against anyone no longer in the world.
        self.aggro.retain(|handle, _| {
            matches!(
                region.resolve(*handle),
                Some(WorldEntity::Player(ref p)) if p.lifecycle().is_active()
            ) || matches!(
                region.resolve(*handle),
                Some(WorldEntity::Npc(ref n)) if n.lifecycle().is_active() && n.is_alive()
            )
        });

        let target = self
            .aggro
            .iter()
            .filter(|(_, amount)| **amount > 0)
            .max_by_key(|(_, amount)| **amount)
            .map(|(handle, _)| *handle);

        match target {
            Some(target) => Decision::Attack(target),
            None => {
                let at_home = npc.position(now) == npc.spawn_point();
                if npc.is_attacking() || (!at_home && !npc.is_moving()) {
                    Decision::WalkHome
                } else {
                    Decision::Nothing
                }
            }
        }
    }
}
