use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use crate::world::entity::{lock_unpoisoned, EntityHandle, WorldEntity};
use crate::world::region::Region;

/// Region time base in milliseconds. Wall clocks run off a monotonic
/// start; manual clocks only move when a test advances them.
pub struct RegionClock {
    start: Instant,
    manual: Option<std::sync::atomic::AtomicU64>,
}

impl RegionClock {
    pub fn wall() -> Arc<Self> {
        Arc::new(Self {
            start: Instant::now(),
            manual: None,
        })
    }

    pub fn manual() -> Arc<Self> {
        Arc::new(Self {
            start: Instant::now(),
            manual: Some(std::sync::atomic::AtomicU64::new(0)),
        })
    }

    pub fn now_ms(&self) -> u64 {
        match &self.manual {
            Some(tick) => tick.load(Ordering::Acquire),
            None => self.start.elapsed().as_millis() as u64,
        }
    }

    /// Manual clocks only; advancing a wall clock is a caller bug.
    pub fn advance(&self, ms: u64) -> u64 {
        let tick = self
            .manual
            .as_ref()
            .expect("advance called on a wall clock");
        tick.fetch_add(ms, Ordering::AcqRel) + ms
    }
}

/// Fired with the region time; returns the next interval in milliseconds,
/// 0 to stop.
pub type TimerCallback = Box<dyn FnMut(u64) -> u64 + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Scheduled(u64),
    Cancelled,
}

struct TimerState {
    phase: Phase,
    /// Bumped on every start, stop and fire; heap entries carry the epoch
    /// they were pushed with, so anything older is void on pop.
    epoch: u64,
}

struct TimerSource {
    region: Weak<Region>,
    handle: EntityHandle,
}

struct TimerShared {
    scheduler: Weak<SchedulerShared>,
    source: Option<TimerSource>,
    state: Mutex<TimerState>,
    callback: Mutex<TimerCallback>,
}

/// Handle to one scheduled action. Dropping it does not cancel the action;
/// `stop` does.
pub struct RegionTimer {
    shared: Arc<TimerShared>,
}

impl RegionTimer {
    pub fn start(&self, delay_ms: u64) {
        start_shared(&self.shared, delay_ms);
    }

    pub fn stop(&self) {
        let mut state = lock_unpoisoned(&self.shared.state);
        state.phase = Phase::Cancelled;
        state.epoch += 1;
    }

    pub fn is_scheduled(&self) -> bool {
        matches!(
            lock_unpoisoned(&self.shared.state).phase,
            Phase::Scheduled(_)
        )
    }
}

fn start_shared(shared: &Arc<TimerShared>, delay_ms: u64) {
    let Some(scheduler) = shared.scheduler.upgrade() else {
        return;
    };
    let fire_at = scheduler.clock.now_ms().saturating_add(delay_ms);
    let epoch = {
        let mut state = lock_unpoisoned(&shared.state);
        state.epoch += 1;
        state.phase = Phase::Scheduled(fire_at);
        state.epoch
    };
    {
        let mut queue = lock_unpoisoned(&scheduler.queue);
        queue.seq += 1;
        let seq = queue.seq;
        queue.heap.push(QueueEntry {
            fire_at,
            seq,
            epoch,
            timer: Arc::downgrade(shared),
        });
    }
    scheduler.condvar.notify_one();
}

struct QueueEntry {
    fire_at: u64,
    seq: u64,
    epoch: u64,
    timer: Weak<TimerShared>,
}

// Reversed so the BinaryHeap pops the earliest deadline first.
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

struct Queue {
    heap: BinaryHeap<QueueEntry>,
    seq: u64,
}

struct SchedulerShared {
    clock: Arc<RegionClock>,
    queue: Mutex<Queue>,
    condvar: Condvar,
    shutdown: AtomicBool,
}

/// Region-scoped action scheduler. Deadlines live in a min-heap; workers
/// (or the manual `run_due` pump in tests) pop due entries and execute the
/// callbacks, routing NPC-sourced ones through the entity's mailbox.
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

const WORKER_IDLE_WAIT: Duration = Duration::from_millis(100);

impl Scheduler {
    pub fn new(clock: Arc<RegionClock>) -> Self {
        Self {
            shared: Arc::new(SchedulerShared {
                clock,
                queue: Mutex::new(Queue {
                    heap: BinaryHeap::new(),
                    seq: 0,
                }),
                condvar: Condvar::new(),
                shutdown: AtomicBool::new(false),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.shared.clock.now_ms()
    }

    /// A timer with no owning entity; the callback runs as long as the
    /// scheduler lives.
    pub fn timer(&self, callback: TimerCallback) -> RegionTimer {
        RegionTimer {
            shared: Arc::new(TimerShared {
                scheduler: Arc::downgrade(&self.shared),
                source: None,
                state: Mutex::new(TimerState {
                    phase: Phase::Idle,
                    epoch: 0,
                }),
                callback: Mutex::new(callback),
            }),
        }
    }

    /// A timer owned by an entity in `region`. If the entity is gone or
    /// deleted when the deadline comes up, the action cancels itself.
    pub fn entity_timer(
        &self,
        region: &Arc<Region>,
        handle: EntityHandle,
        callback: TimerCallback,
    ) -> RegionTimer {
        RegionTimer {
            shared: Arc::new(TimerShared {
                scheduler: Arc::downgrade(&self.shared),
                source: Some(TimerSource {
                    region: Arc::downgrade(region),
                    handle,
                }),
                state: Mutex::new(TimerState {
                    phase: Phase::Idle,
                    epoch: 0,
                }),
                callback: Mutex::new(callback),
            }),
        }
    }

    pub fn pending(&self) -> usize {
        lock_unpoisoned(&self.shared.queue).heap.len()
    }

    /// Pops and runs everything due at the current region time, returning
    /// how many actions actually ran; entries voided by a restart or stop
    /// do not count. The deterministic pump for manual-clock tests; also
    /// usable as a single-threaded drive loop.
    pub fn run_due(&self) -> usize {
        let mut fired = 0;
        loop {
            let now = self.shared.clock.now_ms();
            let entry = {
                let mut queue = lock_unpoisoned(&self.shared.queue);
                let due = queue
                    .heap
                    .peek()
                    .map(|top| top.fire_at <= now)
                    .unwrap_or(false);
                if due {
                    queue.heap.pop()
                } else {
                    None
                }
            };
            match entry {
                Some(entry) => {
                    if process_entry(&self.shared, entry) {
                        fired += 1;
                    }
                }
                None => return fired,
            }
        }
    }

    pub fn spawn_workers(&self, count: usize) {
        let mut workers = lock_unpoisoned(&self.workers);
        for i in 0..count {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("region-timer-{i}"))
                .spawn(move || worker_loop(shared));
            match handle {
                Ok(handle) => workers.push(handle),
                Err(err) => debug!("failed to spawn timer worker: {err}"),
            }
        }
    }

    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.condvar.notify_all();
        let workers = {
            let mut workers = lock_unpoisoned(&self.workers);
            std::mem::take(&mut *workers)
        };
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<SchedulerShared>) {
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        let entry = {
            let mut queue = lock_unpoisoned(&shared.queue);
            loop {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                let now = shared.clock.now_ms();
                let wait = match queue.heap.peek() {
                    Some(top) if top.fire_at <= now => break queue.heap.pop(),
                    Some(top) => Duration::from_millis(top.fire_at - now).min(WORKER_IDLE_WAIT),
                    None => WORKER_IDLE_WAIT,
                };
                queue = shared
                    .condvar
                    .wait_timeout(queue, wait)
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .0;
            }
        };
        if let Some(entry) = entry {
            process_entry(&shared, entry);
        }
    }
}

/// True when the entry's callback actually ran (or was queued to the
/// entity's mailbox); voided and self-cancelled entries report false.
fn process_entry(shared: &Arc<SchedulerShared>, entry: QueueEntry) -> bool {
    let Some(timer) = entry.timer.upgrade() else {
        return false;
    };
    {
        let mut state = lock_unpoisoned(&timer.state);
        if state.epoch != entry.epoch || !matches!(state.phase, Phase::Scheduled(_)) {
            return false;
        }
        state.phase = Phase::Idle;
        state.epoch += 1;
    }

    let now = shared.clock.now_ms();
    if let Some(source) = &timer.source {
        let region = match source.region.upgrade() {
            Some(region) => region,
            None => {
                cancel_stale(&timer, "region gone");
                return false;
            }
        };
        match region.resolve(source.handle) {
            Some(WorldEntity::Npc(npc)) => {
                if npc.lifecycle().is_deleted() {
                    cancel_stale(&timer, "npc deleted");
                    return false;
                }
                // Same-entity callbacks are serialized through the mailbox
                // in the order they came due.
                let deferred = Arc::clone(&timer);
                npc.mailbox()
                    .post(Box::new(move || run_callback(&deferred, now)));
                return true;
            }
            Some(entity) => {
                if entity_deleted(&entity) {
                    cancel_stale(&timer, "entity deleted");
                    return false;
                }
            }
            None => {
                cancel_stale(&timer, "stale entity handle");
                return false;
            }
        }
    }
    run_callback(&timer, now);
    true
}

fn entity_deleted(entity: &WorldEntity) -> bool {
    match entity {
        WorldEntity::Npc(npc) => npc.lifecycle().is_deleted(),
        WorldEntity::Player(player) => player.lifecycle().is_deleted(),
        WorldEntity::Door(door) => door.lifecycle().is_deleted(),
    }
}

fn cancel_stale(timer: &Arc<TimerShared>, reason: &str) {
    debug!("timed action cancelled at fire: {reason}");
    let mut state = lock_unpoisoned(&timer.state);
    state.phase = Phase::Cancelled;
    state.epoch += 1;
}

fn run_callback(timer: &Arc<TimerShared>, now: u64) {
    let next = {
        let mut callback = lock_unpoisoned(&timer.callback);
        callback(now)
    };
    if next > 0 {
        start_shared(timer, next);
    }
}

/// Per-entity job queue. Whoever flips the drain flag runs jobs until the
/// queue is empty; everyone else just enqueues. Jobs for one entity never
/// run concurrently and pop in the order they were posted.
pub struct Mailbox {
    queue: Mutex<VecDeque<Box<dyn FnOnce() + Send>>>,
    draining: AtomicBool,
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
        }
    }

    pub fn post(&self, job: Box<dyn FnOnce() + Send>) {
        lock_unpoisoned(&self.queue).push_back(job);
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        loop {
            let job = lock_unpoisoned(&self.queue).pop_front();
            match job {
                Some(job) => job(),
                None => {
                    self.draining.store(false, Ordering::Release);
                    // A racing post may have enqueued between the pop and
                    // the flag release; reclaim the drain if so.
                    if lock_unpoisoned(&self.queue).is_empty() {
                        return;
                    }
                    if self
                        .draining
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        return;
                    }
                }
            }
        }
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}
