use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::ai::brain::Brain;
use crate::world::npc::Npc;
use crate::world::position::Point3D;
use crate::world::region::Region;
use crate::world::timer::RegionClock;

/// A region as described in its YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct RegionConfig {
    pub id: u16,
    pub name: String,
    #[serde(default = "default_broadcast_radius")]
    pub broadcast_radius: i32,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub spawns: Vec<NpcSpawnConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NpcSpawnConfig {
    pub name: String,
    pub model: u16,
    pub level: u8,
    pub x: i32,
    pub y: i32,
    pub z: i32,
    #[serde(default)]
    pub heading: u16,
    #[serde(default)]
    pub realm: u8,
    #[serde(default = "default_max_speed")]
    pub max_speed: i32,
    #[serde(default)]
    pub aggro_level: u8,
    #[serde(default = "default_aggro_range")]
    pub aggro_range: i32,
}

fn default_broadcast_radius() -> i32 {
    4000
}

fn default_workers() -> usize {
    2
}

fn default_max_speed() -> i32 {
    191
}

fn default_aggro_range() -> i32 {
    500
}

pub fn parse_region_config(text: &str) -> Result<RegionConfig, String> {
    serde_yaml::from_str(text).map_err(|err| format!("bad region config: {err}"))
}

pub fn load_region_config<P: AsRef<Path>>(path: P) -> Result<RegionConfig, String> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|err| format!("cannot read {}: {err}", path.display()))?;
    parse_region_config(&text)
}

/// Builds the live region, starts its scheduler workers and populates it
/// from the spawn list. Aggressive spawns get a standard brain; the rest
/// keep the idle default.
pub fn build_region(config: &RegionConfig, clock: Arc<RegionClock>) -> Arc<Region> {
    let region = Region::new(config.id, &config.name, config.broadcast_radius, clock);
    region.start_workers(config.workers);
    for spawn in &config.spawns {
        let npc = Npc::new(
            &spawn.name,
            spawn.model,
            spawn.level,
            Point3D::new(spawn.x, spawn.y, spawn.z),
        );
        npc.set_max_speed(spawn.max_speed);
        npc.set_realm_quiet(spawn.realm);
        region.add_npc(Arc::clone(&npc));
        npc.turn_to_heading(&region, spawn.heading, None);
        npc.capture_spawn_point();
        if spawn.aggro_level > 0 {
            npc.set_own_brain(Brain::standard(spawn.aggro_level, spawn.aggro_range));
        }
    }
    region
}
