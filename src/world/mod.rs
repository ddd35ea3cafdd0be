pub mod door;
pub mod entity;
pub mod npc;
pub mod player;
pub mod position;
pub mod region;
pub mod timer;
pub mod visibility;
