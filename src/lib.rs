pub mod ai;
pub mod config;
pub mod net;
pub mod persistence;
pub mod world;
