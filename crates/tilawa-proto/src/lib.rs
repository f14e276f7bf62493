//! Shared types for the tilawa player: data model, configuration, platform
//! paths and the catalogue resolver.

pub mod catalogue;
pub mod config;
pub mod model;
pub mod platform;
