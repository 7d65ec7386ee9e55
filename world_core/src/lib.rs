#![forbid(unsafe_code)]

pub mod arena;
pub mod cache;
pub mod config;
pub mod context;
pub mod level;
pub mod linker;
pub mod logging;
pub mod materials;
pub mod render;
pub mod resolver;
pub mod texture;
pub mod vfs;
pub mod world;
