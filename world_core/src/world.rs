use std::fmt;
use std::path::Path;

use crate::arena::{Arena, ArenaError};
use crate::cache::{CacheSummary, ResourceCache};
use crate::config::{ConfigError, ViewerConfig};
use crate::context::LoadContext;
use crate::linker::{self, LevelSet};
use crate::logging;
use crate::render::{self, RenderConsumer};
use crate::resolver::ResourceResolver;

#[derive(Debug)]
pub enum WorldError {
    Config(ConfigError),
    Memory(ArenaError),
    NoLevels(String),
}

impl fmt::Display for WorldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorldError::Config(err) => write!(f, "{}", err),
            WorldError::Memory(err) => write!(f, "cache init failed: {}", err),
            WorldError::NoLevels(start) => write!(f, "start map {} could not be loaded", start),
        }
    }
}

impl std::error::Error for WorldError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WorldError::Config(err) => Some(err),
            WorldError::Memory(err) => Some(err),
            WorldError::NoLevels(_) => None,
        }
    }
}

impl From<ConfigError> for WorldError {
    fn from(err: ConfigError) -> Self {
        WorldError::Config(err)
    }
}

/// Every level reachable from the configured start map, with the memory
/// and cache that back it.
#[derive(Debug)]
pub struct World {
    pub persistent: Arena,
    pub scratch: Arena,
    pub cache: ResourceCache,
    pub levels: LevelSet,
    pub lod_distance: f32,
}

impl World {
    pub fn load(config: &ViewerConfig, resolver: &dyn ResourceResolver) -> Result<Self, WorldError> {
        let mut persistent = Arena::new("persistent", config.persistent_arena_bytes);
        let mut scratch = Arena::new("scratch", config.scratch_arena_bytes);
        let mut cache = ResourceCache::new(&mut persistent).map_err(WorldError::Memory)?;
        let levels = {
            let mut ctx = LoadContext {
                resolver,
                cache: &mut cache,
                persistent: &mut persistent,
                scratch: &mut scratch,
                settings: config.load_settings(),
            };
            linker::assemble(&config.start_map, &mut ctx, &config.link_options())
        };
        if levels.is_empty() {
            return Err(WorldError::NoLevels(config.start_map.clone()));
        }
        logging::info(format!(
            "world: {} levels, {} textures, {} materials, persistent {}/{} bytes",
            levels.len(),
            cache.texture_count(),
            cache.material_count(),
            persistent.used(),
            persistent.capacity()
        ));
        Ok(Self {
            persistent,
            scratch,
            cache,
            levels,
            lod_distance: config.lod_distance,
        })
    }

    /// Loads the config at `path`, mounts its sources and assembles the world.
    pub fn open(path: &Path) -> Result<Self, WorldError> {
        let config = ViewerConfig::load(path)?;
        config.apply_log_level();
        let vfs = config.build_vfs()?;
        Self::load(&config, &vfs)
    }

    pub fn render(&self, camera: [f32; 3], consumer: &mut dyn RenderConsumer) {
        render::render_levels(
            &self.levels,
            &self.cache,
            &self.persistent,
            camera,
            self.lod_distance,
            consumer,
        );
    }

    pub fn cache_summary(&self) -> CacheSummary {
        self.cache.summary()
    }
}
