use std::collections::{HashMap, HashSet, VecDeque};

use crate::context::LoadContext;
use crate::level::{self, add3, sub3, Aabb, BspModel, MapLinks};
use crate::logging;
use crate::resolver::{normalize_name, ResourceKind};

pub const DEFAULT_MAX_LEVELS: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LevelId(usize);

impl LevelId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A loaded level placed in the shared world frame.
#[derive(Clone, Debug)]
pub struct Level {
    pub name: String,
    pub model: BspModel,
    pub links: MapLinks,
    pub parent: Option<LevelId>,
    /// Offset from the parent's frame; zero for roots.
    pub offset: [f32; 3],
    translation: [f32; 3],
    /// User adjustment added on top of the link-time translation.
    pub shift: [f32; 3],
}

impl Level {
    /// Placement fixed when the level was linked.
    pub fn translation(&self) -> [f32; 3] {
        self.translation
    }

    pub fn transform(&self) -> [f32; 3] {
        add3(self.translation, self.shift)
    }

    pub fn world_aabb(&self) -> Aabb {
        self.model.aabb.translated(self.transform())
    }
}

#[derive(Clone, Debug, Default)]
pub struct LevelSet {
    by_name: HashMap<String, LevelId>,
    levels: Vec<Level>,
    selected: usize,
}

impl LevelSet {
    pub fn get(&self, name: &str) -> Option<LevelId> {
        self.by_name.get(&normalize_name(name)).copied()
    }

    pub fn level(&self, id: LevelId) -> Option<&Level> {
        self.levels.get(id.0)
    }

    pub fn level_mut(&mut self, id: LevelId) -> Option<&mut Level> {
        self.levels.get_mut(id.0)
    }

    /// Levels in load order.
    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    pub fn iter(&self) -> impl Iterator<Item = (LevelId, &Level)> + '_ {
        self.levels
            .iter()
            .enumerate()
            .map(|(index, level)| (LevelId(index), level))
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn selected(&self) -> Option<LevelId> {
        (self.selected < self.levels.len()).then_some(LevelId(self.selected))
    }

    pub fn select_next(&mut self) -> Option<LevelId> {
        if self.levels.is_empty() {
            return None;
        }
        self.selected = (self.selected + 1) % self.levels.len();
        self.selected()
    }

    pub fn select_prev(&mut self) -> Option<LevelId> {
        if self.levels.is_empty() {
            return None;
        }
        self.selected = (self.selected + self.levels.len() - 1) % self.levels.len();
        self.selected()
    }

    /// Adds `delta` to the selected level's shift. Only that level moves;
    /// levels parented to it keep their own transforms.
    pub fn nudge_selected(&mut self, delta: [f32; 3]) -> Option<LevelId> {
        let id = self.selected()?;
        let level = &mut self.levels[id.0];
        level.shift = add3(level.shift, delta);
        Some(id)
    }

    fn insert(&mut self, level: Level) -> LevelId {
        let id = LevelId(self.levels.len());
        self.by_name.insert(level.name.clone(), id);
        self.levels.push(level);
        id
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkOptions {
    pub max_levels: usize,
    /// When set, only these maps are followed. The start map always loads.
    pub enabled_maps: Option<HashSet<String>>,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            max_levels: DEFAULT_MAX_LEVELS,
            enabled_maps: None,
        }
    }
}

impl LinkOptions {
    pub fn allows(&self, map: &str) -> bool {
        self.enabled_maps
            .as_ref()
            .map_or(true, |maps| maps.contains(map))
    }
}

/// Loads `start` and every level reachable from it through changelevel
/// links, breadth first, and places each one relative to the first already
/// loaded level it links to through a shared landmark.
pub fn assemble(start: &str, ctx: &mut LoadContext<'_>, options: &LinkOptions) -> LevelSet {
    let mut set = LevelSet::default();
    let mut queue = VecDeque::new();
    let mut queued = HashSet::new();
    let mut failed = HashSet::new();

    let start = normalize_name(start);
    queued.insert(start.clone());
    queue.push_back(start);

    while set.len() < options.max_levels {
        let Some(name) = queue.pop_front() else {
            break;
        };
        let Some(mut stream) = ctx.resolver.open(&name, ResourceKind::Map) else {
            logging::warn(format!("map {} not found", name));
            failed.insert(name);
            continue;
        };
        let (model, links) = match level::parse_level(stream.as_mut(), ctx) {
            Ok(parsed) => parsed,
            Err(err) => {
                logging::warn(format!("map {}: {}", name, err));
                failed.insert(name);
                continue;
            }
        };

        let mut parent = None;
        let mut offset = [0.0; 3];
        for link in &links.maps {
            if let Some(id) = set.get(&link.map) {
                if parent.is_some() {
                    continue;
                }
                let other = &set.levels[id.0];
                match (other.links.landmark(&link.landmark), links.landmark(&link.landmark)) {
                    (Some(theirs), Some(ours)) => {
                        parent = Some(id);
                        offset = sub3(theirs, ours);
                    }
                    _ => logging::warn(format!(
                        "map {}: landmark {} missing for link to {}",
                        name, link.landmark, link.map
                    )),
                }
            } else if link.map != name
                && !queued.contains(&link.map)
                && !failed.contains(&link.map)
                && options.allows(&link.map)
            {
                queued.insert(link.map.clone());
                queue.push_back(link.map.clone());
            }
        }

        let translation = match parent {
            Some(id) => add3(set.levels[id.0].translation, offset),
            None => {
                if !set.is_empty() {
                    logging::warn(format!(
                        "map {} does not link to any loaded level; placing it at the origin",
                        name
                    ));
                }
                [0.0; 3]
            }
        };
        set.insert(Level {
            name,
            model,
            links,
            parent,
            offset,
            translation,
            shift: [0.0; 3],
        });
    }

    if !queue.is_empty() {
        logging::info(format!(
            "level budget of {} reached; {} maps not loaded",
            options.max_levels,
            queue.len()
        ));
    }
    log_summary(&set);
    set
}

fn log_summary(set: &LevelSet) {
    logging::info(format!("assembled {} levels", set.len()));
    for level in set.levels() {
        let [x, y, z] = level.translation;
        let parent = level
            .parent
            .and_then(|id| set.level(id))
            .map_or("-", |parent| parent.name.as_str());
        logging::info(format!(
            "  {} at ({}, {}, {}) parent {} ({} triangles)",
            level.name,
            x,
            y,
            z,
            parent,
            level.model.triangle_count()
        ));
    }
}
