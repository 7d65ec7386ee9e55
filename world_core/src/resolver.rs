use std::collections::HashMap;
use std::fmt;
use std::io::{Cursor, Read, Seek};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Map,
    Material,
    Texture,
}

impl ResourceKind {
    /// Virtual path of a named resource of this kind.
    pub fn path_for(self, name: &str) -> String {
        match self {
            ResourceKind::Map => format!("maps/{}.bsp", name),
            ResourceKind::Material => format!("materials/{}.vmt", name),
            ResourceKind::Texture => format!("materials/{}.vtf", name),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ResourceKind::Map => "map",
            ResourceKind::Material => "material",
            ResourceKind::Texture => "texture",
        };
        write!(f, "{}", label)
    }
}

pub trait ResourceStream: Read + Seek {}

impl<T: Read + Seek> ResourceStream for T {}

/// Source of named game resources. `None` means the resource does not exist
/// (or could not be opened); callers decide whether that is fatal.
pub trait ResourceResolver {
    fn open(&self, name: &str, kind: ResourceKind) -> Option<Box<dyn ResourceStream>>;
}

/// Canonical form of a resource name: lowercase, forward slashes, no
/// surrounding whitespace or leading slash.
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .replace('\\', "/")
        .trim_start_matches('/')
        .to_ascii_lowercase()
}

/// Resolver over byte blobs held in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryResolver {
    entries: HashMap<(ResourceKind, String), Arc<[u8]>>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: ResourceKind, name: &str, data: impl Into<Vec<u8>>) {
        let data: Vec<u8> = data.into();
        self.entries
            .insert((kind, normalize_name(name)), Arc::from(data));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ResourceResolver for MemoryResolver {
    fn open(&self, name: &str, kind: ResourceKind) -> Option<Box<dyn ResourceStream>> {
        let data = self.entries.get(&(kind, normalize_name(name)))?;
        Some(Box::new(Cursor::new(Arc::clone(data))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_name_folds_case_and_separators() {
        assert_eq!(normalize_name(" Maps\\C1A0 "), "maps/c1a0");
        assert_eq!(normalize_name("/materials/Dev"), "materials/dev");
    }

    #[test]
    fn kind_paths() {
        assert_eq!(ResourceKind::Map.path_for("c1a0"), "maps/c1a0.bsp");
        assert_eq!(
            ResourceKind::Material.path_for("dev/dev_wall"),
            "materials/dev/dev_wall.vmt"
        );
        assert_eq!(
            ResourceKind::Texture.path_for("dev/dev_wall"),
            "materials/dev/dev_wall.vtf"
        );
    }

    #[test]
    fn memory_resolver_separates_kinds() {
        let mut resolver = MemoryResolver::new();
        resolver.insert(ResourceKind::Material, "Brick/Wall", b"vmt".to_vec());
        let mut stream = resolver
            .open("brick\\wall", ResourceKind::Material)
            .expect("material present");
        let mut text = String::new();
        stream.read_to_string(&mut text).expect("read");
        assert_eq!(text, "vmt");
        assert!(resolver.open("brick/wall", ResourceKind::Texture).is_none());
    }
}
