use std::collections::HashMap;

use compat_source::vtf::ImageFormat;

use crate::arena::{Arena, ArenaError, ArenaRange};

pub const PLACEHOLDER_NAME: &str = "__placeholder";
/// White, so unresolved surfaces still show their lighting.
pub const PLACEHOLDER_TEXEL: u16 = 0xffff;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(u32);

impl TextureId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialId(u32);

impl MaterialId {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

/// A decoded RGB565 image living in the persistent arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Texture {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub pixels: ArenaRange,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Material {
    pub name: String,
    pub base_textures: [Option<TextureId>; 2],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheSummary {
    pub textures: usize,
    pub materials: Vec<String>,
}

/// Name-keyed store of textures and materials. Entries are never evicted
/// or replaced.
#[derive(Debug)]
pub struct ResourceCache {
    textures: Vec<Texture>,
    texture_names: HashMap<String, TextureId>,
    materials: Vec<Material>,
    material_names: HashMap<String, MaterialId>,
    placeholder_texture: TextureId,
    placeholder_material: MaterialId,
}

impl ResourceCache {
    /// Creates the cache and registers the placeholder texture and material,
    /// storing the placeholder's single texel in `persistent`.
    pub fn new(persistent: &mut Arena) -> Result<Self, ArenaError> {
        let pixels = persistent.push_bytes(&PLACEHOLDER_TEXEL.to_le_bytes())?;
        let mut cache = Self {
            textures: Vec::new(),
            texture_names: HashMap::new(),
            materials: Vec::new(),
            material_names: HashMap::new(),
            placeholder_texture: TextureId(0),
            placeholder_material: MaterialId(0),
        };
        cache.placeholder_texture = cache.put_texture(
            PLACEHOLDER_NAME,
            Texture {
                width: 1,
                height: 1,
                format: ImageFormat::Rgb565,
                pixels,
            },
        );
        cache.placeholder_material = cache.put_material(
            PLACEHOLDER_NAME,
            Material {
                name: PLACEHOLDER_NAME.to_string(),
                base_textures: [Some(cache.placeholder_texture), None],
            },
        );
        Ok(cache)
    }

    pub fn placeholder_texture(&self) -> TextureId {
        self.placeholder_texture
    }

    pub fn placeholder_material(&self) -> MaterialId {
        self.placeholder_material
    }

    pub fn get_texture(&self, name: &str) -> Option<TextureId> {
        self.texture_names.get(name).copied()
    }

    /// Stores `texture` under `name`. If the name is taken the existing entry
    /// wins and its id is returned.
    pub fn put_texture(&mut self, name: &str, texture: Texture) -> TextureId {
        if let Some(existing) = self.texture_names.get(name) {
            return *existing;
        }
        let id = self.add_texture(texture);
        self.texture_names.insert(name.to_string(), id);
        id
    }

    /// Stores a texture that is only reachable by id (lightmap atlases).
    pub fn add_texture(&mut self, texture: Texture) -> TextureId {
        let id = TextureId(self.textures.len() as u32);
        self.textures.push(texture);
        id
    }

    /// Makes `name` resolve to an already stored texture, unless the name is
    /// taken.
    pub fn alias_texture(&mut self, name: &str, id: TextureId) -> TextureId {
        *self.texture_names.entry(name.to_string()).or_insert(id)
    }

    pub fn texture(&self, id: TextureId) -> Option<&Texture> {
        self.textures.get(id.index())
    }

    pub fn get_material(&self, name: &str) -> Option<MaterialId> {
        self.material_names.get(name).copied()
    }

    pub fn put_material(&mut self, name: &str, material: Material) -> MaterialId {
        if let Some(existing) = self.material_names.get(name) {
            return *existing;
        }
        let id = MaterialId(self.materials.len() as u32);
        self.materials.push(material);
        self.material_names.insert(name.to_string(), id);
        id
    }

    pub fn material(&self, id: MaterialId) -> Option<&Material> {
        self.materials.get(id.index())
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn material_count(&self) -> usize {
        self.materials.len()
    }

    /// Sorted names of every cached material except the placeholder.
    pub fn summary(&self) -> CacheSummary {
        let mut materials: Vec<String> = self
            .material_names
            .keys()
            .filter(|name| name.as_str() != PLACEHOLDER_NAME)
            .cloned()
            .collect();
        materials.sort();
        CacheSummary {
            textures: self.textures.len(),
            materials,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texture_with(arena: &mut Arena, texel: u16) -> Texture {
        let pixels = arena.push_bytes(&texel.to_le_bytes()).expect("pixels");
        Texture {
            width: 1,
            height: 1,
            format: ImageFormat::Dxt1,
            pixels,
        }
    }

    #[test]
    fn new_registers_placeholders() {
        let mut arena = Arena::new("persistent", 64);
        let cache = ResourceCache::new(&mut arena).expect("cache");
        let texture = cache
            .texture(cache.placeholder_texture())
            .expect("placeholder texture");
        assert_eq!((texture.width, texture.height), (1, 1));
        assert_eq!(arena.bytes(texture.pixels), &[0xff, 0xff]);
        let material = cache
            .material(cache.placeholder_material())
            .expect("placeholder material");
        assert_eq!(material.base_textures[0], Some(cache.placeholder_texture()));
        assert!(cache.summary().materials.is_empty());
    }

    #[test]
    fn first_put_wins() {
        let mut arena = Arena::new("persistent", 64);
        let mut cache = ResourceCache::new(&mut arena).expect("cache");
        let a = texture_with(&mut arena, 0x1234);
        let b = texture_with(&mut arena, 0x5678);

        let id = cache.put_texture("x", a);
        assert_eq!(cache.get_texture("x"), Some(id));
        let again = cache.put_texture("x", b);
        assert_eq!(again, id);

        let stored = cache.texture(id).expect("stored");
        assert_eq!(stored.pixels, a.pixels);
        assert_eq!(arena.bytes(stored.pixels), &0x1234u16.to_le_bytes());
        assert_eq!(arena.bytes(b.pixels), &0x5678u16.to_le_bytes());
    }

    #[test]
    fn namespaces_are_separate() {
        let mut arena = Arena::new("persistent", 64);
        let mut cache = ResourceCache::new(&mut arena).expect("cache");
        let texture = texture_with(&mut arena, 1);
        cache.put_texture("brick", texture);
        assert!(cache.get_material("brick").is_none());
        let material = cache.put_material(
            "brick",
            Material {
                name: "brick".to_string(),
                base_textures: [None, None],
            },
        );
        assert_eq!(cache.get_material("brick"), Some(material));
        assert_eq!(cache.summary().materials, vec!["brick".to_string()]);
    }

    #[test]
    fn alias_does_not_override() {
        let mut arena = Arena::new("persistent", 64);
        let mut cache = ResourceCache::new(&mut arena).expect("cache");
        let texture = texture_with(&mut arena, 1);
        let real = cache.put_texture("real", texture);
        let placeholder = cache.placeholder_texture();
        assert_eq!(cache.alias_texture("missing", placeholder), placeholder);
        assert_eq!(cache.alias_texture("real", placeholder), real);
    }

    #[test]
    fn placeholder_needs_persistent_space() {
        let mut arena = Arena::new("persistent", 1);
        assert!(ResourceCache::new(&mut arena).is_err());
    }
}
