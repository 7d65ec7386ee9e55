use crate::arena::Arena;
use crate::cache::{Material, MaterialId, ResourceCache, Texture, TextureId};
use crate::level::{Aabb, BspDraw};
use crate::linker::{LevelId, LevelSet};

pub const DEFAULT_LOD_DISTANCE: f32 = 5000.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrawSet {
    Detailed,
    Coarse,
}

/// Borrowed view of one level's GPU-ready data for a single frame.
#[derive(Clone, Copy, Debug)]
pub struct RenderLevel<'a> {
    pub id: LevelId,
    pub name: &'a str,
    /// Packed vertices, `level::VERTEX_STRIDE` bytes each.
    pub vertices: &'a [u8],
    /// Little-endian u16 indices, relative to each draw's `vbo_offset`.
    pub indices: &'a [u8],
    pub draw_set: DrawSet,
    pub draws: &'a [BspDraw],
    pub lightmap: TextureId,
    /// Model-to-world translation.
    pub translation: [f32; 3],
    cache: &'a ResourceCache,
    arena: &'a Arena,
}

impl<'a> RenderLevel<'a> {
    pub fn material(&self, id: MaterialId) -> Option<&'a Material> {
        self.cache.material(id)
    }

    pub fn texture(&self, id: TextureId) -> Option<(&'a Texture, &'a [u8])> {
        let texture = self.cache.texture(id)?;
        Some((texture, self.arena.bytes(texture.pixels)))
    }
}

/// Backend that turns level views into draw calls.
pub trait RenderConsumer {
    fn begin_frame(&mut self) {}

    fn draw_level(&mut self, level: &RenderLevel<'_>);

    fn end_frame(&mut self) {}
}

/// Largest per-axis distance from `camera` to the outside of `aabb`; zero
/// inside the box.
pub fn outside_distance(camera: [f32; 3], aabb: &Aabb) -> f32 {
    (0..3)
        .map(|axis| {
            (aabb.min[axis] - camera[axis])
                .max(camera[axis] - aabb.max[axis])
                .max(0.0)
        })
        .fold(0.0, f32::max)
}

pub fn select_draw_set(camera: [f32; 3], world_aabb: &Aabb, lod_distance: f32) -> DrawSet {
    if outside_distance(camera, world_aabb) < lod_distance {
        DrawSet::Detailed
    } else {
        DrawSet::Coarse
    }
}

/// Hands every level of `set` to `consumer` with the draw sequence chosen
/// for the camera position.
pub fn render_levels(
    set: &LevelSet,
    cache: &ResourceCache,
    arena: &Arena,
    camera: [f32; 3],
    lod_distance: f32,
    consumer: &mut dyn RenderConsumer,
) {
    consumer.begin_frame();
    for (id, level) in set.iter() {
        let model = &level.model;
        let draw_set = select_draw_set(camera, &level.world_aabb(), lod_distance);
        let draws = match draw_set {
            DrawSet::Detailed => model.detailed.as_slice(),
            DrawSet::Coarse => model.coarse.as_slice(),
        };
        consumer.draw_level(&RenderLevel {
            id,
            name: &level.name,
            vertices: arena.bytes(model.vertices),
            indices: arena.bytes(model.indices),
            draw_set,
            draws,
            lightmap: model.lightmap,
            translation: level.transform(),
            cache,
            arena,
        });
    }
    consumer.end_frame();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{LoadContext, LoadSettings};
    use crate::level::test_support::{MapBuilder, Quad};
    use crate::linker::{assemble, LinkOptions};
    use crate::resolver::{MemoryResolver, ResourceKind};

    fn aabb() -> Aabb {
        Aabb {
            min: [0.0, 0.0, 0.0],
            max: [100.0, 100.0, 100.0],
        }
    }

    #[test]
    fn distance_uses_largest_axis() {
        assert_eq!(outside_distance([50.0, 50.0, 50.0], &aabb()), 0.0);
        assert_eq!(outside_distance([150.0, 50.0, -30.0], &aabb()), 50.0);
        assert_eq!(outside_distance([-10.0, 300.0, 120.0], &aabb()), 200.0);
    }

    #[test]
    fn near_levels_draw_detailed() {
        assert_eq!(select_draw_set([50.0, 50.0, 50.0], &aabb(), 5000.0), DrawSet::Detailed);
        assert_eq!(select_draw_set([5099.0, 0.0, 0.0], &aabb(), 5000.0), DrawSet::Detailed);
        assert_eq!(select_draw_set([5100.0, 0.0, 0.0], &aabb(), 5000.0), DrawSet::Coarse);
        assert_eq!(select_draw_set([0.0, 0.0, 0.0], &aabb(), 0.0), DrawSet::Coarse);
    }

    #[derive(Default)]
    struct Collect {
        frames: usize,
        seen: Vec<(String, DrawSet, usize, [f32; 3], bool)>,
    }

    impl RenderConsumer for Collect {
        fn begin_frame(&mut self) {
            self.frames += 1;
        }

        fn draw_level(&mut self, level: &RenderLevel<'_>) {
            let lightmap_ok = level
                .texture(level.lightmap)
                .is_some_and(|(texture, pixels)| {
                    pixels.len() == (texture.width * texture.height * 2) as usize
                });
            let materials_ok = level.draws.iter().all(|d| level.material(d.material).is_some());
            self.seen.push((
                level.name.to_string(),
                level.draw_set,
                level.draws.len(),
                level.translation,
                lightmap_ok && materials_ok,
            ));
        }
    }

    #[test]
    fn render_levels_picks_sets_per_level() {
        let mut resolver = MemoryResolver::new();
        let near = MapBuilder::new()
            .landmark("door", [0.0, 0.0, 0.0])
            .change_level("far", "door")
            .quad(Quad::new([0.0, 0.0, 0.0], 64.0, "dev/one"))
            .quad(Quad::new([64.0, 0.0, 0.0], 64.0, "dev/two"));
        let far = MapBuilder::new()
            .landmark("door", [-9000.0, 0.0, 0.0])
            .change_level("near", "door")
            .quad(Quad::new([0.0, 0.0, 0.0], 64.0, "dev/one"));
        resolver.insert(ResourceKind::Map, "near", near.build());
        resolver.insert(ResourceKind::Map, "far", far.build());

        let mut persistent = Arena::new("persistent", 1 << 20);
        let mut scratch = Arena::new("scratch", 1 << 20);
        let mut cache = ResourceCache::new(&mut persistent).expect("cache");
        let mut ctx = LoadContext {
            resolver: &resolver,
            cache: &mut cache,
            persistent: &mut persistent,
            scratch: &mut scratch,
            settings: LoadSettings::default(),
        };
        let set = assemble("near", &mut ctx, &LinkOptions::default());
        assert_eq!(set.len(), 2);

        let mut consumer = Collect::default();
        render_levels(
            &set,
            &cache,
            &persistent,
            [32.0, 32.0, 0.0],
            DEFAULT_LOD_DISTANCE,
            &mut consumer,
        );
        assert_eq!(consumer.frames, 1);
        assert_eq!(
            consumer.seen,
            vec![
                ("near".to_string(), DrawSet::Detailed, 2, [0.0; 3], true),
                ("far".to_string(), DrawSet::Coarse, 1, [9000.0, 0.0, 0.0], true),
            ]
        );
    }
}
