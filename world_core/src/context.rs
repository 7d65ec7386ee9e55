use crate::arena::Arena;
use crate::cache::ResourceCache;
use crate::resolver::ResourceResolver;

pub const DEFAULT_COARSE_MIN_INDICES: u32 = 4096;

/// Tunables that shape what the loaders produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadSettings {
    /// Mip level read from each texture; clamped to the available chain.
    pub texture_mip_bias: u32,
    /// Coarse draws keep merging until they hold at least this many indices.
    pub coarse_min_indices: u32,
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            texture_mip_bias: 0,
            coarse_min_indices: DEFAULT_COARSE_MIN_INDICES,
        }
    }
}

/// Everything a load operation borrows. Persistent results go to
/// `persistent`; `scratch` must be back at its entry mark when the
/// operation returns.
pub struct LoadContext<'a> {
    pub resolver: &'a dyn ResourceResolver,
    pub cache: &'a mut ResourceCache,
    pub persistent: &'a mut Arena,
    pub scratch: &'a mut Arena,
    pub settings: LoadSettings,
}
