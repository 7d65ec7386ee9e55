use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::context::{LoadSettings, DEFAULT_COARSE_MIN_INDICES};
use crate::linker::{LinkOptions, DEFAULT_MAX_LEVELS};
use crate::logging::{self, LogLevel};
use crate::render::DEFAULT_LOD_DISTANCE;
use crate::resolver::normalize_name;
use crate::vfs::{MountKind, Vfs, VfsError};

pub const DEFAULT_ARENA_BYTES: usize = 32 * 1024 * 1024;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(String),
    Invalid(Vec<String>),
    Mount { index: usize, error: VfsError },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "config io error: {}", err),
            ConfigError::Parse(message) => write!(f, "config parse error: {}", message),
            ConfigError::Invalid(errors) => write!(f, "invalid config: {}", errors.join("; ")),
            ConfigError::Mount { index, error } => write!(f, "mount {} failed: {}", index, error),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(err) => Some(err),
            ConfigError::Mount { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MountSpec {
    /// `"dir"` or `"zip"`.
    pub kind: String,
    #[serde(default)]
    pub mount_point: String,
    pub path: PathBuf,
}

impl MountSpec {
    pub fn mount_kind(&self) -> Option<MountKind> {
        match self.kind.trim().to_ascii_lowercase().as_str() {
            "dir" => Some(MountKind::Dir),
            "zip" => Some(MountKind::Zip),
            _ => None,
        }
    }
}

/// Viewer settings read from a TOML file.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ViewerConfig {
    pub start_map: String,
    pub max_levels: usize,
    pub persistent_arena_bytes: usize,
    pub scratch_arena_bytes: usize,
    pub lod_distance: f32,
    pub coarse_min_indices: u32,
    pub texture_mip_bias: u32,
    pub enabled_maps: Option<Vec<String>>,
    pub log_level: Option<String>,
    pub mounts: Vec<MountSpec>,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            start_map: String::new(),
            max_levels: DEFAULT_MAX_LEVELS,
            persistent_arena_bytes: DEFAULT_ARENA_BYTES,
            scratch_arena_bytes: DEFAULT_ARENA_BYTES,
            lod_distance: DEFAULT_LOD_DISTANCE,
            coarse_min_indices: DEFAULT_COARSE_MIN_INDICES,
            texture_mip_bias: 0,
            enabled_maps: None,
            log_level: None,
            mounts: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConfigValidation {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ConfigValidation {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

impl ViewerConfig {
    pub fn parse_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Reads and validates a config file. Relative mount paths are resolved
    /// against the file's directory. Warnings are logged.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::parse_toml(&text)?;
        if let Some(base) = path.parent() {
            config.rebase_mounts(base);
        }
        let validation = config.validate();
        for warning in &validation.warnings {
            logging::warn(format!("{}: {}", path.display(), warning));
        }
        if !validation.is_ok() {
            return Err(ConfigError::Invalid(validation.errors));
        }
        Ok(config)
    }

    pub fn rebase_mounts(&mut self, base: &Path) {
        for mount in &mut self.mounts {
            if mount.path.is_relative() {
                mount.path = base.join(&mount.path);
            }
        }
    }

    pub fn validate(&self) -> ConfigValidation {
        let mut validation = ConfigValidation::default();
        if normalize_name(&self.start_map).is_empty() {
            validation
                .errors
                .push("start_map must not be empty".to_string());
        }
        if self.max_levels == 0 {
            validation
                .errors
                .push("max_levels must be at least 1".to_string());
        }
        if self.persistent_arena_bytes == 0 || self.scratch_arena_bytes == 0 {
            validation
                .errors
                .push("arena sizes must be > 0".to_string());
        }
        if !self.lod_distance.is_finite() || self.lod_distance < 0.0 {
            validation
                .errors
                .push("lod_distance must be finite and >= 0".to_string());
        }
        if self.coarse_min_indices == 0 {
            validation
                .warnings
                .push("coarse_min_indices is 0; coarse draws equal detailed draws".to_string());
        }
        if let Some(level) = &self.log_level {
            if LogLevel::parse(level).is_none() {
                validation
                    .errors
                    .push(format!("unknown log_level {:?}", level));
            }
        }
        if let Some(maps) = &self.enabled_maps {
            if maps.is_empty() {
                validation
                    .warnings
                    .push("enabled_maps is empty; only start_map will load".to_string());
            }
        }
        if self.mounts.is_empty() {
            validation
                .warnings
                .push("no mounts configured; nothing can be loaded".to_string());
        }
        for (index, mount) in self.mounts.iter().enumerate() {
            if mount.mount_kind().is_none() {
                validation.errors.push(format!(
                    "mount {} has unknown kind {:?} (expected dir or zip)",
                    index, mount.kind
                ));
            }
            if mount.path.as_os_str().is_empty() {
                validation
                    .errors
                    .push(format!("mount {} path must not be empty", index));
            }
        }
        validation
    }

    /// Mounts every configured source in order; earlier mounts take
    /// precedence.
    pub fn build_vfs(&self) -> Result<Vfs, ConfigError> {
        let mut vfs = Vfs::new();
        for (index, mount) in self.mounts.iter().enumerate() {
            let Some(kind) = mount.mount_kind() else {
                return Err(ConfigError::Invalid(vec![format!(
                    "mount {} has unknown kind {:?}",
                    index, mount.kind
                )]));
            };
            vfs.add_mount(kind, &mount.mount_point, &mount.path)
                .map_err(|error| ConfigError::Mount { index, error })?;
        }
        Ok(vfs)
    }

    pub fn link_options(&self) -> LinkOptions {
        LinkOptions {
            max_levels: self.max_levels,
            enabled_maps: self.enabled_maps.as_ref().map(|maps| {
                maps.iter()
                    .map(|map| normalize_name(map))
                    .collect::<HashSet<_>>()
            }),
        }
    }

    pub fn load_settings(&self) -> LoadSettings {
        LoadSettings {
            texture_mip_bias: self.texture_mip_bias,
            coarse_min_indices: self.coarse_min_indices,
        }
    }

    /// Applies `log_level` to the process-wide logger.
    pub fn apply_log_level(&self) {
        if let Some(level) = self.log_level.as_deref().and_then(LogLevel::parse) {
            logging::set_max_level(level);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{ResourceKind, ResourceResolver};
    use crate::vfs::test_support::temp_dir;

    #[test]
    fn defaults_fill_missing_fields() {
        let config = ViewerConfig::parse_toml("start_map = \"c1a0\"").expect("parse");
        assert_eq!(config.max_levels, DEFAULT_MAX_LEVELS);
        assert_eq!(config.persistent_arena_bytes, DEFAULT_ARENA_BYTES);
        assert_eq!(config.lod_distance, 5000.0);
        assert_eq!(config.coarse_min_indices, 4096);
        assert_eq!(config.link_options().enabled_maps, None);
        assert_eq!(config.load_settings(), LoadSettings::default());
        let validation = config.validate();
        assert!(validation.is_ok());
        assert_eq!(validation.warnings.len(), 1);
    }

    #[test]
    fn full_config_round_trips_into_options() {
        let text = r#"
start_map = "C1A0"
max_levels = 3
texture_mip_bias = 2
coarse_min_indices = 1024
enabled_maps = ["C1A0", "c1a1"]
log_level = "debug"

[[mounts]]
kind = "dir"
path = "hl2"

[[mounts]]
kind = "zip"
mount_point = "extra"
path = "/abs/pak.zip"
"#;
        let mut config = ViewerConfig::parse_toml(text).expect("parse");
        config.rebase_mounts(Path::new("/games"));
        assert_eq!(config.mounts[0].path, PathBuf::from("/games/hl2"));
        assert_eq!(config.mounts[1].path, PathBuf::from("/abs/pak.zip"));
        assert_eq!(config.mounts[1].mount_kind(), Some(MountKind::Zip));

        let options = config.link_options();
        assert_eq!(options.max_levels, 3);
        let maps = options.enabled_maps.expect("allow list");
        assert!(maps.contains("c1a0") && maps.contains("c1a1"));
        assert_eq!(config.load_settings().texture_mip_bias, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_reports_errors() {
        let text = r#"
max_levels = 0
lod_distance = -1.0
log_level = "loud"

[[mounts]]
kind = "iso"
path = ""
"#;
        let config = ViewerConfig::parse_toml(text).expect("parse");
        let validation = config.validate();
        assert!(!validation.is_ok());
        assert_eq!(validation.errors.len(), 6);
    }

    #[test]
    fn bad_types_fail_to_parse() {
        assert!(matches!(
            ViewerConfig::parse_toml("max_levels = \"many\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_mounts_relative_directories() {
        let root = temp_dir("config");
        std::fs::create_dir_all(root.join("game/maps")).expect("mkdir");
        std::fs::write(root.join("game/maps/start.bsp"), b"VBSP").expect("write");
        let config_path = root.join("viewer.toml");
        std::fs::write(
            &config_path,
            "start_map = \"start\"\n[[mounts]]\nkind = \"dir\"\npath = \"game\"\n",
        )
        .expect("write config");

        let config = ViewerConfig::load(&config_path).expect("load");
        let vfs = config.build_vfs().expect("vfs");
        assert!(vfs.open("start", ResourceKind::Map).is_some());

        std::fs::write(&config_path, "start_map = \"\"\n").expect("write config");
        assert!(matches!(
            ViewerConfig::load(&config_path),
            Err(ConfigError::Invalid(_))
        ));

        let mut missing = config.clone();
        missing.mounts[0].path = root.join("absent");
        assert!(matches!(
            missing.build_vfs(),
            Err(ConfigError::Mount { index: 0, .. })
        ));
        let _ = std::fs::remove_dir_all(&root);
    }
}
