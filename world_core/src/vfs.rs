use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use zip::read::ZipArchive;

use crate::logging;
use crate::resolver::{normalize_name, ResourceKind, ResourceResolver, ResourceStream};

#[derive(Debug)]
pub enum VfsError {
    Io(std::io::Error),
    NotFound(String),
    UnsafePath(String),
    Zip(String),
}

impl fmt::Display for VfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VfsError::Io(err) => write!(f, "io error: {}", err),
            VfsError::NotFound(path) => write!(f, "not found: {}", path),
            VfsError::UnsafePath(path) => write!(f, "rejected path: {}", path),
            VfsError::Zip(message) => write!(f, "archive error: {}", message),
        }
    }
}

impl std::error::Error for VfsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VfsError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for VfsError {
    fn from(err: std::io::Error) -> Self {
        VfsError::Io(err)
    }
}

impl From<zip::result::ZipError> for VfsError {
    fn from(err: zip::result::ZipError) -> Self {
        VfsError::Zip(err.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MountKind {
    Dir,
    Zip,
}

impl fmt::Display for MountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountKind::Dir => f.write_str("dir"),
            MountKind::Zip => f.write_str("zip"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountSummary {
    pub mount_point: String,
    pub kind: MountKind,
    pub source: PathBuf,
    /// Files visible through the mount; `None` for directories.
    pub files: Option<usize>,
}

/// Game content assembled from directories and zip archives. Lookups try
/// mounts in the order they were added and stop at the first hit.
#[derive(Debug, Default)]
pub struct Vfs {
    mounts: Vec<Mount>,
}

#[derive(Debug)]
struct Mount {
    /// Virtual directory the mount appears under, split into components.
    prefix: Vec<String>,
    source: MountSource,
}

#[derive(Debug)]
enum MountSource {
    Directory(PathBuf),
    Archive {
        path: PathBuf,
        /// Lowercased entry path -> archive index.
        entries: HashMap<String, usize>,
        /// Kept open so lookups reuse the parsed central directory.
        archive: Mutex<ZipArchive<fs::File>>,
    },
}

impl Vfs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_mount(
        &mut self,
        kind: MountKind,
        mount_point: &str,
        path: impl Into<PathBuf>,
    ) -> Result<(), VfsError> {
        match kind {
            MountKind::Dir => self.add_dir_mount(mount_point, path),
            MountKind::Zip => self.add_zip_mount(mount_point, path),
        }
    }

    pub fn add_dir_mount(
        &mut self,
        mount_point: &str,
        path: impl Into<PathBuf>,
    ) -> Result<(), VfsError> {
        let prefix = split_mount_point(mount_point)?;
        let root = path.into();
        if !root.is_dir() {
            return Err(VfsError::NotFound(root.display().to_string()));
        }
        logging::debug(format!("vfs: mounted dir {} at /{}", root.display(), prefix.join("/")));
        self.mounts.push(Mount {
            prefix,
            source: MountSource::Directory(root),
        });
        Ok(())
    }

    /// Indexes every file in the archive up front; entries with unsafe names
    /// are skipped.
    pub fn add_zip_mount(
        &mut self,
        mount_point: &str,
        path: impl Into<PathBuf>,
    ) -> Result<(), VfsError> {
        let prefix = split_mount_point(mount_point)?;
        let path = path.into();
        let mut archive = ZipArchive::new(fs::File::open(&path)?)?;
        let mut entries = HashMap::new();
        let mut skipped = 0usize;
        for index in 0..archive.len() {
            let entry = archive.by_index(index)?;
            if entry.is_dir() {
                continue;
            }
            let key = normalize_name(entry.name());
            if split_virtual(&key).is_err() {
                skipped += 1;
                continue;
            }
            entries.entry(key).or_insert(index);
        }
        if skipped > 0 {
            logging::warn(format!(
                "vfs: {} skipped {} entries with unsafe names",
                path.display(),
                skipped
            ));
        }
        logging::debug(format!(
            "vfs: mounted zip {} ({} files) at /{}",
            path.display(),
            entries.len(),
            prefix.join("/")
        ));
        self.mounts.push(Mount {
            prefix,
            source: MountSource::Archive {
                path,
                entries,
                archive: Mutex::new(archive),
            },
        });
        Ok(())
    }

    pub fn mounts(&self) -> Vec<MountSummary> {
        self.mounts
            .iter()
            .map(|mount| {
                let (kind, source, files) = match &mount.source {
                    MountSource::Directory(root) => (MountKind::Dir, root.clone(), None),
                    MountSource::Archive { path, entries, .. } => {
                        (MountKind::Zip, path.clone(), Some(entries.len()))
                    }
                };
                MountSummary {
                    mount_point: mount.prefix.join("/"),
                    kind,
                    source,
                    files,
                }
            })
            .collect()
    }

    pub fn read(&self, virtual_path: &str) -> Result<Vec<u8>, VfsError> {
        let components = split_file_path(virtual_path)?;
        for mount in &self.mounts {
            if let Some(data) = mount.read(&components)? {
                return Ok(data);
            }
        }
        Err(VfsError::NotFound(virtual_path.to_string()))
    }

    pub fn exists(&self, virtual_path: &str) -> bool {
        let Ok(components) = split_file_path(virtual_path) else {
            return false;
        };
        self.mounts.iter().any(|mount| mount.contains(&components))
    }
}

impl ResourceResolver for Vfs {
    fn open(&self, name: &str, kind: ResourceKind) -> Option<Box<dyn ResourceStream>> {
        let path = kind.path_for(&normalize_name(name));
        match self.read(&path) {
            Ok(data) => Some(Box::new(Cursor::new(data))),
            Err(VfsError::NotFound(_)) => None,
            Err(err) => {
                logging::warn(format!("vfs: {} {}: {}", kind, name, err));
                None
            }
        }
    }
}

impl Mount {
    fn relative<'p>(&self, components: &'p [String]) -> Option<&'p [String]> {
        if components.len() <= self.prefix.len() {
            return None;
        }
        let (head, rest) = components.split_at(self.prefix.len());
        head.iter()
            .zip(&self.prefix)
            .all(|(part, prefix)| part.eq_ignore_ascii_case(prefix))
            .then_some(rest)
    }

    fn read(&self, components: &[String]) -> Result<Option<Vec<u8>>, VfsError> {
        let Some(rel) = self.relative(components) else {
            return Ok(None);
        };
        match &self.source {
            MountSource::Directory(root) => match find_file(root, rel) {
                Some(path) => Ok(Some(fs::read(path)?)),
                None => Ok(None),
            },
            MountSource::Archive {
                entries, archive, ..
            } => {
                let Some(&index) = entries.get(&rel.join("/").to_ascii_lowercase()) else {
                    return Ok(None);
                };
                let mut archive = archive
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                let mut entry = archive.by_index(index)?;
                let mut data = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut data)?;
                Ok(Some(data))
            }
        }
    }

    fn contains(&self, components: &[String]) -> bool {
        let Some(rel) = self.relative(components) else {
            return false;
        };
        match &self.source {
            MountSource::Directory(root) => find_file(root, rel).is_some(),
            MountSource::Archive { entries, .. } => {
                entries.contains_key(&rel.join("/").to_ascii_lowercase())
            }
        }
    }
}

/// Resolves `rel` under `root`, matching each component exactly first and
/// then ignoring ASCII case. Content authored on Windows keeps mixed-case
/// names that maps refer to in lowercase.
fn find_file(root: &Path, rel: &[String]) -> Option<PathBuf> {
    let mut current = root.to_path_buf();
    for component in rel {
        let exact = current.join(component);
        if exact.exists() {
            current = exact;
            continue;
        }
        let entry = fs::read_dir(&current).ok()?.flatten().find(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.eq_ignore_ascii_case(component))
        })?;
        current = entry.path();
    }
    current.is_file().then_some(current)
}

/// Mount points compare like resource names, so they are stored lowercase.
fn split_mount_point(mount_point: &str) -> Result<Vec<String>, VfsError> {
    split_virtual(&mount_point.to_ascii_lowercase())
}

/// Splits a virtual path into components, rejecting anything that could
/// escape a mount root. An empty path yields no components.
fn split_virtual(path: &str) -> Result<Vec<String>, VfsError> {
    let unified = path.trim().replace('\\', "/");
    if unified.is_empty() {
        return Ok(Vec::new());
    }
    if unified.starts_with('/') {
        return Err(VfsError::UnsafePath(path.to_string()));
    }
    unified
        .split('/')
        .map(|part| match part {
            "" | "." | ".." => Err(VfsError::UnsafePath(path.to_string())),
            _ if part.contains(':') => Err(VfsError::UnsafePath(path.to_string())),
            _ => Ok(part.to_string()),
        })
        .collect()
}

fn split_file_path(path: &str) -> Result<Vec<String>, VfsError> {
    let components = split_virtual(path)?;
    if components.is_empty() {
        return Err(VfsError::UnsafePath(path.to_string()));
    }
    Ok(components)
}
