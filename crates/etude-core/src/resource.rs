// src/resource.rs
use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{EtudeError, EtudeResult};

/// Served when a request target ends in `/`.
pub const DEFAULT_PAGE: &str = "index.html";

const READ_OTHER: u32 = 0o004;

pub enum Content {
    Mapped(Mmap),
    /// Zero-length file; there is nothing to map.
    Empty,
    Directory,
    /// Present on disk but could not be opened or mapped at startup.
    Unmapped,
}

/// One entry of the document root, mapped once and shared read-only.
pub struct Resource {
    content: Content,
    size: u64,
    mode: u32,
}

impl Resource {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.content, Content::Directory)
    }

    /// Readable by "other", the permission the server honours.
    pub fn is_world_readable(&self) -> bool {
        self.mode & READ_OTHER != 0
    }

    /// Whether the bytes can be served. Directories and unmapped files cannot.
    pub fn is_servable(&self) -> bool {
        matches!(self.content, Content::Mapped(_) | Content::Empty)
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.content {
            Content::Mapped(map) => map,
            _ => &[],
        }
    }
}

pub enum Lookup {
    Found(Arc<Resource>),
    NotFound,
}

/// Every file and directory under the document root, keyed by `/relative/path`.
pub struct StaticResources {
    root: PathBuf,
    entries: HashMap<String, Arc<Resource>>,
}

impl StaticResources {
    /// Walk `root` recursively and map every regular file.
    pub fn scan(root: &Path) -> EtudeResult<Self> {
        let root = root.canonicalize().map_err(|source| EtudeError::Resource {
            path: root.to_path_buf(),
            source,
        })?;

        let mut entries = HashMap::new();
        for entry in WalkDir::new(&root) {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                EtudeError::Resource {
                    path,
                    source: e.into(),
                }
            })?;
            let Some(key) = resource_key(&root, entry.path()) else {
                continue;
            };
            let meta = entry.metadata().map_err(|e| EtudeError::Resource {
                path: entry.path().to_path_buf(),
                source: e.into(),
            })?;
            let mode = meta.permissions().mode();

            let content = if meta.is_dir() {
                Content::Directory
            } else if meta.is_file() {
                map_file(entry.path(), meta.len())
            } else {
                debug!(path = %entry.path().display(), "skipping special file");
                continue;
            };
            entries.insert(
                key,
                Arc::new(Resource {
                    content,
                    size: meta.len(),
                    mode,
                }),
            );
        }

        info!(root = %root.display(), entries = entries.len(), "static resources loaded");
        Ok(Self { root, entries })
    }

    pub fn resolve(&self, path: &str) -> Lookup {
        match self.entries.get(path) {
            Some(res) => Lookup::Found(Arc::clone(res)),
            None => Lookup::NotFound,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn resource_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut key = String::from("/");
    for (i, part) in rel.components().enumerate() {
        if i > 0 {
            key.push('/');
        }
        key.push_str(part.as_os_str().to_str()?);
    }
    Some(key)
}

fn map_file(path: &Path, len: u64) -> Content {
    if len == 0 {
        return Content::Empty;
    }
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot open file");
            return Content::Unmapped;
        }
    };
    // The document root is treated as immutable while the server runs.
    match unsafe { Mmap::map(&file) } {
        Ok(map) => Content::Mapped(map),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot map file");
            Content::Unmapped
        }
    }
}
