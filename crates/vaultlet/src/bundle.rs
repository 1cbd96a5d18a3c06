//! Bundle resolution - locating the worklet's packaged code.
//!
//! The bridge never interprets bundle contents; it only needs a path it can
//! hand to the runtime launcher. Resolution is an opaque external lookup
//! behind the [`BundleLocator`] trait so hosts can plug in whatever packaging
//! scheme they ship with.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Resolves a (name, kind) pair to a loadable worklet package path.
pub trait BundleLocator: Send + Sync {
    /// Returns the package path, or `None` if no such bundle exists.
    fn locate(&self, name: &str, kind: &str) -> Option<PathBuf>;
}

/// A bundle that has been resolved to a concrete path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedBundle {
    pub name: String,
    pub kind: String,
    pub path: PathBuf,
}

impl ResolvedBundle {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, path: PathBuf) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            path,
        }
    }
}

/// Locator that searches a single directory for `{name}.{kind}` files.
pub struct DirBundleLocator {
    root: PathBuf,
}

impl DirBundleLocator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl BundleLocator for DirBundleLocator {
    fn locate(&self, name: &str, kind: &str) -> Option<PathBuf> {
        let path = self.root.join(format!("{name}.{kind}"));
        if path.is_file() {
            tracing::debug!(path = %path.display(), "Resolved bundle");
            Some(path)
        } else {
            tracing::debug!(%name, %kind, root = %self.root.display(), "Bundle not found");
            None
        }
    }
}
