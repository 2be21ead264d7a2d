use std::fs;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

use crate::error::NimbusError;
use crate::fs_util;
use crate::planner::CandidateSet;

/// The fixed roots a manager writes under. Validated once, never mutated.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    base_root: Utf8PathBuf,
    data_root: Utf8PathBuf,
    index_root: Utf8PathBuf,
    staging_root: Option<Utf8PathBuf>,
}

impl StorageLayout {
    /// `base_root` must already exist so a typo never creates a new storage tree.
    pub fn new(
        base_root: impl Into<Utf8PathBuf>,
        staging_root: Option<Utf8PathBuf>,
    ) -> Result<Self, NimbusError> {
        let base_root = base_root.into();
        if !base_root.as_std_path().is_dir() {
            return Err(NimbusError::MissingStorageRoot(base_root));
        }
        Ok(Self {
            data_root: base_root.join("data"),
            index_root: base_root.join("database"),
            base_root,
            staging_root,
        })
    }

    pub fn base_root(&self) -> &Utf8Path {
        &self.base_root
    }

    pub fn data_root(&self) -> &Utf8Path {
        &self.data_root
    }

    pub fn index_root(&self) -> &Utf8Path {
        &self.index_root
    }

    pub fn staging_root(&self) -> Option<&Utf8Path> {
        self.staging_root.as_deref()
    }

    pub fn ensure_index_root(&self) -> Result<(), NimbusError> {
        fs::create_dir_all(self.index_root.as_std_path())
            .map_err(|err| NimbusError::Filesystem(err.to_string()))
    }

    /// Makes every path in `candidates` absolute and checks it lies under its root.
    pub fn resolve(&self, candidates: CandidateSet) -> Result<CandidateSet, NimbusError> {
        let (sources, staging, finals, selectors) = candidates.into_parts();

        let staging = staging
            .into_iter()
            .map(|path| match (path, &self.staging_root) {
                (None, _) => Ok(None),
                (Some(path), None) => Err(NimbusError::UnexpectedStaging(path)),
                (Some(path), Some(root)) => resolve_under(root, path, "staging").map(Some),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let finals = finals
            .into_iter()
            .map(|path| resolve_under(&self.data_root, path, "final"))
            .collect::<Result<Vec<_>, _>>()?;
        let selectors = selectors
            .into_iter()
            .map(|path| resolve_under(&self.index_root, path, "index"))
            .collect::<Result<Vec<_>, _>>()?;

        CandidateSet::from_parts(sources, staging, finals, selectors)
    }

    pub fn prune_staging(&self) -> Result<usize, NimbusError> {
        let Some(root) = &self.staging_root else {
            return Ok(0);
        };
        if !root.as_std_path().exists() {
            return Ok(0);
        }
        fs_util::remove_empty_dirs(root.as_std_path())
            .map_err(|err| NimbusError::Filesystem(format!("prune {root}: {err}")))
    }
}

fn resolve_under(
    root: &Utf8Path,
    path: Utf8PathBuf,
    kind: &'static str,
) -> Result<Utf8PathBuf, NimbusError> {
    let escapes = path
        .components()
        .any(|component| matches!(component, Utf8Component::ParentDir));
    let resolved = if path.is_absolute() {
        path
    } else {
        root.join(path)
    };
    if escapes || !resolved.starts_with(root) {
        return Err(NimbusError::PathOutsideRoot {
            kind,
            root: root.to_path_buf(),
            path: resolved,
        });
    }
    Ok(resolved)
}
