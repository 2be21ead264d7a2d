pub mod gfs;

use camino::Utf8Path;

use crate::domain::{DataKind, ProductName, SourceLocator};
use crate::error::NimbusError;
use crate::fs_util;
use crate::planner::PostFetchProcessor;
use crate::record::MetadataRecord;

/// Keeps the fetched bytes as they are: moves the staged file into its final
/// place (when staged at all) and records the core metadata.
#[derive(Debug, Clone, Copy)]
pub struct StoreAsIs {
    pub product: ProductName,
    pub kind: DataKind,
}

impl PostFetchProcessor for StoreAsIs {
    fn process(
        &self,
        source: &SourceLocator,
        staging: Option<&Utf8Path>,
        final_path: &Utf8Path,
    ) -> Result<MetadataRecord, NimbusError> {
        if let Some(staging) = staging {
            if final_path.as_std_path().exists() {
                return Err(NimbusError::Processor(format!(
                    "final path already exists: {final_path}"
                )));
            }
            fs_util::ensure_parent(final_path)?;
            fs_util::move_file(staging, final_path)
                .map_err(|err| NimbusError::Processor(format!("move {staging}: {err}")))?;
        }
        MetadataRecord::for_file(self.product, self.kind, source.clone(), final_path)
    }
}
