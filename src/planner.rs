use camino::{Utf8Path, Utf8PathBuf};

use crate::domain::{SourceLocator, TimeWindow};
use crate::error::NimbusError;
use crate::record::{FieldSchema, MetadataRecord};

/// One row of a [`CandidateSet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub source: SourceLocator,
    pub staging: Option<Utf8PathBuf>,
    pub final_path: Utf8PathBuf,
    pub index_selector: Utf8PathBuf,
}

/// Four parallel columns of equal length: source, staging, final and index selector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateSet {
    sources: Vec<SourceLocator>,
    staging: Vec<Option<Utf8PathBuf>>,
    finals: Vec<Utf8PathBuf>,
    index_selectors: Vec<Utf8PathBuf>,
}

impl CandidateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(
        sources: Vec<SourceLocator>,
        staging: Vec<Option<Utf8PathBuf>>,
        finals: Vec<Utf8PathBuf>,
        index_selectors: Vec<Utf8PathBuf>,
    ) -> Result<Self, NimbusError> {
        let n = sources.len();
        if staging.len() != n || finals.len() != n || index_selectors.len() != n {
            return Err(NimbusError::RaggedCandidates(format!(
                "sources={n}, staging={}, finals={}, index={}",
                staging.len(),
                finals.len(),
                index_selectors.len()
            )));
        }
        Ok(Self {
            sources,
            staging,
            finals,
            index_selectors,
        })
    }

    pub fn push(&mut self, candidate: Candidate) {
        self.sources.push(candidate.source);
        self.staging.push(candidate.staging);
        self.finals.push(candidate.final_path);
        self.index_selectors.push(candidate.index_selector);
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn sources(&self) -> &[SourceLocator] {
        &self.sources
    }

    pub fn index_selectors(&self) -> &[Utf8PathBuf] {
        &self.index_selectors
    }

    pub fn into_parts(
        self,
    ) -> (
        Vec<SourceLocator>,
        Vec<Option<Utf8PathBuf>>,
        Vec<Utf8PathBuf>,
        Vec<Utf8PathBuf>,
    ) {
        (self.sources, self.staging, self.finals, self.index_selectors)
    }

    pub fn into_candidates(self) -> impl Iterator<Item = Candidate> {
        self.sources
            .into_iter()
            .zip(self.staging)
            .zip(self.finals)
            .zip(self.index_selectors)
            .map(|(((source, staging), final_path), index_selector)| Candidate {
                source,
                staging,
                final_path,
                index_selector,
            })
    }
}

impl FromIterator<Candidate> for CandidateSet {
    fn from_iter<T: IntoIterator<Item = Candidate>>(iter: T) -> Self {
        let mut set = CandidateSet::new();
        for candidate in iter {
            set.push(candidate);
        }
        set
    }
}

/// Computes the artifacts implied by a time window for one product.
///
/// Paths may be relative (joined onto the configured roots) or absolute (must
/// already lie under them). Staging entries must be `None` when the manager has
/// no staging root.
pub trait FilenamePlanner: Send + Sync {
    fn plan(&self, window: &TimeWindow) -> Result<CandidateSet, NimbusError>;
}

/// Turns a fetched file into its final artifact and describes it.
pub trait PostFetchProcessor: Send + Sync {
    fn process(
        &self,
        source: &SourceLocator,
        staging: Option<&Utf8Path>,
        final_path: &Utf8Path,
    ) -> Result<MetadataRecord, NimbusError>;
}

/// Everything the manager needs to know about one data product.
pub trait Product: FilenamePlanner + PostFetchProcessor {
    fn schema(&self) -> FieldSchema {
        FieldSchema::core()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn ragged_columns_are_rejected() {
        let err = CandidateSet::from_parts(
            vec!["https://a/1".parse().unwrap()],
            vec![None],
            vec![],
            vec!["2022_06.jsonl".into()],
        )
        .unwrap_err();
        assert_matches!(err, NimbusError::RaggedCandidates(_));
    }

    #[test]
    fn push_and_iterate_keep_rows_aligned() {
        let set: CandidateSet = (0..3)
            .map(|i| Candidate {
                source: format!("https://a/{i}").parse().unwrap(),
                staging: (i % 2 == 0).then(|| Utf8PathBuf::from(format!("buf/{i}"))),
                final_path: Utf8PathBuf::from(format!("out/{i}.nc")),
                index_selector: "2022_06.jsonl".into(),
            })
            .collect();
        assert_eq!(set.len(), 3);
        let rows = set.into_candidates().collect::<Vec<_>>();
        assert_eq!(rows[1].source.as_str(), "https://a/1");
        assert_eq!(rows[1].staging, None);
        assert_eq!(rows[2].final_path, Utf8PathBuf::from("out/2.nc"));
    }
}
