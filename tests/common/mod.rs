#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::{self, Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use nimbus_fetch::domain::{Credentials, DataKind, ProductName, SourceLocator, TimeWindow};
use nimbus_fetch::error::{FetchError, NimbusError};
use nimbus_fetch::planner::{Candidate, CandidateSet, FilenamePlanner, PostFetchProcessor, Product};
use nimbus_fetch::products::StoreAsIs;
use nimbus_fetch::record::MetadataRecord;
use nimbus_fetch::transport::{RemotePayload, RemoteSource};

#[derive(Debug, Clone)]
pub enum Reply {
    Body(Vec<u8>),
    NotFound,
    Status(u16),
    /// Declares `declared` bytes but delivers `body`.
    Short { declared: u64, body: Vec<u8> },
    /// Delivers `body` then fails mid-stream.
    Broken(Vec<u8>),
    NoLength(Vec<u8>),
}

#[derive(Default)]
struct SourceState {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<HashMap<String, usize>>,
    credentials: Mutex<Vec<Option<String>>>,
}

/// Replies per locator in order; the last reply repeats. Unscripted locators are 404.
#[derive(Clone, Default)]
pub struct ScriptedSource {
    state: Arc<SourceState>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, locator: &str, replies: Vec<Reply>) -> Self {
        self.state
            .scripts
            .lock()
            .unwrap()
            .insert(locator.to_string(), replies.into());
        self
    }

    pub fn calls(&self, locator: &str) -> usize {
        self.state
            .calls
            .lock()
            .unwrap()
            .get(locator)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.state.calls.lock().unwrap().values().sum()
    }

    pub fn seen_users(&self) -> Vec<Option<String>> {
        self.state.credentials.lock().unwrap().clone()
    }
}

impl RemoteSource for ScriptedSource {
    fn open(
        &self,
        locator: &SourceLocator,
        credentials: Option<&Credentials>,
    ) -> Result<RemotePayload, FetchError> {
        *self
            .state
            .calls
            .lock()
            .unwrap()
            .entry(locator.to_string())
            .or_default() += 1;
        self.state
            .credentials
            .lock()
            .unwrap()
            .push(credentials.map(|c| c.user().to_string()));

        let reply = {
            let mut scripts = self.state.scripts.lock().unwrap();
            match scripts.get_mut(locator.as_str()) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };
        match reply.unwrap_or(Reply::NotFound) {
            Reply::Body(body) => Ok(RemotePayload::new(
                Some(body.len() as u64),
                Cursor::new(body),
            )),
            Reply::NotFound => Err(FetchError::NotFound(locator.to_string())),
            Reply::Status(status) => Err(FetchError::Status {
                status,
                locator: locator.to_string(),
            }),
            Reply::Short { declared, body } => {
                Ok(RemotePayload::new(Some(declared), Cursor::new(body)))
            }
            Reply::Broken(body) => Ok(RemotePayload::new(
                Some(body.len() as u64 + 16),
                BrokenReader { body, pos: 0 },
            )),
            Reply::NoLength(body) => Ok(RemotePayload::new(None, Cursor::new(body))),
        }
    }
}

struct BrokenReader {
    body: Vec<u8>,
    pos: usize,
}

impl Read for BrokenReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.body.len() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            ));
        }
        let n = buf.len().min(self.body.len() - self.pos);
        buf[..n].copy_from_slice(&self.body[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Plans a fixed list of candidates and stores fetched files as they are.
#[derive(Clone)]
pub struct FixedProduct {
    candidates: Vec<Candidate>,
    processed: Arc<AtomicUsize>,
}

impl FixedProduct {
    pub fn new(candidates: Vec<Candidate>) -> Self {
        Self {
            candidates,
            processed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }
}

impl FilenamePlanner for FixedProduct {
    fn plan(&self, _window: &TimeWindow) -> Result<CandidateSet, NimbusError> {
        Ok(self.candidates.iter().cloned().collect())
    }
}

impl PostFetchProcessor for FixedProduct {
    fn process(
        &self,
        source: &SourceLocator,
        staging: Option<&Utf8Path>,
        final_path: &Utf8Path,
    ) -> Result<MetadataRecord, NimbusError> {
        self.processed.fetch_add(1, Ordering::SeqCst);
        StoreAsIs {
            product: ProductName::Goes,
            kind: DataKind::Observation,
        }
        .process(source, staging, final_path)
    }
}

impl Product for FixedProduct {}

/// `name` fetched through `staging/<name>` into `<name>.nc`, indexed in June 2022.
pub fn staged(name: &str) -> Candidate {
    Candidate {
        source: format!("https://mock.example/{name}").parse().unwrap(),
        staging: Some(Utf8PathBuf::from(name)),
        final_path: Utf8PathBuf::from(format!("2022_06/{name}.nc")),
        index_selector: Utf8PathBuf::from("2022_06.jsonl"),
    }
}

pub fn utf8_dir(dir: &TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
}
