//! In-process document client.
//!
//! Clients opened with the same name share one dataset for the lifetime of
//! the process, so two handles opened from `memory://orders` see each
//! other's writes just like two connections to one database would.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;

use super::client::{
    DocumentApi, DocumentClientError, DocumentStream, StoredDocument, StoredRevision,
};

static REGISTRY: LazyLock<Mutex<HashMap<String, Arc<Mutex<MemoryState>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

#[derive(Debug, Default)]
struct MemoryState {
    documents: BTreeMap<String, StoredDocument>,
    revisions: HashMap<String, BTreeMap<u64, StoredRevision>>,
    unavailable: bool,
}

/// A [`DocumentApi`] backed by process memory.
#[derive(Debug, Clone)]
pub struct MemoryDocumentClient {
    name: String,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDocumentClient {
    /// Returns the client for the dataset called `name`, creating it on
    /// first use.
    pub fn named(name: &str) -> Self {
        let state = REGISTRY
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone();
        Self {
            name: name.to_string(),
            state,
        }
    }

    /// Returns the dataset name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes every call fail with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Returns the number of stored documents, tombstones included.
    pub fn document_count(&self) -> usize {
        self.state.lock().documents.len()
    }

    fn ensure_available(state: &MemoryState) -> Result<(), DocumentClientError> {
        if state.unavailable {
            return Err(DocumentClientError::Unavailable(
                "memory dataset marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentApi for MemoryDocumentClient {
    fn client_name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<(), DocumentClientError> {
        Self::ensure_available(&self.state.lock())
    }

    async fn insert_if_absent(&self, doc: &StoredDocument) -> Result<(), DocumentClientError> {
        let mut state = self.state.lock();
        Self::ensure_available(&state)?;
        if state.documents.contains_key(&doc.key) {
            return Err(DocumentClientError::Duplicate);
        }
        state.documents.insert(doc.key.clone(), doc.clone());
        Ok(())
    }

    async fn replace_if_version(
        &self,
        doc: &StoredDocument,
        expected_version: u64,
    ) -> Result<(), DocumentClientError> {
        let mut state = self.state.lock();
        Self::ensure_available(&state)?;
        match state.documents.get_mut(&doc.key) {
            Some(existing) if existing.version == expected_version => {
                *existing = doc.clone();
                Ok(())
            }
            _ => Err(DocumentClientError::PreconditionFailed),
        }
    }

    async fn find_one(&self, key: &str) -> Result<Option<StoredDocument>, DocumentClientError> {
        let state = self.state.lock();
        Self::ensure_available(&state)?;
        Ok(state.documents.get(key).cloned())
    }

    async fn find(&self, partition_key: Option<&str>) -> Result<DocumentStream, DocumentClientError> {
        let snapshot: Vec<StoredDocument> = {
            let state = self.state.lock();
            Self::ensure_available(&state)?;
            state
                .documents
                .values()
                .filter(|doc| partition_key.is_none_or(|pk| doc.partition_key == pk))
                .cloned()
                .collect()
        };
        Ok(stream::iter(snapshot.into_iter().map(Ok)).boxed())
    }

    async fn append_revision(&self, revision: &StoredRevision) -> Result<(), DocumentClientError> {
        let mut state = self.state.lock();
        Self::ensure_available(&state)?;
        let entries = state.revisions.entry(revision.entity_key.clone()).or_default();
        if entries.contains_key(&revision.version) {
            return Err(DocumentClientError::Duplicate);
        }
        entries.insert(revision.version, revision.clone());
        Ok(())
    }

    async fn revisions(&self, entity_key: &str) -> Result<Vec<StoredRevision>, DocumentClientError> {
        let state = self.state.lock();
        Self::ensure_available(&state)?;
        Ok(state
            .revisions
            .get(entity_key)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default())
    }
}
