//! In-memory shards with optional JSON persistence of committed state.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, Result};
use crate::shard::searcher::Searcher;
use crate::shard::{
    IndexedDocument, SearchSpec, ShardIndex, ShardIndexFactory, ShardReader, TopDocs,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub doc_id: u32,
    pub doc: IndexedDocument,
}

/// Documents visible to one reader, ordered by doc id.
#[derive(Debug, Default)]
struct Snapshot {
    docs: Vec<Arc<StoredDocument>>,
}

impl Snapshot {
    fn from_docs(mut docs: Vec<Arc<StoredDocument>>) -> Self {
        docs.sort_by_key(|d| d.doc_id);
        Self { docs }
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedShard {
    next_doc_id: u32,
    documents: Vec<StoredDocument>,
}

#[derive(Debug, Default)]
struct ShardState {
    next_doc_id: u32,
    /// Writer view, keyed by unique id.
    live: BTreeMap<String, Arc<StoredDocument>>,
    flushed: Arc<Snapshot>,
    committed: Arc<Snapshot>,
}

impl ShardState {
    fn live_snapshot(&self) -> Snapshot {
        Snapshot::from_docs(self.live.values().cloned().collect())
    }
}

/// A shard held in memory.
///
/// Mutations land in the writer view. `flush` publishes it to realtime
/// readers and `commit` to every reader; with a path, commit also writes the
/// state to disk and opening reloads it.
#[derive(Debug)]
pub struct MemoryShardIndex {
    index_name: String,
    segment_number: u32,
    path: Option<PathBuf>,
    open: AtomicBool,
    state: RwLock<ShardState>,
}

impl MemoryShardIndex {
    pub fn new(index_name: impl Into<String>, segment_number: u32) -> Self {
        Self {
            index_name: index_name.into(),
            segment_number,
            path: None,
            open: AtomicBool::new(true),
            state: RwLock::new(ShardState::default()),
        }
    }

    /// Opens a persistent shard, loading any state committed at `path`.
    pub fn open_at(
        index_name: impl Into<String>,
        segment_number: u32,
        path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let mut shard = Self::new(index_name, segment_number);
        let path = path.into();
        if path.exists() {
            let persisted: PersistedShard = serde_json::from_slice(&fs::read(&path)?)?;
            let docs: Vec<Arc<StoredDocument>> =
                persisted.documents.into_iter().map(Arc::new).collect();
            let state = shard.state.get_mut();
            state.next_doc_id = persisted.next_doc_id;
            state.live = docs
                .iter()
                .map(|d| (d.doc.unique_id.clone(), d.clone()))
                .collect();
            let snapshot = Arc::new(Snapshot::from_docs(docs));
            state.flushed = snapshot.clone();
            state.committed = snapshot;
            debug!(
                "Loaded {} documents for segment {} of index {}",
                state.live.len(),
                segment_number,
                shard.index_name
            );
        }
        shard.path = Some(path);
        Ok(shard)
    }

    pub fn reopen(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(ClusterError::index(format!(
                "Segment {} of index {} is closed",
                self.segment_number, self.index_name
            )))
        }
    }

    fn persist(path: &Path, state: &ShardState) -> Result<()> {
        let persisted = PersistedShard {
            next_doc_id: state.next_doc_id,
            documents: state.committed.docs.iter().map(|d| (**d).clone()).collect(),
        };
        let dir = path
            .parent()
            .ok_or_else(|| ClusterError::internal(format!("No parent for {}", path.display())))?;
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&serde_json::to_vec(&persisted)?)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl ShardIndex for MemoryShardIndex {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn update_document(&self, document: IndexedDocument) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.write();
        let doc_id = state.next_doc_id;
        state.next_doc_id += 1;
        state.live.insert(
            document.unique_id.clone(),
            Arc::new(StoredDocument {
                doc_id,
                doc: document,
            }),
        );
        Ok(())
    }

    fn delete_document(&self, unique_id: &str) -> Result<()> {
        self.ensure_open()?;
        self.state.write().live.remove(unique_id);
        Ok(())
    }

    fn delete_all(&self) -> Result<()> {
        self.ensure_open()?;
        self.state.write().live.clear();
        Ok(())
    }

    fn flush(&self, apply_deletes: bool) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.write();
        let mut docs: Vec<Arc<StoredDocument>> = state.live.values().cloned().collect();
        if !apply_deletes {
            // deleted documents stay visible to realtime readers until commit
            docs.extend(
                state
                    .flushed
                    .docs
                    .iter()
                    .filter(|d| !state.live.contains_key(&d.doc.unique_id))
                    .cloned(),
            );
        }
        state.flushed = Arc::new(Snapshot::from_docs(docs));
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.write();
        let snapshot = Arc::new(state.live_snapshot());
        state.flushed = snapshot.clone();
        state.committed = snapshot;
        if let Some(path) = &self.path {
            Self::persist(path, &state)?;
        }
        Ok(())
    }

    fn force_merge(&self, _max_segments: usize) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.write();
        let mut docs: Vec<Arc<StoredDocument>> = state.live.values().cloned().collect();
        docs.sort_by_key(|d| d.doc_id);
        let live = docs
            .into_iter()
            .enumerate()
            .map(|(i, d)| {
                (
                    d.doc.unique_id.clone(),
                    Arc::new(StoredDocument {
                        doc_id: i as u32,
                        doc: d.doc.clone(),
                    }),
                )
            })
            .collect::<BTreeMap<_, _>>();
        state.next_doc_id = live.len() as u32;
        state.live = live;
        Ok(())
    }

    fn reader(&self, real_time: bool) -> Result<Arc<dyn ShardReader>> {
        self.ensure_open()?;
        let state = self.state.read();
        let snapshot = if real_time {
            state.flushed.clone()
        } else {
            state.committed.clone()
        };
        Ok(Arc::new(SnapshotReader { snapshot }))
    }

    fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct SnapshotReader {
    snapshot: Arc<Snapshot>,
}

impl ShardReader for SnapshotReader {
    fn num_docs(&self) -> u64 {
        self.snapshot.docs.len() as u64
    }

    fn field_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for stored in &self.snapshot.docs {
            let doc = &stored.doc;
            names.extend(doc.terms.keys().cloned());
            names.extend(doc.numbers.keys().cloned());
            names.extend(doc.sort_values.keys().cloned());
        }
        names
    }

    fn terms(&self, field: &str, start: &str) -> Vec<(String, u64)> {
        let mut terms: BTreeMap<&str, u64> = BTreeMap::new();
        for stored in &self.snapshot.docs {
            if let Some(tokens) = stored.doc.terms.get(field) {
                let unique: BTreeSet<&str> = tokens.iter().map(String::as_str).collect();
                for token in unique {
                    *terms.entry(token).or_insert(0) += 1;
                }
            }
        }
        terms
            .range(start..)
            .map(|(term, df)| (term.to_string(), *df))
            .collect()
    }

    fn search(&self, spec: &SearchSpec<'_>) -> Result<TopDocs> {
        Ok(Searcher::new(&self.snapshot.docs, &spec.query.query).search(spec))
    }
}

/// Hands out one shared [`MemoryShardIndex`] per (index, segment).
///
/// Members that share a factory share shard state, so a segment moved to
/// another member keeps its committed documents. With a root directory,
/// shards persist under `<root>/<index>/segment_<n>.json`.
#[derive(Debug, Default)]
pub struct MemoryShardFactory {
    root: Option<PathBuf>,
    shards: Mutex<HashMap<(String, u32), Arc<MemoryShardIndex>>>,
}

impl MemoryShardFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            shards: Mutex::new(HashMap::new()),
        }
    }

    /// The shard instance, if it was ever opened.
    pub fn shard(&self, index_name: &str, segment_number: u32) -> Option<Arc<MemoryShardIndex>> {
        self.shards
            .lock()
            .get(&(index_name.to_string(), segment_number))
            .cloned()
    }

    fn shard_path(&self, index_name: &str, segment_number: u32) -> Option<PathBuf> {
        self.root
            .as_ref()
            .map(|root| root.join(index_name).join(format!("segment_{}.json", segment_number)))
    }
}

impl ShardIndexFactory for MemoryShardFactory {
    fn open(&self, index_name: &str, segment_number: u32) -> Result<Arc<dyn ShardIndex>> {
        let mut shards = self.shards.lock();
        let key = (index_name.to_string(), segment_number);
        if let Some(shard) = shards.get(&key) {
            shard.reopen();
            return Ok(shard.clone());
        }

        let shard = match self.shard_path(index_name, segment_number) {
            Some(path) => MemoryShardIndex::open_at(index_name, segment_number, path)?,
            None => MemoryShardIndex::new(index_name, segment_number),
        };
        let shard = Arc::new(shard);
        shards.insert(key, shard.clone());
        Ok(shard)
    }

    fn delete_index(&self, index_name: &str) -> Result<()> {
        self.shards.lock().retain(|(name, _), shard| {
            if name == index_name {
                shard.open.store(false, Ordering::SeqCst);
                false
            } else {
                true
            }
        });
        if let Some(root) = &self.root {
            let dir = root.join(index_name);
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
        }
        info!("Deleted shard storage for index {}", index_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Query, QueryWithFilters};

    fn indexed(unique_id: &str, body: &str) -> IndexedDocument {
        let mut doc = IndexedDocument {
            unique_id: unique_id.to_string(),
            ..Default::default()
        };
        doc.terms.insert(
            "body".into(),
            body.split_whitespace().map(str::to_string).collect(),
        );
        doc
    }

    fn hits(shard: &MemoryShardIndex, real_time: bool) -> u64 {
        let qwf = QueryWithFilters::new(Query::MatchAll);
        let spec = SearchSpec {
            query: &qwf,
            top_n: 100,
            after: None,
            sort: &[],
            count_requests: &[],
        };
        shard.reader(real_time).unwrap().search(&spec).unwrap().total_hits
    }

    #[test]
    fn test_visibility_of_flush_and_commit() {
        let shard = MemoryShardIndex::new("docs", 0);
        shard.update_document(indexed("a", "x")).unwrap();
        assert_eq!(hits(&shard, true), 0);

        shard.flush(true).unwrap();
        assert_eq!(hits(&shard, true), 1);
        assert_eq!(hits(&shard, false), 0);

        shard.commit().unwrap();
        assert_eq!(hits(&shard, false), 1);
    }

    #[test]
    fn test_update_replaces_by_unique_id() {
        let shard = MemoryShardIndex::new("docs", 0);
        shard.update_document(indexed("a", "old")).unwrap();
        shard.update_document(indexed("a", "new words")).unwrap();
        shard.commit().unwrap();

        let reader = shard.reader(false).unwrap();
        assert_eq!(reader.num_docs(), 1);
        assert!(reader.terms("body", "").iter().all(|(t, _)| t != "old"));
    }

    #[test]
    fn test_uncommitted_deletes_stay_visible_when_not_applied() {
        let shard = MemoryShardIndex::new("docs", 0);
        shard.update_document(indexed("a", "x")).unwrap();
        shard.update_document(indexed("b", "y")).unwrap();
        shard.flush(true).unwrap();

        shard.delete_document("a").unwrap();
        shard.flush(false).unwrap();
        assert_eq!(hits(&shard, true), 2);

        shard.flush(true).unwrap();
        assert_eq!(hits(&shard, true), 1);
    }

    #[test]
    fn test_terms_from_start_term() {
        let shard = MemoryShardIndex::new("docs", 0);
        shard.update_document(indexed("a", "apple banana banana")).unwrap();
        shard.update_document(indexed("b", "banana cherry")).unwrap();
        shard.commit().unwrap();

        let reader = shard.reader(false).unwrap();
        assert_eq!(
            reader.terms("body", "b"),
            vec![("banana".to_string(), 2), ("cherry".to_string(), 1)]
        );
        assert_eq!(
            reader.field_names().into_iter().collect::<Vec<_>>(),
            vec!["body".to_string()]
        );
    }

    #[test]
    fn test_closed_shard_rejects_writes_until_reopened() {
        let factory = MemoryShardFactory::new();
        let shard = factory.open("docs", 1).unwrap();
        shard.close().unwrap();
        assert!(shard.update_document(indexed("a", "x")).is_err());

        let reopened = factory.open("docs", 1).unwrap();
        assert!(reopened.is_open());
        assert!(shard.is_open());
    }

    #[test]
    fn test_persisted_commit_survives_reload() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let factory = MemoryShardFactory::with_root(dir.path());
            let shard = factory.open("docs", 0).unwrap();
            shard.update_document(indexed("a", "kept")).unwrap();
            shard.commit().unwrap();
            shard.update_document(indexed("b", "lost")).unwrap();
        }

        let factory = MemoryShardFactory::with_root(dir.path());
        let shard = factory.open("docs", 0).unwrap();
        assert_eq!(shard.reader(false).unwrap().num_docs(), 1);

        factory.delete_index("docs").unwrap();
        assert!(!dir.path().join("docs").exists());
    }
}
