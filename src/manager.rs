//! The per-member entry point to the cluster.
//!
//! [`IndexManager`] keeps the registry of loaded indexes behind one
//! shared/exclusive gate. Lifecycle and membership changes hold it
//! exclusively; requests hold it shared. Every request is routed through
//! the segment ownership map to local [`SegmentEngine`](crate::segment::SegmentEngine)s
//! or, through the [`RequestFederator`], to the members owning the rest.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use crossbeam_channel::{RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::catalog::{IndexCatalog, MemoryCatalog};
use crate::cluster::{
    BalancePolicy, EvenBalancePolicy, InProcessCluster, InternalClient, MemberId, Membership,
    RequestFederator, ShardOwnershipMap,
};
use crate::combiner::ResultCombiner;
use crate::config::{IndexConfig, IndexSettings, ManagerConfig};
use crate::error::{ClusterError, Result};
use crate::index::ShardedIndex;
use crate::request::{DeleteRequest, GetTermsRequest, QueryRequest, StoreRequest};
use crate::response::{
    GetMembersResponse, GetNumberOfDocsResponse, GetTermsResponse, InternalQueryResponse,
    MergedResult, Term,
};
use crate::shard::{MemoryShardFactory, ShardIndexFactory};

type Registry = HashMap<String, Arc<ShardedIndex>>;

struct IdleCommitter {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct IndexManager {
    local: MemberId,
    config: ManagerConfig,
    gate: RwLock<Registry>,
    membership: Arc<dyn Membership>,
    client: Arc<dyn InternalClient>,
    federator: RequestFederator,
    factory: Arc<dyn ShardIndexFactory>,
    catalog: Arc<dyn IndexCatalog>,
    balance_policy: Arc<dyn BalancePolicy>,
    shut_down: AtomicBool,
    idle_committer: Mutex<Option<IdleCommitter>>,
}

pub struct IndexManagerBuilder {
    membership: Arc<dyn Membership>,
    config: ManagerConfig,
    client: Option<Arc<dyn InternalClient>>,
    factory: Option<Arc<dyn ShardIndexFactory>>,
    catalog: Option<Arc<dyn IndexCatalog>>,
    balance_policy: Arc<dyn BalancePolicy>,
}

impl IndexManagerBuilder {
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn client(mut self, client: Arc<dyn InternalClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn shard_factory(mut self, factory: Arc<dyn ShardIndexFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn catalog(mut self, catalog: Arc<dyn IndexCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn balance_policy(mut self, policy: Arc<dyn BalancePolicy>) -> Self {
        self.balance_policy = policy;
        self
    }

    pub fn build(self) -> Result<Arc<IndexManager>> {
        let local = self.membership.local_member().clone();
        let federator = RequestFederator::new(local.clone(), self.config.worker_threads)?;
        let client: Arc<dyn InternalClient> = match self.client {
            Some(client) => client,
            None => Arc::new(InProcessCluster::new().client()),
        };
        let factory: Arc<dyn ShardIndexFactory> = match self.factory {
            Some(factory) => factory,
            None => Arc::new(MemoryShardFactory::new()),
        };
        let catalog: Arc<dyn IndexCatalog> = match self.catalog {
            Some(catalog) => catalog,
            None => Arc::new(MemoryCatalog::new()),
        };

        for member in self.membership.members() {
            if member != local {
                client.add_member(&member);
            }
        }

        info!(
            "Starting index manager on <{}> with {} federation threads",
            local, self.config.worker_threads
        );
        Ok(Arc::new(IndexManager {
            local,
            config: self.config,
            gate: RwLock::new(HashMap::new()),
            membership: self.membership,
            client,
            federator,
            factory,
            catalog,
            balance_policy: self.balance_policy,
            shut_down: AtomicBool::new(false),
            idle_committer: Mutex::new(None),
        }))
    }
}

impl IndexManager {
    /// Starts a builder for the manager of the local member of `membership`.
    pub fn builder(membership: Arc<dyn Membership>) -> IndexManagerBuilder {
        IndexManagerBuilder {
            membership,
            config: ManagerConfig::default(),
            client: None,
            factory: None,
            catalog: None,
            balance_policy: Arc::new(EvenBalancePolicy),
        }
    }

    pub fn local_member(&self) -> &MemberId {
        &self.local
    }

    fn check_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ClusterError::internal(format!(
                "Index manager on <{}> is shut down",
                self.local
            )));
        }
        Ok(())
    }

    fn get_index(registry: &Registry, index_name: &str) -> Result<Arc<ShardedIndex>> {
        registry
            .get(index_name)
            .cloned()
            .ok_or_else(|| ClusterError::index_not_found(index_name))
    }

    /// Runs `f` against every other member, logging failures.
    fn broadcast<F>(&self, members: &BTreeSet<MemberId>, action: &str, f: F)
    where
        F: Fn(&MemberId) -> Result<()>,
    {
        for member in members.iter().filter(|m| **m != self.local) {
            if let Err(e) = f(member) {
                error!("Failed to {} on member <{}>: {}", action, member, e);
            }
        }
    }

    /// Creates an index, balances its segments over the current members and
    /// sends the resulting map to every other member.
    ///
    /// Fails with [`ClusterError::AlreadyExists`] when the name is loaded or
    /// present in the catalog.
    pub fn create_index(&self, config: IndexConfig) -> Result<()> {
        self.check_running()?;
        let mut registry = self.gate.write();
        let index_name = config.index_name.clone();
        if registry.contains_key(&index_name) || self.catalog.load(&index_name)?.is_some() {
            return Err(ClusterError::already_exists(index_name));
        }

        let index = Arc::new(ShardedIndex::create(
            config,
            self.local.clone(),
            self.factory.clone(),
            self.catalog.clone(),
        )?);
        let members = self.membership.members();
        let map = self.balance_policy.balance(&index.ownership(), &members)?;
        index.update_segment_map(&map)?;
        registry.insert(index_name.clone(), index);

        self.broadcast(&members, "send segment map", |member| {
            self.client.update_segment_map(member, &index_name, &map)
        });
        Ok(())
    }

    /// Loads an index from the catalog with the ownership every member derives
    /// from the current member set.
    pub fn load_index(&self, index_name: &str) -> Result<()> {
        self.check_running()?;
        let mut registry = self.gate.write();
        if registry.contains_key(index_name) {
            return Ok(());
        }
        let index = Arc::new(ShardedIndex::load(
            index_name,
            self.local.clone(),
            self.factory.clone(),
            self.catalog.clone(),
        )?);
        let map = self
            .balance_policy
            .balance(&index.ownership(), &self.membership.members())?;
        index.update_segment_map(&map)?;
        registry.insert(index_name.to_string(), index);
        Ok(())
    }

    /// Loads every index in the catalog. Failures are logged and skipped.
    pub fn load_indexes(&self) -> Result<Vec<String>> {
        let mut loaded = Vec::new();
        for index_name in self.catalog.index_names()? {
            match self.load_index(&index_name) {
                Ok(()) => loaded.push(index_name),
                Err(e) => error!("Failed to load index <{}>: {}", index_name, e),
            }
        }
        Ok(loaded)
    }

    /// Closes the local segments of an index and forgets it.
    pub fn unload_index(&self, index_name: &str) -> Result<()> {
        let mut registry = self.gate.write();
        let index = registry
            .remove(index_name)
            .ok_or_else(|| ClusterError::index_not_found(index_name))?;
        index.unload()
    }

    /// Releases the index on every member, then removes its stored state.
    pub fn delete_index(&self, index_name: &str) -> Result<()> {
        self.check_running()?;
        let mut registry = self.gate.write();
        let index = registry
            .remove(index_name)
            .ok_or_else(|| ClusterError::index_not_found(index_name))?;

        info!("Deleting index <{}>", index_name);
        let members = self.membership.members();
        self.broadcast(&members, "unload index", |member| {
            self.client.unload_index(member, index_name)
        });
        if let Err(e) = index.unload() {
            error!("Failed to unload index <{}> before delete: {}", index_name, e);
        }
        index.delete_storage()
    }

    /// Saves new settings, then has every member rebuild its segments with them.
    pub fn update_index_settings(&self, index_name: &str, settings: IndexSettings) -> Result<()> {
        self.check_running()?;
        let registry = self.gate.read_recursive();
        let index = Self::get_index(&registry, index_name)?;
        index.update_settings(settings)?;
        index.reload_settings()?;

        self.broadcast(&self.membership.members(), "reload index settings", |member| {
            self.client.reload_index_settings(member, index_name)
        });
        Ok(())
    }

    /// Rebuilds the local segments of an index from its stored settings.
    pub fn reload_index_settings(&self, index_name: &str) -> Result<()> {
        self.check_running()?;
        let registry = self.gate.read_recursive();
        Self::get_index(&registry, index_name)?.reload_settings()
    }

    /// Applies an ownership map sent by the master, loading the index if needed.
    pub fn update_segment_map(&self, index_name: &str, map: &ShardOwnershipMap) -> Result<()> {
        self.check_running()?;
        let mut registry = self.gate.write();
        let index = match registry.get(index_name) {
            Some(index) => index.clone(),
            None => {
                let index = Arc::new(ShardedIndex::load(
                    index_name,
                    self.local.clone(),
                    self.factory.clone(),
                    self.catalog.clone(),
                )?);
                registry.insert(index_name.to_string(), index.clone());
                index
            }
        };
        index.update_segment_map(map)
    }

    /// Stores a document on the member owning its segment.
    pub fn store(&self, request: &StoreRequest) -> Result<()> {
        self.check_running()?;
        let registry = self.gate.read_recursive();
        let index = Self::get_index(&registry, &request.index_name)?;
        let member = index.find_member(&request.unique_id)?;
        if member == self.local {
            index.store_internal(request)
        } else {
            debug!(
                "Forwarding store of <{}> in <{}> to <{}>",
                request.unique_id, request.index_name, member
            );
            self.client.execute_store(&member, request)
        }
    }

    /// Stores a document in a local segment.
    pub fn store_internal(&self, request: &StoreRequest) -> Result<()> {
        self.check_running()?;
        let registry = self.gate.read_recursive();
        Self::get_index(&registry, &request.index_name)?.store_internal(request)
    }

    /// Deletes a document on the member owning its segment.
    pub fn delete(&self, request: &DeleteRequest) -> Result<()> {
        self.check_running()?;
        let registry = self.gate.read_recursive();
        let index = Self::get_index(&registry, &request.index_name)?;
        let member = index.find_member(&request.unique_id)?;
        if member == self.local {
            index.delete_internal(&request.unique_id)
        } else {
            self.client.execute_delete(&member, request)
        }
    }

    /// Deletes a document from a local segment.
    pub fn delete_internal(&self, request: &DeleteRequest) -> Result<()> {
        self.check_running()?;
        let registry = self.gate.read_recursive();
        Self::get_index(&registry, &request.index_name)?.delete_internal(&request.unique_id)
    }

    /// Runs a query, retrying once with a full fetch when the merge may be short.
    pub fn query(&self, request: &QueryRequest) -> Result<MergedResult> {
        let (merged, is_short) = self.federated_query(request)?;
        if !is_short {
            return Ok(merged);
        }

        warn!(
            "Result for <{}> may be short, retrying with full fetch",
            request.query
        );
        let mut full = request.clone();
        full.fetch_full = true;
        let (merged, is_short) = self.federated_query(&full)?;
        if is_short {
            return Err(ClusterError::ShortResult(request.query.clone()));
        }
        Ok(merged)
    }

    fn federated_query(&self, request: &QueryRequest) -> Result<(MergedResult, bool)> {
        self.check_running()?;
        if request.indexes.is_empty() {
            return Err(ClusterError::invalid_argument("Query names no index"));
        }
        let registry = self.gate.read_recursive();
        let indexes = Self::resolve_indexes(&registry, &request.indexes)?;

        let configs: BTreeMap<String, Arc<IndexConfig>> = indexes
            .iter()
            .map(|(name, index)| (name.clone(), index.config()))
            .collect();
        let members: BTreeSet<MemberId> =
            indexes.values().flat_map(|index| index.members()).collect();

        let responses = self.federator.send(
            &members,
            request,
            |req| Self::query_local(&indexes, req),
            |member, req| self.client.execute_query(member, req),
        )?;
        ResultCombiner::new(request, &configs).combine(responses)
    }

    fn resolve_indexes(
        registry: &Registry,
        names: &[String],
    ) -> Result<BTreeMap<String, Arc<ShardedIndex>>> {
        names
            .iter()
            .map(|name| Ok((name.clone(), Self::get_index(registry, name)?)))
            .collect()
    }

    fn query_local(
        indexes: &BTreeMap<String, Arc<ShardedIndex>>,
        request: &QueryRequest,
    ) -> Result<InternalQueryResponse> {
        let index_segment_responses = indexes
            .values()
            .map(|index| index.query_internal(request))
            .collect::<Result<Vec<_>>>()?;
        Ok(InternalQueryResponse {
            index_segment_responses,
        })
    }

    /// The local part of a query sent by another member.
    pub fn internal_query(&self, request: &QueryRequest) -> Result<InternalQueryResponse> {
        self.check_running()?;
        let registry = self.gate.read_recursive();
        let indexes = Self::resolve_indexes(&registry, &request.indexes)?;
        Self::query_local(&indexes, request)
    }

    /// Document count summed over exactly one answer per segment.
    pub fn get_number_of_docs(
        &self,
        index_name: &str,
        real_time: bool,
    ) -> Result<GetNumberOfDocsResponse> {
        self.check_running()?;
        let registry = self.gate.read_recursive();
        let index = Self::get_index(&registry, index_name)?;
        let responses = self.federator.send(
            &index.members(),
            index_name,
            |_| index.get_number_of_docs(real_time),
            |member, name| self.client.get_number_of_docs(member, name, real_time),
        )?;

        let mut counts = BTreeMap::new();
        for count in responses.into_iter().flat_map(|r| r.segment_counts) {
            if counts.insert(count.segment_number, count).is_some() {
                return Err(ClusterError::inconsistent(format!(
                    "Segment <{}> is repeated for <{}>",
                    count.segment_number, index_name
                )));
            }
        }
        let number_of_segments = index.number_of_segments();
        if counts.len() != number_of_segments as usize {
            return Err(ClusterError::inconsistent(format!(
                "Found <{}> segment counts for <{}>, expected <{}>",
                counts.len(),
                index_name,
                number_of_segments
            )));
        }
        if let Some(missing) = (0..number_of_segments).find(|s| !counts.contains_key(s)) {
            return Err(ClusterError::inconsistent(format!(
                "Missing segment <{}> for <{}>",
                missing, index_name
            )));
        }

        let segment_counts: Vec<_> = counts.into_values().collect();
        Ok(GetNumberOfDocsResponse {
            number_of_docs: segment_counts.iter().map(|c| c.number_of_docs).sum(),
            segment_counts,
        })
    }

    /// Counts of the local segments only.
    pub fn get_number_of_docs_internal(
        &self,
        index_name: &str,
        real_time: bool,
    ) -> Result<GetNumberOfDocsResponse> {
        self.check_running()?;
        let registry = self.gate.read_recursive();
        Self::get_index(&registry, index_name)?.get_number_of_docs(real_time)
    }

    /// Union of the field names seen by every segment.
    pub fn get_field_names(&self, index_name: &str) -> Result<BTreeSet<String>> {
        self.check_running()?;
        let registry = self.gate.read_recursive();
        let index = Self::get_index(&registry, index_name)?;
        let responses = self.federator.send(
            &index.members(),
            index_name,
            |_| index.get_field_names(),
            |member, name| self.client.get_field_names(member, name),
        )?;
        Ok(responses.into_iter().flatten().collect())
    }

    pub fn get_field_names_internal(&self, index_name: &str) -> Result<BTreeSet<String>> {
        self.check_running()?;
        let registry = self.gate.read_recursive();
        Self::get_index(&registry, index_name)?.get_field_names()
    }

    /// Terms ascending with frequencies summed across segments.
    pub fn get_terms(&self, request: &GetTermsRequest) -> Result<GetTermsResponse> {
        self.check_running()?;
        let registry = self.gate.read_recursive();
        let index = Self::get_index(&registry, &request.index_name)?;
        let responses = self.federator.send(
            &index.members(),
            request,
            |req| index.get_terms(req),
            |member, req| self.client.get_terms(member, req),
        )?;

        let mut merged: BTreeMap<String, u64> = BTreeMap::new();
        for term in responses.into_iter().flat_map(|r| r.terms) {
            *merged.entry(term.value).or_default() += term.doc_freq;
        }

        let mut response = GetTermsResponse::default();
        for (value, doc_freq) in merged {
            if request.amount > 0 && response.terms.len() >= request.amount {
                break;
            }
            let term = Term { value, doc_freq };
            if doc_freq >= request.min_doc_freq {
                response.terms.push(term.clone());
            }
            response.last_term = Some(term);
        }
        Ok(response)
    }

    pub fn get_terms_internal(&self, request: &GetTermsRequest) -> Result<GetTermsResponse> {
        self.check_running()?;
        let registry = self.gate.read_recursive();
        Self::get_index(&registry, &request.index_name)?.get_terms(request)
    }

    /// Removes every document from every segment of an index.
    pub fn clear(&self, index_name: &str) -> Result<()> {
        self.check_running()?;
        let registry = self.gate.read_recursive();
        let index = Self::get_index(&registry, index_name)?;
        info!("Clearing index <{}>", index_name);
        self.federator.send(
            &index.members(),
            index_name,
            |_| index.clear(),
            |member, name| self.client.clear(member, name),
        )?;
        Ok(())
    }

    pub fn clear_internal(&self, index_name: &str) -> Result<()> {
        self.check_running()?;
        let registry = self.gate.read_recursive();
        Self::get_index(&registry, index_name)?.clear()
    }

    /// Merges the storage of every segment of an index.
    pub fn optimize(&self, index_name: &str) -> Result<()> {
        self.check_running()?;
        let registry = self.gate.read_recursive();
        let index = Self::get_index(&registry, index_name)?;
        info!("Optimizing index <{}>", index_name);
        self.federator.send(
            &index.members(),
            index_name,
            |_| index.optimize(),
            |member, name| self.client.optimize(member, name),
        )?;
        Ok(())
    }

    pub fn optimize_internal(&self, index_name: &str) -> Result<()> {
        self.check_running()?;
        let registry = self.gate.read_recursive();
        Self::get_index(&registry, index_name)?.optimize()
    }

    /// Names of the loaded indexes, sorted.
    pub fn get_indexes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.gate.read_recursive().keys().cloned().collect();
        names.sort();
        names
    }

    /// The current members and the segment map of every loaded index.
    pub fn get_members(&self) -> GetMembersResponse {
        let registry = self.gate.read_recursive();
        let mut index_mappings: Vec<_> = registry.values().map(|index| index.mapping()).collect();
        index_mappings.sort_by(|a, b| a.index_name.cmp(&b.index_name));
        GetMembersResponse {
            members: self.membership.members().into_iter().collect(),
            index_mappings,
        }
    }

    /// Opens a channel to a new member; the master also rebalances every index.
    pub fn handle_member_added(&self, member: &MemberId) -> Result<()> {
        self.check_running()?;
        let registry = self.gate.write();
        info!("Member <{}> joined", member);
        if member != &self.local {
            self.client.add_member(member);
        }
        if self.membership.is_master() {
            self.rebalance(&registry, |policy, current, members| {
                policy.member_added(current, members, member)
            });
        }
        Ok(())
    }

    /// Tears down the channel to a departed member; the master also reassigns its segments.
    pub fn handle_member_removed(&self, member: &MemberId) -> Result<()> {
        self.check_running()?;
        let registry = self.gate.write();
        info!("Member <{}> left", member);
        self.client.remove_member(member);
        if self.membership.is_master() {
            self.rebalance(&registry, |policy, current, members| {
                policy.member_removed(current, members, member)
            });
        }
        Ok(())
    }

    fn rebalance<F>(&self, registry: &Registry, f: F)
    where
        F: Fn(&dyn BalancePolicy, &ShardOwnershipMap, &BTreeSet<MemberId>) -> Result<ShardOwnershipMap>,
    {
        let members = self.membership.members();
        let mut names: Vec<&String> = registry.keys().collect();
        names.sort();
        for index_name in names {
            let index = &registry[index_name];
            let map = match f(self.balance_policy.as_ref(), &index.ownership(), &members) {
                Ok(map) => map,
                Err(e) => {
                    error!("Failed to rebalance index <{}>: {}", index_name, e);
                    continue;
                }
            };
            if let Err(e) = index.update_segment_map(&map) {
                error!("Failed to apply segment map of <{}>: {}", index_name, e);
            }
            self.broadcast(&members, "send segment map", |m| {
                self.client.update_segment_map(m, index_name, &map)
            });
        }
    }

    /// Commits segments whose changes sat idle past their idle time.
    pub fn commit_idle_segments(&self) -> usize {
        if self.check_running().is_err() {
            return 0;
        }
        let registry = self.gate.read_recursive();
        registry.values().map(|index| index.commit_idle()).sum()
    }

    /// Starts a thread running [`commit_idle_segments`](Self::commit_idle_segments) periodically.
    pub fn spawn_idle_committer(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.idle_committer.lock();
        if slot.is_some() {
            return Ok(());
        }

        let (stop, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let manager: Weak<IndexManager> = Arc::downgrade(self);
        let period = self.config.idle_commit_period();
        let handle = std::thread::Builder::new()
            .name(format!("idle-committer-{}", self.local))
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(period) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    let Some(manager) = manager.upgrade() else {
                        break;
                    };
                    let committed = manager.commit_idle_segments();
                    if committed > 0 {
                        debug!("Committed {} idle segments", committed);
                    }
                }
            })?;
        *slot = Some(IdleCommitter { stop, handle });
        Ok(())
    }

    fn stop_idle_committer(&self) {
        let Some(committer) = self.idle_committer.lock().take() else {
            return;
        };
        // the channel may already be full or disconnected
        let _ = committer.stop.try_send(());
        drop(committer.stop);
        if committer.handle.thread().id() != std::thread::current().id()
            && committer.handle.join().is_err()
        {
            error!("Idle committer thread panicked");
        }
    }

    /// Stops background work and unloads every index.
    ///
    /// Waits a bounded time for in-flight requests; past that, unloads anyway.
    /// When even a shared hold cannot be had in that time, indexes stay loaded.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down index manager on <{}>", self.local);
        self.stop_idle_committer();

        let wait = self.config.shutdown_wait();
        let indexes: Vec<Arc<ShardedIndex>> = match self.gate.try_write_for(wait) {
            Some(mut registry) => registry.drain().map(|(_, index)| index).collect(),
            None => {
                warn!(
                    "Failed to obtain the global gate within {:?}, unloading anyway",
                    wait
                );
                match self.gate.try_read_recursive_for(wait) {
                    Some(registry) => registry.values().cloned().collect(),
                    None => {
                        error!("Global gate still held after {:?}, skipping unload", wait * 2);
                        Vec::new()
                    }
                }
            }
        };
        self.federator.shutdown();

        for index in indexes {
            if let Err(e) = index.unload() {
                error!("Failed to unload index <{}>: {}", index.name(), e);
            }
        }
    }
}

impl Drop for IndexManager {
    fn drop(&mut self) {
        self.stop_idle_committer();
    }
}

impl std::fmt::Debug for IndexManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexManager")
            .field("local", &self.local)
            .field("indexes", &self.get_indexes())
            .field("shut_down", &self.shut_down.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalyzerKind;
    use crate::cluster::StaticMembership;
    use std::sync::atomic::AtomicUsize;

    use crate::config::{FieldConfig, SortType};
    use crate::data::Document;
    use crate::request::FieldSort;
    use crate::response::{IndexSegmentResponse, ScoredResult, ShardResult};

    fn manager() -> Arc<IndexManager> {
        IndexManager::builder(Arc::new(StaticMembership::new("solo".into())))
            .config(ManagerConfig {
                worker_threads: 2,
                ..Default::default()
            })
            .build()
            .unwrap()
    }

    fn config(name: &str) -> IndexConfig {
        IndexConfig::builder(name, 3, "id")
            .default_search_field("body")
            .add_field(
                FieldConfig::builder("body")
                    .index_as(AnalyzerKind::Standard)
                    .build(),
            )
            .segment_commit_interval(1)
            .segment_flush_interval(1)
            .build()
    }

    #[test]
    fn test_lifecycle() {
        let manager = manager();
        manager.create_index(config("docs")).unwrap();
        assert!(matches!(
            manager.create_index(config("docs")),
            Err(ClusterError::AlreadyExists(_))
        ));
        assert_eq!(manager.get_indexes(), vec!["docs"]);

        manager.unload_index("docs").unwrap();
        assert!(manager.get_indexes().is_empty());
        // still in the catalog
        assert!(matches!(
            manager.create_index(config("docs")),
            Err(ClusterError::AlreadyExists(_))
        ));

        manager.load_index("docs").unwrap();
        let members = manager.get_members();
        assert_eq!(members.index_mappings[0].segment_to_member.len(), 3);

        manager.delete_index("docs").unwrap();
        assert!(matches!(
            manager.load_index("docs"),
            Err(ClusterError::IndexNotFound(_))
        ));
        assert!(matches!(
            manager.unload_index("docs"),
            Err(ClusterError::IndexNotFound(_))
        ));
    }

    #[test]
    fn test_unknown_index_requests_fail() {
        let manager = manager();
        let request = QueryRequest::builder("x").index("missing").build();
        assert!(matches!(
            manager.query(&request),
            Err(ClusterError::IndexNotFound(_))
        ));
        let store = StoreRequest::new("missing", "a", Document::new());
        assert!(manager.store(&store).is_err());
        assert!(
            manager
                .query(&QueryRequest::builder("x").build())
                .is_err()
        );
    }

    #[test]
    fn test_store_query_and_shutdown() {
        let manager = manager();
        manager.create_index(config("docs")).unwrap();
        for (id, body) in [("1", "quick fox"), ("2", "lazy dog"), ("3", "quick dog")] {
            let document = Document::new().add_field("body", body);
            manager
                .store(&StoreRequest::new("docs", id, document))
                .unwrap();
        }

        let merged = manager
            .query(&QueryRequest::builder("quick").index("docs").build())
            .unwrap();
        assert_eq!(merged.total_hits, 2);
        let mut ids = merged.unique_ids();
        ids.sort();
        assert_eq!(ids, vec!["1", "3"]);

        assert_eq!(
            manager.get_number_of_docs("docs", false).unwrap().number_of_docs,
            3
        );

        manager.shutdown();
        assert!(manager.get_indexes().is_empty());
        assert!(manager.query(&QueryRequest::builder("quick").index("docs").build()).is_err());
    }

    #[test]
    fn test_idle_committer_commits_in_background() {
        let manager = IndexManager::builder(Arc::new(StaticMembership::new("solo".into())))
            .config(ManagerConfig {
                worker_threads: 1,
                idle_commit_period_secs: 1,
                ..Default::default()
            })
            .build()
            .unwrap();
        let config = IndexConfig::builder("docs", 1, "id")
            .segment_commit_interval(1000)
            .segment_flush_interval(1000)
            .idle_time_without_commit(0)
            .build();
        manager.create_index(config).unwrap();
        manager
            .store(&StoreRequest::new("docs", "a", Document::new()))
            .unwrap();
        assert_eq!(manager.get_number_of_docs("docs", false).unwrap().number_of_docs, 0);

        manager.spawn_idle_committer().unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while manager.get_number_of_docs("docs", false).unwrap().number_of_docs == 0 {
            assert!(std::time::Instant::now() < deadline, "idle commit never happened");
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        manager.shutdown();
    }

    #[test]
    fn test_underfilled_page_is_refetched_in_full() {
        let manager = IndexManager::builder(Arc::new(StaticMembership::new("solo".into())))
            .config(ManagerConfig {
                worker_threads: 2,
                ..Default::default()
            })
            .build()
            .unwrap();
        let config = IndexConfig::builder("docs", 2, "id")
            .add_field(
                FieldConfig::builder("rating")
                    .index_as(AnalyzerKind::NumericLong)
                    .sort_as(SortType::NumericLong)
                    .build(),
            )
            .request_factor(0.5)
            .segment_commit_interval(1)
            .segment_flush_interval(1)
            .build();
        manager.create_index(config).unwrap();

        // "b" routes to segment 0, the rest to segment 1
        let ratings = [("b", 100), ("a", 1), ("c", 2), ("e", 3), ("g", 4), ("i", 5), ("k", 6)];
        for (id, rating) in ratings {
            let document = Document::new().add_field("rating", rating);
            manager
                .store(&StoreRequest::new("docs", id, document))
                .unwrap();
        }

        let request = QueryRequest::builder("*:*")
            .index("docs")
            .sort(FieldSort::desc("rating"))
            .amount(4)
            .build();
        let (first, is_short) = manager.federated_query(&request).unwrap();
        assert_eq!(first.unique_ids(), vec!["b", "k", "i"]);
        assert!(is_short);

        let merged = manager.query(&request).unwrap();
        assert_eq!(merged.unique_ids(), vec!["b", "k", "i", "g"]);
        assert_eq!(merged.total_hits, 7);
    }

    /// Owns nothing locally; every segment belongs to "remote".
    #[derive(Debug)]
    struct RemoteOwnsAll;

    impl BalancePolicy for RemoteOwnsAll {
        fn balance(
            &self,
            current: &ShardOwnershipMap,
            _members: &BTreeSet<MemberId>,
        ) -> Result<ShardOwnershipMap> {
            let mut map = ShardOwnershipMap::new(current.number_of_segments());
            for segment in 0..current.number_of_segments() {
                map.assign(segment, "remote".into());
            }
            Ok(map)
        }
    }

    /// Answers every query with a page that always holds a better result back.
    #[derive(Debug, Default)]
    struct HoldingBackClient {
        queries: AtomicUsize,
    }

    impl InternalClient for HoldingBackClient {
        fn add_member(&self, _member: &MemberId) {}

        fn remove_member(&self, _member: &MemberId) {}

        fn execute_query(
            &self,
            _member: &MemberId,
            request: &QueryRequest,
        ) -> Result<InternalQueryResponse> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            let index_name = request.indexes[0].clone();
            let hit = |unique_id: &str, score: f32| ScoredResult {
                unique_id: unique_id.to_string(),
                score,
                index_name: index_name.clone(),
                ..Default::default()
            };
            Ok(InternalQueryResponse {
                index_segment_responses: vec![IndexSegmentResponse {
                    index_name: index_name.clone(),
                    segment_responses: vec![
                        ShardResult {
                            index_name: index_name.clone(),
                            segment_number: 0,
                            total_hits: 2,
                            results: vec![hit("x", 1.0)],
                            next: Some(hit("y", 5.0)),
                            ..Default::default()
                        },
                        ShardResult {
                            index_name: index_name.clone(),
                            segment_number: 1,
                            ..Default::default()
                        },
                    ],
                }],
            })
        }

        fn execute_store(&self, _member: &MemberId, _request: &StoreRequest) -> Result<()> {
            Ok(())
        }

        fn execute_delete(&self, _member: &MemberId, _request: &DeleteRequest) -> Result<()> {
            Ok(())
        }

        fn get_number_of_docs(
            &self,
            _member: &MemberId,
            _index_name: &str,
            _real_time: bool,
        ) -> Result<GetNumberOfDocsResponse> {
            Ok(GetNumberOfDocsResponse::default())
        }

        fn get_field_names(
            &self,
            _member: &MemberId,
            _index_name: &str,
        ) -> Result<BTreeSet<String>> {
            Ok(BTreeSet::new())
        }

        fn get_terms(
            &self,
            _member: &MemberId,
            _request: &GetTermsRequest,
        ) -> Result<GetTermsResponse> {
            Ok(GetTermsResponse::default())
        }

        fn clear(&self, _member: &MemberId, _index_name: &str) -> Result<()> {
            Ok(())
        }

        fn optimize(&self, _member: &MemberId, _index_name: &str) -> Result<()> {
            Ok(())
        }

        fn reload_index_settings(&self, _member: &MemberId, _index_name: &str) -> Result<()> {
            Ok(())
        }

        fn unload_index(&self, _member: &MemberId, _index_name: &str) -> Result<()> {
            Ok(())
        }

        fn update_segment_map(
            &self,
            _member: &MemberId,
            _index_name: &str,
            _map: &ShardOwnershipMap,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_query_still_short_after_full_fetch_fails() {
        let client = Arc::new(HoldingBackClient::default());
        let membership = StaticMembership::with_members("local".into(), ["remote".into()]);
        let manager = IndexManager::builder(Arc::new(membership))
            .config(ManagerConfig {
                worker_threads: 2,
                ..Default::default()
            })
            .client(client.clone())
            .balance_policy(Arc::new(RemoteOwnsAll))
            .build()
            .unwrap();
        manager
            .create_index(IndexConfig::builder("docs", 2, "id").build())
            .unwrap();

        let request = QueryRequest::builder("*:*").index("docs").amount(10).build();
        assert!(matches!(
            manager.query(&request),
            Err(ClusterError::ShortResult(_))
        ));
        // the first attempt and the full fetch
        assert_eq!(client.queries.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_shutdown_gives_up_on_a_held_gate() {
        let manager = IndexManager::builder(Arc::new(StaticMembership::new("solo".into())))
            .config(ManagerConfig {
                worker_threads: 1,
                shutdown_wait_secs: 0,
                ..Default::default()
            })
            .build()
            .unwrap();
        manager.create_index(config("docs")).unwrap();

        let held = manager.gate.write();
        manager.shutdown();
        drop(held);

        // returned without unloading, and later requests are refused
        assert_eq!(manager.get_indexes(), vec!["docs"]);
        assert!(
            manager
                .query(&QueryRequest::builder("x").index("docs").build())
                .is_err()
        );
    }
}
