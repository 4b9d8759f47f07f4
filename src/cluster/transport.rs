//! Member-to-member calls.
//!
//! [`InternalClient`] is the RPC surface one member uses to reach another.
//! [`InProcessCluster`] connects managers living in the same process; every
//! request and response crosses it as JSON, like it would cross a socket.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};

use log::{debug, info};
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::cluster::{MemberId, ShardOwnershipMap};
use crate::error::{ClusterError, Result};
use crate::manager::IndexManager;
use crate::request::{DeleteRequest, GetTermsRequest, QueryRequest, StoreRequest};
use crate::response::{GetNumberOfDocsResponse, GetTermsResponse, InternalQueryResponse};

pub trait InternalClient: Send + Sync + fmt::Debug {
    /// Opens a channel to a member.
    fn add_member(&self, member: &MemberId);

    fn remove_member(&self, member: &MemberId);

    fn execute_query(
        &self,
        member: &MemberId,
        request: &QueryRequest,
    ) -> Result<InternalQueryResponse>;

    fn execute_store(&self, member: &MemberId, request: &StoreRequest) -> Result<()>;

    fn execute_delete(&self, member: &MemberId, request: &DeleteRequest) -> Result<()>;

    fn get_number_of_docs(
        &self,
        member: &MemberId,
        index_name: &str,
        real_time: bool,
    ) -> Result<GetNumberOfDocsResponse>;

    fn get_field_names(&self, member: &MemberId, index_name: &str) -> Result<BTreeSet<String>>;

    fn get_terms(&self, member: &MemberId, request: &GetTermsRequest) -> Result<GetTermsResponse>;

    fn clear(&self, member: &MemberId, index_name: &str) -> Result<()>;

    fn optimize(&self, member: &MemberId, index_name: &str) -> Result<()>;

    fn reload_index_settings(&self, member: &MemberId, index_name: &str) -> Result<()>;

    fn unload_index(&self, member: &MemberId, index_name: &str) -> Result<()>;

    fn update_segment_map(
        &self,
        member: &MemberId,
        index_name: &str,
        map: &ShardOwnershipMap,
    ) -> Result<()>;
}

/// Registry of the managers running in this process.
#[derive(Default)]
pub struct InProcessCluster {
    members: RwLock<HashMap<MemberId, Weak<IndexManager>>>,
}

impl InProcessCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, member: MemberId, manager: &Arc<IndexManager>) {
        info!("Registering member <{}>", member);
        self.members.write().insert(member, Arc::downgrade(manager));
    }

    /// Makes the member unreachable, as if its process had died.
    pub fn deregister(&self, member: &MemberId) {
        info!("Deregistering member <{}>", member);
        self.members.write().remove(member);
    }

    pub fn client(self: &Arc<Self>) -> InProcessClient {
        InProcessClient {
            cluster: self.clone(),
            connections: RwLock::new(BTreeSet::new()),
        }
    }

    fn manager(&self, member: &MemberId) -> Result<Arc<IndexManager>> {
        self.members
            .read()
            .get(member)
            .and_then(Weak::upgrade)
            .ok_or_else(|| ClusterError::unreachable(member, "member is not running"))
    }
}

impl fmt::Debug for InProcessCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let members: BTreeSet<MemberId> = self.members.read().keys().cloned().collect();
        f.debug_struct("InProcessCluster")
            .field("members", &members)
            .finish()
    }
}

#[derive(Debug)]
pub struct InProcessClient {
    cluster: Arc<InProcessCluster>,
    connections: RwLock<BTreeSet<MemberId>>,
}

impl InProcessClient {
    /// Calls `f` on the member's manager with the request as it arrives off the wire.
    fn call<Req, Resp, F>(&self, member: &MemberId, request: &Req, f: F) -> Result<Resp>
    where
        Req: Serialize + DeserializeOwned,
        Resp: Serialize + DeserializeOwned,
        F: FnOnce(&IndexManager, Req) -> Result<Resp>,
    {
        if !self.connections.read().contains(member) {
            return Err(ClusterError::unreachable(member, "no connection to member"));
        }
        let manager = self.cluster.manager(member)?;
        let request = wire(request)?;
        let response = f(&manager, request)?;
        wire(&response)
    }
}

fn wire<T: Serialize + DeserializeOwned>(value: &T) -> Result<T> {
    let bytes = serde_json::to_vec(value)?;
    Ok(serde_json::from_slice(&bytes)?)
}

impl InternalClient for InProcessClient {
    fn add_member(&self, member: &MemberId) {
        if self.connections.write().insert(member.clone()) {
            debug!("Opened connection to <{}>", member);
        }
    }

    fn remove_member(&self, member: &MemberId) {
        if self.connections.write().remove(member) {
            debug!("Closed connection to <{}>", member);
        }
    }

    fn execute_query(
        &self,
        member: &MemberId,
        request: &QueryRequest,
    ) -> Result<InternalQueryResponse> {
        self.call(member, request, |m, req| m.internal_query(&req))
    }

    fn execute_store(&self, member: &MemberId, request: &StoreRequest) -> Result<()> {
        self.call(member, request, |m, req| m.store_internal(&req))
    }

    fn execute_delete(&self, member: &MemberId, request: &DeleteRequest) -> Result<()> {
        self.call(member, request, |m, req| m.delete_internal(&req))
    }

    fn get_number_of_docs(
        &self,
        member: &MemberId,
        index_name: &str,
        real_time: bool,
    ) -> Result<GetNumberOfDocsResponse> {
        self.call(member, &index_name.to_string(), |m, name| {
            m.get_number_of_docs_internal(&name, real_time)
        })
    }

    fn get_field_names(&self, member: &MemberId, index_name: &str) -> Result<BTreeSet<String>> {
        self.call(member, &index_name.to_string(), |m, name| {
            m.get_field_names_internal(&name)
        })
    }

    fn get_terms(&self, member: &MemberId, request: &GetTermsRequest) -> Result<GetTermsResponse> {
        self.call(member, request, |m, req| m.get_terms_internal(&req))
    }

    fn clear(&self, member: &MemberId, index_name: &str) -> Result<()> {
        self.call(member, &index_name.to_string(), |m, name| m.clear_internal(&name))
    }

    fn optimize(&self, member: &MemberId, index_name: &str) -> Result<()> {
        self.call(member, &index_name.to_string(), |m, name| {
            m.optimize_internal(&name)
        })
    }

    fn reload_index_settings(&self, member: &MemberId, index_name: &str) -> Result<()> {
        self.call(member, &index_name.to_string(), |m, name| {
            m.reload_index_settings(&name)
        })
    }

    fn unload_index(&self, member: &MemberId, index_name: &str) -> Result<()> {
        self.call(member, &index_name.to_string(), |m, name| m.unload_index(&name))
    }

    fn update_segment_map(
        &self,
        member: &MemberId,
        index_name: &str,
        map: &ShardOwnershipMap,
    ) -> Result<()> {
        let request = (index_name.to_string(), map.clone());
        self.call(member, &request, |m, (name, map)| {
            m.update_segment_map(&name, &map)
        })
    }
}
