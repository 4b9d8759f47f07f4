//! Fan-out of one request to every member that owns part of an index.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::cluster::MemberId;
use crate::error::{ClusterError, Result};

/// Runs the local handler for this member and the remote handler for every
/// other member, in parallel on a bounded pool.
///
/// The call returns once every member answered, or with the first error.
/// Responses come back in member order.
pub struct RequestFederator {
    local: MemberId,
    pool: ThreadPool,
    stopped: AtomicBool,
}

impl RequestFederator {
    pub fn new(local: MemberId, threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("federator-{}", i))
            .build()
            .map_err(|e| ClusterError::internal(format!("federator pool: {}", e)))?;
        Ok(Self {
            local,
            pool,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn local_member(&self) -> &MemberId {
        &self.local
    }

    pub fn send<Req, Resp, L, R>(
        &self,
        members: &BTreeSet<MemberId>,
        request: &Req,
        local: L,
        remote: R,
    ) -> Result<Vec<Resp>>
    where
        Req: Sync + ?Sized,
        Resp: Send,
        L: Fn(&Req) -> Result<Resp> + Sync,
        R: Fn(&MemberId, &Req) -> Result<Resp> + Sync,
    {
        if self.is_stopped() {
            return Err(ClusterError::internal("Request federator is stopped"));
        }
        debug!("Federating request to {} members", members.len());

        let members: Vec<&MemberId> = members.iter().collect();
        self.pool.install(|| {
            members
                .par_iter()
                .map(|member| {
                    if *member == &self.local {
                        local(request)
                    } else {
                        remote(*member, request)
                    }
                })
                .collect::<Result<Vec<Resp>>>()
        })
    }

    /// New requests fail once stopped; running ones finish.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for RequestFederator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestFederator")
            .field("local", &self.local)
            .field("threads", &self.pool.current_num_threads())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
