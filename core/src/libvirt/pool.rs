//! One lazily opened, exclusively leased hypervisor session per node

use super::{Connector, Hypervisor};
use crate::{Context, Error, Result};
use log::{error, info};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::thread;

struct Slot {
    node_id: String,
    uri: String,
    session: Mutex<Option<Box<dyn Hypervisor>>>,
}

pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    slots: Vec<Slot>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("nodes", &self.slots.iter().map(|s| &s.node_id).collect::<Vec<_>>())
            .finish()
    }
}

/// Exclusive use of one node's session; released on drop
pub struct Lease<'a> {
    node_id: &'a str,
    session: MappedMutexGuard<'a, Box<dyn Hypervisor>>,
}

impl fmt::Debug for Lease<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

impl Lease<'_> {
    pub fn node_id(&self) -> &str {
        self.node_id
    }

    pub fn release(self) {}
}

impl Deref for Lease<'_> {
    type Target = dyn Hypervisor;

    fn deref(&self) -> &Self::Target {
        &**self.session
    }
}

impl DerefMut for Lease<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.session
    }
}

impl ConnectionPool {
    /// `nodes` are `(node id, uri)` pairs in display order
    pub fn new(connector: Arc<dyn Connector>, nodes: Vec<(String, String)>) -> Self {
        let slots = nodes
            .into_iter()
            .map(|(node_id, uri)| Slot {
                node_id,
                uri,
                session: Mutex::new(None),
            })
            .collect();
        Self { connector, slots }
    }

    fn slot(&self, node_id: &str) -> Result<&Slot> {
        self.slots
            .iter()
            .find(|s| s.node_id == node_id)
            .ok_or_else(|| Error::not_found(format!("node {}", node_id)))
    }

    /// Configured node ids, restricted to `filter` unless it is empty
    pub fn nodes(&self, filter: &[String]) -> Vec<String> {
        self.slots
            .iter()
            .filter(|s| filter.is_empty() || filter.iter().any(|f| *f == s.node_id))
            .map(|s| s.node_id.clone())
            .collect()
    }

    /// Block until the node's session is free, reconnecting if it went away
    pub fn acquire(&self, node_id: &str) -> Result<Lease<'_>> {
        let slot = self.slot(node_id)?;
        let mut session = slot.session.lock();

        let alive = match session.as_ref() {
            Some(s) => s.is_alive().unwrap_or(false),
            None => false,
        };
        if !alive {
            if session.take().is_some() {
                info!("session to node {} is dead, reconnecting", node_id);
            }
            let fresh = self
                .connector
                .connect(&slot.uri)
                .with_context(|| format!("cannot connect to node {} at {}", node_id, slot.uri))?;
            *session = Some(fresh);
        }

        let session = MutexGuard::try_map(session, |s| s.as_mut())
            .map_err(|_| Error::libvirt(format!("no session for node {}", node_id)))?;
        Ok(Lease {
            node_id: slot.node_id.as_str(),
            session,
        })
    }

    /// Run `f` on every selected node in parallel and merge the results.
    ///
    /// A node that fails is logged and left out of the result.
    pub fn fan_out<T, F>(&self, node_ids: &[String], what: &str, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(&Lease<'_>) -> Result<Vec<T>> + Sync,
    {
        let nodes = self.nodes(node_ids);
        let merged = Mutex::new(Vec::new());
        thread::scope(|scope| {
            for node_id in &nodes {
                let merged = &merged;
                let f = &f;
                scope.spawn(move || {
                    let result = self.acquire(node_id).and_then(|lease| f(&lease));
                    match result {
                        Ok(items) => merged.lock().extend(items),
                        Err(e) => error!("cannot list {} on node {}: {}", what, node_id, e),
                    }
                });
            }
        });
        merged.into_inner()
    }
}
