// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Asynchronous address resolution.
//!
//! Each lookup runs in its own task and reports back through a channel, so a
//! slow DNS server never holds up other records. Hosts prefixed with `@` are
//! looked up in the [`DiscoveryDirectory`] instead of DNS.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::debug;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::registry::{HostSpec, RecordId};

/// Errors that can occur while resolving a host.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("lookup failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("no discovered service with key '{0}'")]
    UnknownDiscoveryKey(String),

    #[error("'{0}' has no addresses")]
    NoAddresses(String),

    #[error("lookup of '{0}' timed out")]
    TimedOut(String),
}

pub type LookupFuture = Pin<Box<dyn Future<Output = Result<Vec<SocketAddr>, ResolveError>> + Send>>;

/// Turns a host into socket addresses.
pub trait HostLookup: Send + Sync + 'static {
    fn lookup(&self, host: &HostSpec, port: u16) -> LookupFuture;
}

/// Addresses of services announced on the local network, keyed by
/// discovery key. Cloning shares the same directory.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryDirectory {
    services: Arc<RwLock<HashMap<String, Vec<SocketAddr>>>>,
}

impl DiscoveryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the addresses announced for `key`.
    pub fn publish(&self, key: impl Into<String>, addresses: Vec<SocketAddr>) {
        if let Ok(mut services) = self.services.write() {
            services.insert(key.into(), addresses);
        }
    }

    /// Forget a service that went away.
    pub fn withdraw(&self, key: &str) {
        if let Ok(mut services) = self.services.write() {
            services.remove(key);
        }
    }

    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<Vec<SocketAddr>> {
        self.services
            .read()
            .ok()
            .and_then(|services| services.get(key).cloned())
    }
}

/// DNS for names and literal addresses, the discovery directory for keys.
#[derive(Debug, Clone)]
pub struct SystemLookup {
    discovery: DiscoveryDirectory,
    timeout: Duration,
}

impl SystemLookup {
    #[must_use]
    pub fn new(discovery: DiscoveryDirectory, timeout: Duration) -> Self {
        Self { discovery, timeout }
    }
}

impl HostLookup for SystemLookup {
    fn lookup(&self, host: &HostSpec, port: u16) -> LookupFuture {
        match host {
            HostSpec::Discovery(key) => {
                let result = match self.discovery.lookup(key) {
                    Some(addresses) if addresses.is_empty() => {
                        Err(ResolveError::NoAddresses(host.to_string()))
                    }
                    Some(addresses) => Ok(addresses),
                    None => Err(ResolveError::UnknownDiscoveryKey(key.clone())),
                };
                Box::pin(std::future::ready(result))
            }
            HostSpec::Name(name) => {
                let name = name.clone();
                let timeout = self.timeout;
                Box::pin(async move {
                    let lookup = tokio::net::lookup_host((name.as_str(), port));
                    let addresses: Vec<SocketAddr> = tokio::time::timeout(timeout, lookup)
                        .await
                        .map_err(|_elapsed| ResolveError::TimedOut(name.clone()))??
                        .collect();
                    if addresses.is_empty() {
                        return Err(ResolveError::NoAddresses(name));
                    }
                    Ok(addresses)
                })
            }
        }
    }
}

/// Completed lookup for a record.
#[derive(Debug)]
pub struct Resolution {
    pub record: RecordId,
    ticket: u64,
    pub result: Result<Vec<SocketAddr>, ResolveError>,
}

struct Pending {
    ticket: u64,
    handle: JoinHandle<()>,
}

/// Runs lookups and keeps at most one in flight per record.
pub struct AddressResolver {
    lookup: Arc<dyn HostLookup>,
    pending: HashMap<RecordId, Pending>,
    next_ticket: u64,
    result_tx: mpsc::Sender<Resolution>,
}

impl std::fmt::Debug for AddressResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressResolver")
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl AddressResolver {
    /// Create a resolver and the receiver its results arrive on.
    #[must_use]
    pub fn new(
        lookup: Arc<dyn HostLookup>,
        buffer_size: usize,
    ) -> (Self, mpsc::Receiver<Resolution>) {
        let (result_tx, result_rx) = mpsc::channel(buffer_size.max(1));
        let resolver = Self {
            lookup,
            pending: HashMap::new(),
            next_ticket: 0,
            result_tx,
        };
        (resolver, result_rx)
    }

    /// Start resolving `host` for `record`, abandoning any lookup already
    /// running for it.
    pub fn start(&mut self, record: RecordId, host: &HostSpec, port: u16) {
        self.cancel(record);

        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let lookup = self.lookup.lookup(host, port);
        let result_tx = self.result_tx.clone();
        debug!("Resolving {host}:{port} for {record}");

        let handle = tokio::spawn(async move {
            let result = lookup.await;
            let _ = result_tx
                .send(Resolution {
                    record,
                    ticket,
                    result,
                })
                .await;
        });

        self.pending.insert(record, Pending { ticket, handle });
    }

    /// Abandon the lookup for `record`, if any.
    pub fn cancel(&mut self, record: RecordId) {
        if let Some(pending) = self.pending.remove(&record) {
            pending.handle.abort();
        }
    }

    /// Abandon every lookup.
    pub fn cancel_all(&mut self) {
        for (_, pending) in self.pending.drain() {
            pending.handle.abort();
        }
    }

    /// Claim a finished lookup. Returns `false` for results of lookups that
    /// were cancelled or superseded.
    pub fn accept(&mut self, resolution: &Resolution) -> bool {
        match self.pending.get(&resolution.record) {
            Some(pending) if pending.ticket == resolution.ticket => {
                self.pending.remove(&resolution.record);
                true
            }
            _ => false,
        }
    }

    /// Whether a lookup is running for `record`.
    #[must_use]
    pub fn is_pending(&self, record: RecordId) -> bool {
        self.pending.contains_key(&record)
    }
}

impl Drop for AddressResolver {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
