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

//! Server directory probing and ranking.
//!
//! This library keeps a list of voice servers from three sources (favorites,
//! local network discovery and a public directory), resolves their addresses,
//! probes them over UDP and ranks them by latency, population or name. It is
//! built from layers that can be used on their own:
//!
//! - **Protocol layer**: the probe datagram codec
//! - **Stats layer**: streaming quantile estimation and ping hysteresis
//! - **Registry layer**: records, category groups and name de-duplication
//! - **Resolver / probe layers**: async lookups and the UDP probe scheduler
//! - **Ranking layer**: the display order
//!
//! # Quick Start
//!
//! Use the [`Browser`] type for full-stack operation:
//!
//! ```no_run
//! use server_probe::{Browser, Category, EngineConfig, HostSpec, ServerIdentity};
//! use server_probe::ranking::{rank, Entry, SortColumn, SortOrder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let browser = Browser::spawn(EngineConfig::default()).await?;
//!     browser
//!         .add_record(
//!             Category::Favorite,
//!             ServerIdentity::new("Home", HostSpec::parse("voice.example.org"), 64738),
//!         )
//!         .await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(10)).await;
//!
//!     browser.inspect(|registry| {
//!         for entry in rank(registry, SortColumn::Ping, SortOrder::Ascending, None) {
//!             if let Entry::Server(record) = entry {
//!                 println!("{}: {} ms", record.name(), record.stats().ping_ms());
//!             }
//!         }
//!     });
//!     Ok(())
//! }
//! ```
//!
//! # Using Individual Layers
//!
//! ## Stats Layer Only
//!
//! ```
//! use server_probe::stats::{HysteresisConfig, PingStats};
//!
//! let mut stats = PingStats::new();
//! for rtt_ms in [20, 22, 21, 25] {
//!     stats.record_sent();
//!     stats.add_sample(rtt_ms * 1000, &HysteresisConfig::default());
//! }
//! assert_eq!(stats.received(), 4);
//! assert_eq!(stats.packet_loss(), Some(0.0));
//! ```
//!
//! ## Registry Layer Only
//!
//! ```
//! use server_probe::registry::{Category, HostSpec, ServerIdentity, ServerRegistry};
//!
//! let mut registry = ServerRegistry::new(true);
//! registry.add(Category::Favorite, ServerIdentity::new("Home", HostSpec::parse("a.example"), 64738));
//! registry.add(Category::Favorite, ServerIdentity::new("Home (2)", HostSpec::parse("b.example"), 64738));
//!
//! let id = registry.import_favorite(ServerIdentity::new("Home", HostSpec::parse("c.example"), 64738));
//! assert_eq!(registry.find(id).unwrap().name(), "Home (3)");
//! ```

mod engine;
pub mod probe;
pub mod protocol;
pub mod ranking;
pub mod registry;
pub mod resolver;
pub mod source;
pub mod stats;

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use engine::{Command, Engine, Inbox};

pub use engine::{EngineConfig, EngineError, RegistryEvent};
pub use probe::ProbeScheduler;
pub use protocol::{PingCodec, PingReply, PingRequest, Protocol, ProtocolError, ServerVersion};
pub use ranking::{SortColumn, SortOrder};
pub use registry::{
    Category, HostSpec, RecordId, ServerDetails, ServerFilter, ServerIdentity, ServerRecord,
    ServerRegistry,
};
pub use resolver::{DiscoveryDirectory, HostLookup, ResolveError, SystemLookup};
pub use source::{DiscoveredService, FavoriteServer, PublicServer};
pub use stats::{HysteresisConfig, PingStats};

/// Handle to a running probe engine.
///
/// The engine runs in a background task that owns all writes to the registry.
/// The handle sends it commands and reads snapshots of the registry.
pub struct Browser {
    registry: Arc<RwLock<ServerRegistry>>,
    command_tx: mpsc::Sender<Command>,
    event_tx: broadcast::Sender<RegistryEvent>,
    discovery: DiscoveryDirectory,
    cancel_token: CancellationToken,
}

impl std::fmt::Debug for Browser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Browser")
            .field("cancel_token", &self.cancel_token)
            .finish_non_exhaustive()
    }
}

impl Browser {
    /// Bind the probe sockets and start the engine, resolving names through
    /// DNS and `@` keys through [`Browser::discovery`].
    pub async fn spawn(config: EngineConfig) -> Result<Self, EngineError> {
        let discovery = DiscoveryDirectory::new();
        let lookup = SystemLookup::new(discovery.clone(), config.lookup_timeout);
        Self::spawn_with_lookup(config, discovery, Arc::new(lookup)).await
    }

    /// Start the engine with a custom host lookup.
    pub async fn spawn_with_lookup(
        config: EngineConfig,
        discovery: DiscoveryDirectory,
        lookup: Arc<dyn HostLookup>,
    ) -> Result<Self, EngineError> {
        let (scheduler, datagrams) = ProbeScheduler::bind(
            config.bind_v4,
            config.bind_v6,
            config.reply_window,
            config.buffer_size,
        )
        .await?;
        let (resolver, resolutions) = resolver::AddressResolver::new(lookup, config.buffer_size);
        let (command_tx, commands) = mpsc::channel(config.buffer_size.max(1));
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let registry = Arc::new(RwLock::new(ServerRegistry::new(config.public_list_enabled)));
        let cancel_token = CancellationToken::new();

        let engine = Engine::new(
            &config,
            Arc::clone(&registry),
            resolver,
            scheduler,
            event_tx.clone(),
        );
        let inbox = Inbox {
            commands,
            resolutions,
            datagrams,
        };
        tokio::spawn(engine.run(inbox, cancel_token.clone()));

        Ok(Self {
            registry,
            command_tx,
            event_tx,
            discovery,
            cancel_token,
        })
    }

    /// Add a record and start resolving it.
    pub async fn add_record(
        &self,
        category: Category,
        identity: ServerIdentity,
    ) -> Result<RecordId, EngineError> {
        self.request(|reply| Command::Add {
            category,
            identity,
            reply,
        })
        .await
    }

    /// Add a favorite from the favorites store, renaming it if its name is
    /// already taken.
    pub async fn import_favorite(&self, favorite: FavoriteServer) -> Result<RecordId, EngineError> {
        self.request(|reply| Command::ImportFavorite {
            identity: favorite.into(),
            reply,
        })
        .await
    }

    /// Announce a discovered service and add it to the LAN group.
    pub async fn add_discovered(
        &self,
        service: DiscoveredService,
        addresses: Vec<SocketAddr>,
    ) -> Result<RecordId, EngineError> {
        self.discovery
            .publish(service.discovery_key.clone(), addresses);
        self.add_record(Category::Lan, service.into()).await
    }

    /// Copy a record into the favorites.
    pub async fn copy_to_favorites(&self, id: RecordId) -> Result<Option<RecordId>, EngineError> {
        self.request(|reply| Command::CopyToFavorites { id, reply })
            .await
    }

    /// Remove a record, cancelling its lookup and outstanding probes.
    pub async fn remove_record(&self, id: RecordId) -> Result<bool, EngineError> {
        self.request(|reply| Command::Remove { id, reply }).await
    }

    /// Resolve a record's host again.
    pub async fn resolve(&self, id: RecordId) -> Result<bool, EngineError> {
        self.request(|reply| Command::Resolve { id, reply }).await
    }

    /// Replace the public list with `servers`.
    pub async fn replace_public(
        &self,
        servers: Vec<PublicServer>,
    ) -> Result<Vec<RecordId>, EngineError> {
        let servers = servers.into_iter().map(ServerIdentity::from).collect();
        self.request(|reply| Command::ReplacePublic { servers, reply })
            .await
    }

    /// Send a probe round now. Returns the number of probes sent.
    pub async fn probe_now(&self) -> Result<usize, EngineError> {
        self.request(|reply| Command::ProbeNow { reply }).await
    }

    /// Directory consulted for `@` hosts.
    #[must_use]
    pub fn discovery(&self) -> &DiscoveryDirectory {
        &self.discovery
    }

    /// Subscribe to registry events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }

    /// Snapshot of a record.
    #[must_use]
    pub fn record(&self, id: RecordId) -> Option<ServerRecord> {
        self.inspect(|registry| registry.find(id).cloned()).flatten()
    }

    /// Snapshot of every record.
    #[must_use]
    pub fn records(&self) -> Vec<ServerRecord> {
        self.inspect(|registry| registry.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Run `f` against the registry while holding its read lock.
    pub fn inspect<R>(&self, f: impl FnOnce(&ServerRegistry) -> R) -> Option<R> {
        self.registry.read().ok().map(|registry| f(&registry))
    }

    /// Shut down the engine.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, EngineError> {
        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(command(reply))
            .await
            .map_err(|_closed| EngineError::Shutdown)?;
        response.await.map_err(|_closed| EngineError::Shutdown)
    }
}

impl Drop for Browser {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
