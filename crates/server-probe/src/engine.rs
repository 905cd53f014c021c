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

//! The owner loop.
//!
//! A single task owns the registry's write side. Commands from the handle,
//! finished lookups, received datagrams and ticks all arrive here as
//! messages, so every record update happens in one place and readers never
//! see a half-applied change.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::probe::{Datagram, ProbeScheduler};
use crate::registry::{Category, RecordId, ServerIdentity, ServerRegistry};
use crate::resolver::{AddressResolver, Resolution};
use crate::stats::HysteresisConfig;

/// Errors raised by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cannot bind probe socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("engine has shut down")]
    Shutdown,
}

/// Configuration for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Time between probe rounds.
    pub probe_interval: Duration,
    /// How long a probe waits for its reply before counting as lost.
    pub reply_window: Duration,
    /// Local address for the IPv4 probe socket.
    pub bind_v4: SocketAddr,
    /// Local address for the IPv6 probe socket; `None` disables IPv6.
    pub bind_v6: Option<SocketAddr>,
    /// Whether the Public group is shown.
    pub public_list_enabled: bool,
    /// Upper bound for a single DNS lookup.
    pub lookup_timeout: Duration,
    /// Sort value hysteresis.
    pub hysteresis: HysteresisConfig,
    /// Broadcast channel capacity for events.
    pub event_channel_capacity: usize,
    /// Channel buffer size for commands, lookups and datagrams.
    pub buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(5),
            reply_window: Duration::from_secs(5),
            bind_v4: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            bind_v6: Some(SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))),
            public_list_enabled: true,
            lookup_timeout: Duration::from_secs(10),
            hysteresis: HysteresisConfig::default(),
            event_channel_capacity: 256,
            buffer_size: 1024,
        }
    }
}

/// Events emitted when the registry changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A record was inserted.
    RecordAdded(RecordId),
    /// A record was removed.
    RecordRemoved(RecordId),
    /// Ping, users or max users of a record changed.
    RecordChanged(RecordId),
    /// A record's addresses were resolved.
    AddressesResolved { id: RecordId, count: usize },
    /// Resolution failed; the record stays but is not probed.
    ResolutionFailed { id: RecordId, reason: String },
}

#[derive(Debug)]
pub(crate) enum Command {
    Add {
        category: Category,
        identity: ServerIdentity,
        reply: oneshot::Sender<RecordId>,
    },
    ImportFavorite {
        identity: ServerIdentity,
        reply: oneshot::Sender<RecordId>,
    },
    CopyToFavorites {
        id: RecordId,
        reply: oneshot::Sender<Option<RecordId>>,
    },
    Remove {
        id: RecordId,
        reply: oneshot::Sender<bool>,
    },
    Resolve {
        id: RecordId,
        reply: oneshot::Sender<bool>,
    },
    ReplacePublic {
        servers: Vec<ServerIdentity>,
        reply: oneshot::Sender<Vec<RecordId>>,
    },
    ProbeNow {
        reply: oneshot::Sender<usize>,
    },
}

pub(crate) struct Engine {
    registry: Arc<RwLock<ServerRegistry>>,
    resolver: AddressResolver,
    scheduler: ProbeScheduler,
    hysteresis: HysteresisConfig,
    probe_interval: Duration,
    event_tx: broadcast::Sender<RegistryEvent>,
}

pub(crate) struct Inbox {
    pub commands: mpsc::Receiver<Command>,
    pub resolutions: mpsc::Receiver<Resolution>,
    pub datagrams: mpsc::Receiver<Datagram>,
}

impl Engine {
    pub(crate) fn new(
        config: &EngineConfig,
        registry: Arc<RwLock<ServerRegistry>>,
        resolver: AddressResolver,
        scheduler: ProbeScheduler,
        event_tx: broadcast::Sender<RegistryEvent>,
    ) -> Self {
        Self {
            registry,
            resolver,
            scheduler,
            hysteresis: config.hysteresis,
            probe_interval: config.probe_interval,
            event_tx,
        }
    }

    pub(crate) async fn run(mut self, mut inbox: Inbox, cancel_token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        info!(
            "Probe engine started (interval {} ms)",
            self.probe_interval.as_millis()
        );

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => break,

                command = inbox.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },

                Some(resolution) = inbox.resolutions.recv() => {
                    self.handle_resolution(resolution);
                }

                Some(datagram) = inbox.datagrams.recv() => {
                    self.handle_datagram(&datagram);
                }

                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }

        self.resolver.cancel_all();
        self.scheduler.shutdown();
        info!("Probe engine stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Add {
                category,
                identity,
                reply,
            } => {
                if let Some(id) = self.insert(|registry| registry.add(category, identity)) {
                    let _ = reply.send(id);
                }
            }
            Command::ImportFavorite { identity, reply } => {
                if let Some(id) = self.insert(|registry| registry.import_favorite(identity)) {
                    let _ = reply.send(id);
                }
            }
            Command::CopyToFavorites { id, reply } => {
                let copy = self
                    .write(|registry| registry.copy_to_favorites(id))
                    .flatten();
                if let Some(copy) = copy {
                    let _ = self.event_tx.send(RegistryEvent::RecordAdded(copy));
                }
                let _ = reply.send(copy);
            }
            Command::Remove { id, reply } => {
                let _ = reply.send(self.remove(id));
            }
            Command::Resolve { id, reply } => {
                let _ = reply.send(self.start_resolution(id));
            }
            Command::ReplacePublic { servers, reply } => {
                let cleared = self
                    .write(|registry| registry.clear_category(Category::Public))
                    .unwrap_or_default();
                for id in cleared {
                    self.resolver.cancel(id);
                    self.scheduler.forget(id);
                    let _ = self.event_tx.send(RegistryEvent::RecordRemoved(id));
                }

                info!("Loading {} public servers", servers.len());
                let ids = servers
                    .into_iter()
                    .filter_map(|identity| {
                        self.insert(|registry| registry.add(Category::Public, identity))
                    })
                    .collect();
                let _ = reply.send(ids);
            }
            Command::ProbeNow { reply } => {
                let _ = reply.send(self.tick());
            }
        }
    }

    /// Insert through `add`, announce the record and start resolving it.
    fn insert(&mut self, add: impl FnOnce(&mut ServerRegistry) -> RecordId) -> Option<RecordId> {
        let id = self.write(add)?;
        let _ = self.event_tx.send(RegistryEvent::RecordAdded(id));
        self.start_resolution(id);
        Some(id)
    }

    fn remove(&mut self, id: RecordId) -> bool {
        self.resolver.cancel(id);
        self.scheduler.forget(id);

        let removed = self.write(|registry| registry.remove(id)).flatten();
        if removed.is_some() {
            let _ = self.event_tx.send(RegistryEvent::RecordRemoved(id));
        }
        removed.is_some()
    }

    fn start_resolution(&mut self, id: RecordId) -> bool {
        let target = self
            .write(|registry| {
                let record = registry.find_mut(id)?;
                record.mark_resolving();
                Some((record.identity.host.clone(), record.identity.port))
            })
            .flatten();

        match target {
            Some((host, port)) => {
                self.resolver.start(id, &host, port);
                true
            }
            None => false,
        }
    }

    fn handle_resolution(&mut self, resolution: Resolution) {
        if !self.resolver.accept(&resolution) {
            debug!("Discarding superseded lookup for {}", resolution.record);
            return;
        }

        let id = resolution.record;
        match resolution.result {
            Ok(addresses) => {
                let stored = self
                    .write(|registry| {
                        let record = registry.find_mut(id)?;
                        record.set_addresses(addresses);
                        info!(
                            "Resolved '{}' to {} address(es)",
                            record.name(),
                            record.addresses().len()
                        );
                        Some(record.addresses().to_vec())
                    })
                    .flatten();

                if let Some(addresses) = stored {
                    let _ = self.event_tx.send(RegistryEvent::AddressesResolved {
                        id,
                        count: addresses.len(),
                    });
                    self.probe(&[(id, addresses)]);
                }
            }
            Err(e) => {
                let reason = e.to_string();
                self.scheduler.forget(id);
                let known = self
                    .write(|registry| {
                        let record = registry.find_mut(id)?;
                        warn!("Cannot resolve '{}': {}", record.name(), reason);
                        record.set_failed(reason.clone());
                        Some(())
                    })
                    .flatten();

                if known.is_some() {
                    let _ = self
                        .event_tx
                        .send(RegistryEvent::ResolutionFailed { id, reason });
                }
            }
        }
    }

    fn handle_datagram(&mut self, datagram: &Datagram) {
        let Some(matched) = self.scheduler.match_reply(datagram) else {
            return;
        };

        let hysteresis = self.hysteresis;
        let changed = self
            .write(|registry| {
                let record = registry.find_mut(matched.record)?;
                Some(record.apply_reply(matched.rtt_us, &matched.reply, &hysteresis))
            })
            .flatten();

        if changed == Some(true) {
            let _ = self
                .event_tx
                .send(RegistryEvent::RecordChanged(matched.record));
        }
    }

    /// Expire old probes and send a round to every probeable record.
    /// Returns the number of probes sent.
    fn tick(&mut self) -> usize {
        let expired = self.scheduler.expire();
        if expired > 0 {
            debug!("{} probe(s) went unanswered", expired);
        }

        let targets = self
            .read(ServerRegistry::probe_targets)
            .unwrap_or_default();
        self.probe(&targets)
    }

    fn probe(&mut self, targets: &[(RecordId, Vec<SocketAddr>)]) -> usize {
        let sent = self.scheduler.send_round(targets);
        let count = sent.len();

        self.write(|registry| {
            for id in sent {
                if let Some(record) = registry.find_mut(id) {
                    record.record_sent();
                }
            }
        });
        count
    }

    fn read<R>(&self, f: impl FnOnce(&ServerRegistry) -> R) -> Option<R> {
        self.registry.read().ok().map(|registry| f(&registry))
    }

    fn write<R>(&self, f: impl FnOnce(&mut ServerRegistry) -> R) -> Option<R> {
        self.registry
            .write()
            .ok()
            .map(|mut registry| f(&mut registry))
    }
}
