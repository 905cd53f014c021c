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

//! Server records and their identity, population and address state.

use std::fmt;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RecordId;
use crate::protocol::{PingReply, ServerVersion};
use crate::source::FavoriteServer;
use crate::stats::{HysteresisConfig, PingStats};

/// Prefix marking a host that is looked up in the discovery directory.
pub const DISCOVERY_PREFIX: char = '@';

/// Where a record came from. Fixed for the record's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    Favorite,
    Lan,
    Public,
}

impl Category {
    /// All categories in display order.
    pub const ALL: [Category; 3] = [Category::Favorite, Category::Lan, Category::Public];

    /// Group header label.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Category::Favorite => "Favorite",
            Category::Lan => "LAN",
            Category::Public => "Public Internet",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A host as written by the user: a DNS name / literal address, or a key
/// into the discovery directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostSpec {
    Name(String),
    Discovery(String),
}

impl HostSpec {
    /// Parse a host string, treating a leading `@` as a discovery key.
    #[must_use]
    pub fn parse(host: &str) -> Self {
        match host.strip_prefix(DISCOVERY_PREFIX) {
            Some(key) => HostSpec::Discovery(key.to_string()),
            None => HostSpec::Name(host.to_string()),
        }
    }

    #[must_use]
    pub fn is_discovery(&self) -> bool {
        matches!(self, HostSpec::Discovery(_))
    }
}

impl fmt::Display for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostSpec::Name(name) => f.write_str(name),
            HostSpec::Discovery(key) => write!(f, "{DISCOVERY_PREFIX}{key}"),
        }
    }
}

/// Static description of a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    pub name: String,
    pub host: HostSpec,
    pub port: u16,
    /// Favorites only.
    pub username: Option<String>,
    /// Favorites only.
    pub password: Option<String>,
    pub url: Option<String>,
    /// Public only.
    pub country: Option<String>,
    /// ISO country code, public only.
    pub country_code: Option<String>,
    /// Continent code, public only.
    pub continent_code: Option<String>,
    pub has_valid_cert: bool,
}

impl ServerIdentity {
    /// Identity with only a name, host and port set.
    #[must_use]
    pub fn new(name: impl Into<String>, host: HostSpec, port: u16) -> Self {
        Self {
            name: name.into(),
            host,
            port,
            username: None,
            password: None,
            url: None,
            country: None,
            country_code: None,
            continent_code: None,
            has_valid_cert: false,
        }
    }
}

/// Population figures reported in the most recent reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Population {
    pub users: u32,
    pub max_users: u32,
    /// Bits per second.
    pub bandwidth: u32,
    pub version: ServerVersion,
}

/// Progress of address resolution for a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressState {
    Unresolved,
    Resolving,
    Resolved,
    Failed(String),
}

/// One server in the registry.
#[derive(Debug, Clone)]
pub struct ServerRecord {
    id: RecordId,
    category: Category,
    pub identity: ServerIdentity,
    addresses: Vec<SocketAddr>,
    address_state: AddressState,
    stats: PingStats,
    population: Population,
    last_seen: Option<DateTime<Utc>>,
}

impl ServerRecord {
    pub(crate) fn new(id: RecordId, category: Category, identity: ServerIdentity) -> Self {
        Self {
            id,
            category,
            identity,
            addresses: Vec::new(),
            address_state: AddressState::Unresolved,
            stats: PingStats::new(),
            population: Population::default(),
            last_seen: None,
        }
    }

    /// Copy of `source` filed under another id and category. Addresses and
    /// statistics carry over.
    pub(crate) fn copied_from(id: RecordId, category: Category, source: &ServerRecord) -> Self {
        Self {
            id,
            category,
            identity: source.identity.clone(),
            addresses: source.addresses.clone(),
            address_state: source.address_state.clone(),
            stats: source.stats.carried_over(),
            population: source.population,
            last_seen: source.last_seen,
        }
    }

    #[must_use]
    pub fn id(&self) -> RecordId {
        self.id
    }

    #[must_use]
    pub fn category(&self) -> Category {
        self.category
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.identity.name
    }

    #[must_use]
    pub fn addresses(&self) -> &[SocketAddr] {
        &self.addresses
    }

    #[must_use]
    pub fn address_state(&self) -> &AddressState {
        &self.address_state
    }

    #[must_use]
    pub fn stats(&self) -> &PingStats {
        &self.stats
    }

    #[must_use]
    pub fn population(&self) -> Population {
        self.population
    }

    /// Wall-clock time of the last matched reply.
    #[must_use]
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }

    /// Whether the record has anything to probe.
    #[must_use]
    pub fn is_probeable(&self) -> bool {
        !self.addresses.is_empty()
    }

    pub(crate) fn mark_resolving(&mut self) {
        self.address_state = AddressState::Resolving;
    }

    /// Replace the resolved addresses, dropping duplicates but keeping order.
    pub(crate) fn set_addresses(&mut self, addresses: Vec<SocketAddr>) {
        let mut unique: Vec<SocketAddr> = Vec::with_capacity(addresses.len());
        for address in addresses {
            if !unique.contains(&address) {
                unique.push(address);
            }
        }
        self.addresses = unique;
        self.address_state = AddressState::Resolved;
    }

    pub(crate) fn set_failed(&mut self, reason: String) {
        self.addresses.clear();
        self.address_state = AddressState::Failed(reason);
    }

    pub(crate) fn record_sent(&mut self) {
        self.stats.record_sent();
    }

    /// Absorb a matched reply. Returns `true` when ping, users or max users
    /// changed.
    pub(crate) fn apply_reply(
        &mut self,
        rtt_us: u64,
        reply: &PingReply,
        hysteresis: &HysteresisConfig,
    ) -> bool {
        let ping_changed = self.stats.add_sample(rtt_us, hysteresis);
        let population_changed = self.population.users != reply.users
            || self.population.max_users != reply.max_users;

        self.population = Population {
            users: reply.users,
            max_users: reply.max_users,
            bandwidth: reply.bandwidth,
            version: reply.server_version,
        };
        self.last_seen = Some(Utc::now());

        ping_changed || population_changed
    }

    /// Summary for display.
    #[must_use]
    pub fn details(&self) -> ServerDetails {
        let (ipv4, ipv6): (Vec<SocketAddr>, Vec<SocketAddr>) =
            self.addresses.iter().partition(|address| address.is_ipv4());

        ServerDetails {
            name: self.identity.name.clone(),
            category: self.category,
            host: self.identity.host.to_string(),
            port: self.identity.port,
            ping_ms: self.stats.has_latency().then(|| self.stats.ping_ms()),
            p80_ms: self.stats.percentile_ms(1),
            p95_ms: self.stats.percentile_ms(2),
            packet_loss: self.stats.packet_loss(),
            lost: self.stats.lost(),
            sent: self.stats.sent(),
            users: self.population.users,
            max_users: self.population.max_users,
            bandwidth_kbit: self.population.bandwidth / 1000,
            version: self.population.version,
            ipv4,
            ipv6,
            country: self.identity.country.clone(),
            url: self.identity.url.clone(),
            last_seen: self.last_seen,
        }
    }

    /// The record in the shape the favorites store saves.
    #[must_use]
    pub fn to_favorite(&self) -> FavoriteServer {
        FavoriteServer {
            name: self.identity.name.clone(),
            host: self.identity.host.to_string(),
            port: self.identity.port,
            username: self.identity.username.clone().unwrap_or_default(),
            password: self.identity.password.clone().unwrap_or_default(),
            url: self.identity.url.clone().unwrap_or_default(),
        }
    }
}

/// Derived figures for one record.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDetails {
    pub name: String,
    pub category: Category,
    pub host: String,
    pub port: u16,
    pub ping_ms: Option<u32>,
    pub p80_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    /// Percent, once a probe was sent.
    pub packet_loss: Option<f64>,
    pub lost: u32,
    pub sent: u32,
    pub users: u32,
    pub max_users: u32,
    pub bandwidth_kbit: u32,
    pub version: ServerVersion,
    pub ipv4: Vec<SocketAddr>,
    pub ipv6: Vec<SocketAddr>,
    pub country: Option<String>,
    pub url: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PingRequest;

    fn record() -> ServerRecord {
        ServerRecord::new(
            RecordId::new(0, 0),
            Category::Favorite,
            ServerIdentity::new("Home", HostSpec::parse("voice.example.org"), 64738),
        )
    }

    fn reply(users: u32, max_users: u32) -> PingReply {
        PingReply::answering(
            PingRequest {
                token: 1,
                timestamp_us: 0,
            },
            users,
            max_users,
            72_000,
        )
    }

    #[test]
    fn test_host_spec_parse() {
        assert_eq!(
            HostSpec::parse("@Living Room"),
            HostSpec::Discovery("Living Room".to_string())
        );
        assert_eq!(
            HostSpec::parse("10.0.0.1"),
            HostSpec::Name("10.0.0.1".to_string())
        );
        assert_eq!(HostSpec::parse("@key").to_string(), "@key");
    }

    #[test]
    fn test_set_addresses_dedupes() {
        let mut record = record();
        let a: SocketAddr = "127.0.0.1:64738".parse().unwrap();
        let b: SocketAddr = "[::1]:64738".parse().unwrap();

        record.set_addresses(vec![a, b, a]);
        assert_eq!(record.addresses(), &[a, b]);
        assert_eq!(record.address_state(), &AddressState::Resolved);
        assert!(record.is_probeable());

        record.set_failed("no addresses".to_string());
        assert!(!record.is_probeable());
    }

    #[test]
    fn test_apply_reply_change_detection() {
        let hysteresis = HysteresisConfig::default();
        let mut record = record();

        assert!(record.apply_reply(20_000, &reply(3, 50), &hysteresis));
        assert!(!record.apply_reply(20_000, &reply(3, 50), &hysteresis));
        assert!(record.apply_reply(20_000, &reply(4, 50), &hysteresis));
        assert!(record.apply_reply(20_000, &reply(4, 60), &hysteresis));
        assert!(record.last_seen().is_some());
    }

    #[test]
    fn test_details() {
        let hysteresis = HysteresisConfig::default();
        let mut record = record();
        let v4: SocketAddr = "127.0.0.1:64738".parse().unwrap();
        let v6: SocketAddr = "[::1]:64738".parse().unwrap();
        record.set_addresses(vec![v4, v6]);
        record.record_sent();
        record.record_sent();
        record.apply_reply(35_000, &reply(7, 100), &hysteresis);

        let details = record.details();
        assert_eq!(details.ping_ms, Some(35));
        assert_eq!(details.packet_loss, Some(50.0));
        assert_eq!((details.lost, details.sent), (1, 2));
        assert_eq!(details.bandwidth_kbit, 72);
        assert_eq!((details.users, details.max_users), (7, 100));
        assert_eq!(details.ipv4, vec![v4]);
        assert_eq!(details.ipv6, vec![v6]);
    }

    #[test]
    fn test_to_favorite_keeps_discovery_prefix() {
        let mut identity = ServerIdentity::new("Den", HostSpec::parse("@den-server"), 64738);
        identity.username = Some("alice".to_string());
        let record = ServerRecord::new(RecordId::new(1, 0), Category::Lan, identity);

        let favorite = record.to_favorite();
        assert_eq!(favorite.host, "@den-server");
        assert_eq!(favorite.username, "alice");
        assert_eq!(favorite.password, "");
    }
}
