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

//! Shapes of the records handed to the engine by its collaborators: the
//! favorites store, the public directory and local network discovery.

use serde::{Deserialize, Serialize};

use crate::registry::{HostSpec, ServerIdentity};

/// Default port for voice servers.
pub const DEFAULT_PORT: u16 = 64738;

/// An entry in the favorites store. Empty strings mean "not set".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FavoriteServer {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub url: String,
}

/// An entry of the merged public directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicServer {
    pub name: String,
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub country_code: String,
    #[serde(default)]
    pub continent_code: String,
    #[serde(default)]
    pub has_valid_cert: bool,
}

/// A service reported by local network discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredService {
    pub service_name: String,
    pub discovery_key: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

impl From<FavoriteServer> for ServerIdentity {
    fn from(favorite: FavoriteServer) -> Self {
        Self {
            username: non_empty(favorite.username),
            password: non_empty(favorite.password),
            url: non_empty(favorite.url),
            ..ServerIdentity::new(favorite.name, HostSpec::parse(&favorite.host), favorite.port)
        }
    }
}

impl From<PublicServer> for ServerIdentity {
    fn from(public: PublicServer) -> Self {
        Self {
            url: non_empty(public.url),
            country: non_empty(public.country),
            country_code: non_empty(public.country_code),
            continent_code: non_empty(public.continent_code),
            has_valid_cert: public.has_valid_cert,
            ..ServerIdentity::new(public.name, HostSpec::Name(public.ip), public.port)
        }
    }
}

impl From<DiscoveredService> for ServerIdentity {
    fn from(service: DiscoveredService) -> Self {
        ServerIdentity::new(
            service.service_name,
            HostSpec::Discovery(service.discovery_key),
            service.port,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_favorite_into_identity() {
        let identity = ServerIdentity::from(FavoriteServer {
            name: "Home".to_string(),
            host: "@den".to_string(),
            port: 1234,
            username: "alice".to_string(),
            password: String::new(),
            url: String::new(),
        });

        assert_eq!(identity.host, HostSpec::Discovery("den".to_string()));
        assert_eq!(identity.username.as_deref(), Some("alice"));
        assert_eq!(identity.password, None);
        assert_eq!(identity.port, 1234);
    }

    #[test]
    fn test_public_into_identity() {
        let identity = ServerIdentity::from(PublicServer {
            name: "Hub".to_string(),
            ip: "192.0.2.1".to_string(),
            port: 64738,
            url: "https://hub.example".to_string(),
            country: "Germany".to_string(),
            country_code: "DE".to_string(),
            continent_code: "EU".to_string(),
            has_valid_cert: true,
        });

        assert_eq!(identity.host, HostSpec::Name("192.0.2.1".to_string()));
        assert_eq!(identity.country_code.as_deref(), Some("DE"));
        assert_eq!(identity.username, None);
        assert!(identity.has_valid_cert);
    }

    #[test]
    fn test_discovered_service_is_discovery_bound() {
        let identity = ServerIdentity::from(DiscoveredService {
            service_name: "Living Room".to_string(),
            discovery_key: "living-room".to_string(),
            port: DEFAULT_PORT,
        });
        assert!(identity.host.is_discovery());
    }
}
