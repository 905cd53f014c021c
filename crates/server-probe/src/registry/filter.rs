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

//! Search filter applied to listed records.

use serde::{Deserialize, Serialize};

use super::ServerRecord;

/// Which records a filter lets through besides the text criteria.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterMode {
    #[default]
    All,
    /// Only records with a latency measurement.
    Reachable,
    /// Only records reporting at least one user.
    Populated,
}

/// Name / location / reachability filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerFilter {
    /// Case-insensitive substring of the display name.
    pub name_query: Option<String>,
    /// Country code, compared case-insensitively.
    pub country_code: Option<String>,
    pub mode: FilterMode,
}

impl ServerFilter {
    #[must_use]
    pub fn matches(&self, record: &ServerRecord) -> bool {
        if let Some(query) = self.name_query.as_deref().filter(|q| !q.is_empty()) {
            if !record
                .name()
                .to_lowercase()
                .contains(&query.to_lowercase())
            {
                return false;
            }
        }

        if let Some(code) = self.country_code.as_deref().filter(|c| !c.is_empty()) {
            let matches_code = record
                .identity
                .country_code
                .as_deref()
                .is_some_and(|own| own.eq_ignore_ascii_case(code));
            if !matches_code {
                return false;
            }
        }

        match self.mode {
            FilterMode::All => true,
            FilterMode::Reachable => record.stats().has_latency(),
            FilterMode::Populated => record.population().users > 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PingReply, PingRequest};
    use crate::registry::{Category, HostSpec, RecordId, ServerIdentity};
    use crate::stats::HysteresisConfig;

    fn public(name: &str, country_code: &str) -> ServerRecord {
        let mut identity = ServerIdentity::new(name, HostSpec::parse("192.0.2.1"), 64738);
        identity.country_code = Some(country_code.to_string());
        ServerRecord::new(RecordId::new(0, 0), Category::Public, identity)
    }

    #[test]
    fn test_default_matches_everything() {
        assert!(ServerFilter::default().matches(&public("Anything", "DE")));
    }

    #[test]
    fn test_name_query() {
        let filter = ServerFilter {
            name_query: Some("gaming".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&public("Nordic Gaming Hub", "SE")));
        assert!(!filter.matches(&public("Book Club", "SE")));
    }

    #[test]
    fn test_country_code() {
        let filter = ServerFilter {
            country_code: Some("de".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&public("Berlin", "DE")));
        assert!(!filter.matches(&public("Paris", "FR")));
    }

    #[test]
    fn test_reachable_and_populated_modes() {
        let reachable = ServerFilter {
            mode: FilterMode::Reachable,
            ..Default::default()
        };
        let populated = ServerFilter {
            mode: FilterMode::Populated,
            ..Default::default()
        };

        let mut record = public("Quiet", "US");
        assert!(!reachable.matches(&record));

        let request = PingRequest {
            token: 1,
            timestamp_us: 0,
        };
        record.apply_reply(
            15_000,
            &PingReply::answering(request, 0, 10, 0),
            &HysteresisConfig::default(),
        );
        assert!(reachable.matches(&record));
        assert!(!populated.matches(&record));

        record.apply_reply(
            15_000,
            &PingReply::answering(request, 2, 10, 0),
            &HysteresisConfig::default(),
        );
        assert!(populated.matches(&record));
    }
}
