//! Zones, the zone index and zone reconciliation.
//!
//! Each zone is parsed from a master file into its own [`RecordTree`]. The [`ZoneIndex`] maps query
//! names to the most specific zone serving them and is rebuilt after every reconciliation pass.

use crate::backend::{DynBackend, Kind, LoadFailure, Listing};
use crate::error::Error;
use crate::service::{ClientContext, ServiceManager};
use crate::tree::{self, LabelTree};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::info;
use trust_dns_proto::op::ResponseCode;
use trust_dns_proto::rr::{Name, Record, RecordType};

pub mod parser;
pub mod records;

pub use records::{RecordTree, DNAME, DYNA};

/// A question for the zone data, decoded from the wire by the [DNS layer][crate::dns].
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    pub qname: Name,
    pub qtype: RecordType,
    pub client: ClientContext,
}

/// The sections of an answer, to be encoded by the [DNS layer][crate::dns].
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceResponse {
    pub rcode: ResponseCode,
    /// Cleared for referrals.
    pub authoritative: bool,
    pub answer: Vec<Record>,
    pub authority: Vec<Record>,
    pub additional: Vec<Record>,
}

impl Default for ResourceResponse {
    fn default() -> Self {
        ResourceResponse {
            rcode: ResponseCode::NoError,
            authoritative: false,
            answer: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        }
    }
}

impl ResourceResponse {
    /// The response for names outside every loaded zone.
    #[must_use]
    pub fn refused() -> Self {
        ResourceResponse {
            rcode: ResponseCode::Refused,
            ..Self::default()
        }
    }
}

/// A loaded zone.
#[derive(Debug)]
pub struct Zone {
    pub origin: Name,
    pub last_modified: SystemTime,
    pub records: RecordTree,
    /// Services named by the zone's dynamic records.
    pub services: BTreeSet<String>,
}

impl Zone {
    /// Parse and verify a zone from master file text. `services` supplies the record type each
    /// named service answers with.
    ///
    /// # Errors
    ///
    /// Returns parse and verification errors, or [`Error::ServiceUndefined`] when a dynamic
    /// record names a service that isn't loaded.
    pub fn parse(
        origin: Name,
        text: &str,
        last_modified: SystemTime,
        services: &ServiceManager,
    ) -> Result<Self, Error> {
        let parsed = parser::parse(text, &origin)?;
        let records = RecordTree::build(origin.clone(), parsed, |service| {
            services.record_type(service)
        })?;
        let services = records.services().into_iter().collect();
        Ok(Zone {
            origin,
            last_modified,
            records,
            services,
        })
    }
}

/// Finds the zone responsible for a name.
#[derive(Debug, Clone, Default)]
#[allow(clippy::module_name_repetitions)]
pub struct ZoneIndex {
    tree: LabelTree<Option<Arc<Zone>>>,
}

impl ZoneIndex {
    pub fn new(zones: impl IntoIterator<Item = Arc<Zone>>) -> Self {
        let mut tree = LabelTree::new();
        for zone in zones {
            let id = tree.insert(&tree::labels(&zone.origin));
            *tree.get_mut(id) = Some(zone);
        }
        ZoneIndex { tree }
    }

    /// The zone with the longest origin that `qname` is at or below.
    #[must_use]
    pub fn find_zone(&self, qname: &Name) -> Option<&Arc<Zone>> {
        self.tree
            .path(&tree::labels(qname))
            .into_iter()
            .rev()
            .find_map(|id| self.tree.get(id).as_ref())
    }

    pub fn zones(&self) -> impl Iterator<Item = &Arc<Zone>> {
        self.tree.iter().filter_map(|(_, zone)| zone.as_ref())
    }
}

/// A zone as reported by the status API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ZoneStatus {
    pub origin: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_modified: time::OffsetDateTime,
    /// False when the latest version in the backend was rejected and an older one is served.
    pub valid: bool,
    pub services: Vec<String>,
}

/// Owns the loaded zones.
#[derive(Debug, Default)]
#[allow(clippy::module_name_repetitions)]
pub struct ZoneManager {
    zones: HashMap<Name, Arc<Zone>>,
    rejected: HashSet<Name>,
    present: HashSet<Name>,
    listing_complete: bool,
}

impl ZoneManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, origin: &Name) -> Option<&Arc<Zone>> {
        self.zones.get(&origin.to_lowercase())
    }

    /// Build a fresh index of the loaded zones.
    #[must_use]
    pub fn index(&self) -> ZoneIndex {
        ZoneIndex::new(self.zones.values().cloned())
    }

    #[must_use]
    pub fn statuses(&self) -> Vec<ZoneStatus> {
        let mut statuses: Vec<ZoneStatus> = self
            .zones
            .values()
            .map(|zone| ZoneStatus {
                origin: zone.origin.to_string(),
                last_modified: zone.last_modified.into(),
                valid: !self.rejected.contains(&zone.origin.to_lowercase()),
                services: zone.services.iter().cloned().collect(),
            })
            .collect();
        statuses.sort_by(|a, b| a.origin.cmp(&b.origin));
        statuses
    }

    /// Install `zone`, replacing any zone with the same origin, and move the service usage
    /// records from the replaced version to the new one.
    pub fn insert(&mut self, zone: Zone, services: &mut ServiceManager) {
        let origin = zone.origin.to_lowercase();
        let previous = self
            .zones
            .get(&origin)
            .map(|previous| previous.services.clone())
            .unwrap_or_default();
        for added in zone.services.difference(&previous) {
            services.register_service(added, &origin);
        }
        for removed in previous.difference(&zone.services) {
            services.unregister_service(removed, &origin);
        }
        self.rejected.remove(&origin);
        self.zones.insert(origin, Arc::new(zone));
    }

    fn origin(name: &str) -> Result<Name, Error> {
        let mut origin = Name::from_ascii(name)?;
        origin.set_fqdn(true);
        Ok(origin.to_lowercase())
    }

    /// Load new and changed zones from `backends`. A zone that fails to load leaves its previous
    /// version in place. The first backend listing an origin wins.
    pub async fn reconcile(
        &mut self,
        backends: &[DynBackend],
        services: &mut ServiceManager,
    ) -> Vec<LoadFailure> {
        let mut failures = Vec::new();
        self.present.clear();
        self.listing_complete = true;

        for backend in backends {
            let listings = match backend.list_zones().await {
                Ok(listings) => listings,
                Err(error) => {
                    self.listing_complete = false;
                    failures.push(LoadFailure::new(Kind::Zone, backend.describe(), error));
                    continue;
                }
            };
            for Listing {
                name,
                last_modified,
            } in listings
            {
                let origin = match Self::origin(&name) {
                    Ok(origin) => origin,
                    Err(error) => {
                        failures.push(LoadFailure::new(Kind::Zone, name, error));
                        continue;
                    }
                };
                if !self.present.insert(origin.clone()) {
                    continue;
                }
                if self
                    .zones
                    .get(&origin)
                    .is_some_and(|current| current.last_modified == last_modified)
                {
                    continue;
                }
                let loaded = match backend.get_zone(&name).await {
                    Ok(content) => String::from_utf8(content)
                        .map_err(Error::from)
                        .and_then(|text| {
                            Zone::parse(origin.clone(), &text, last_modified, services)
                        }),
                    Err(error) => Err(error),
                };
                match loaded {
                    Ok(zone) => {
                        info!(zone = %origin, "loaded zone");
                        self.insert(zone, services);
                    }
                    Err(error) => {
                        self.rejected.insert(origin);
                        failures.push(LoadFailure::new(Kind::Zone, name, error));
                    }
                }
            }
        }
        failures
    }

    /// Remove zones missing from the last reconciliation pass, releasing their service usage.
    pub fn prune(&mut self, services: &mut ServiceManager) {
        if !self.listing_complete {
            return;
        }
        let missing: Vec<Name> = self
            .zones
            .keys()
            .filter(|origin| !self.present.contains(*origin))
            .cloned()
            .collect();
        for origin in missing {
            if let Some(zone) = self.zones.remove(&origin) {
                for service in &zone.services {
                    services.unregister_service(service, &origin);
                }
                info!(zone = %origin, "removed zone");
            }
        }
        self.rejected.retain(|origin| self.present.contains(origin));
    }
}
