//! Service routing.
//!
//! A dynamic record in a zone names a service. At query time the service's [`Strategy`] turns the
//! [`ClientContext`] into addresses, skipping endpoints whose [monitor][crate::monitor] reports
//! them down.

use crate::backend::{DynBackend, Kind, LoadFailure, Listing};
use crate::error::Error;
use crate::geo::GeoDatabase;
use crate::monitor::{EntryKey, MonitorManager, Registration};
use ipnetwork::IpNetwork;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{info, warn};
use trust_dns_proto::rr::{Name, RData, RecordType};

pub mod config;

#[allow(clippy::module_name_repetitions)]
pub use config::{Endpoint, ServiceConfig, Strategy};

/// What the routing strategies know about the client asking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientContext {
    /// The address the query came from.
    pub source: IpAddr,
    /// EDNS client subnet hints, in the order they were given.
    pub subnets: Vec<IpNetwork>,
}

impl ClientContext {
    #[must_use]
    pub fn new(source: IpAddr) -> Self {
        ClientContext {
            source,
            subnets: Vec::new(),
        }
    }

    /// Addresses to geolocate, most preferred first: the network address of each subnet hint,
    /// then the source address.
    pub fn candidates(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.subnets
            .iter()
            .map(IpNetwork::network)
            .chain(std::iter::once(self.source))
    }
}

/// Resolves the service named by a dynamic record.
pub trait ServiceResolver {
    /// Resolve `service` for `client` into record data of type `rtype`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceUndefined`] for unknown services and
    /// [`Error::ServiceTypeMismatch`] when the service doesn't serve `rtype`.
    fn resolve(
        &self,
        service: &str,
        rtype: RecordType,
        client: &ClientContext,
    ) -> Result<Vec<RData>, Error>;
}

/// An immutable view of the loaded services, used on the query path.
#[derive(Debug, Clone, Default)]
#[allow(clippy::module_name_repetitions)]
pub struct ServiceTable {
    services: HashMap<String, Arc<ServiceConfig>>,
    geo: Arc<GeoDatabase>,
}

impl ServiceResolver for ServiceTable {
    fn resolve(
        &self,
        service: &str,
        rtype: RecordType,
        client: &ClientContext,
    ) -> Result<Vec<RData>, Error> {
        let config = self
            .services
            .get(service)
            .ok_or_else(|| Error::ServiceUndefined(service.to_string()))?;
        if config.rtype != rtype {
            return Err(Error::ServiceTypeMismatch {
                service: service.to_string(),
                expected: config.rtype,
                requested: rtype,
            });
        }
        Ok(config.resolve(client, &self.geo))
    }
}

/// A service as reported by the status API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub rrtype: String,
    pub zones: Vec<String>,
    pub endpoints: Vec<EndpointStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointStatus {
    pub id: String,
    pub address: IpAddr,
    pub monitor: Option<String>,
    pub up: bool,
}

fn monitor_keys(config: &ServiceConfig) -> HashSet<EntryKey> {
    config
        .endpoints()
        .into_iter()
        .filter_map(|endpoint| {
            endpoint.monitor.as_ref().map(|monitor| EntryKey {
                monitor: monitor.clone(),
                service: config.name.clone(),
                endpoint: endpoint.id.clone(),
            })
        })
        .collect()
}

/// Owns the loaded services and tracks which zones use them.
#[allow(clippy::module_name_repetitions)]
pub struct ServiceManager {
    services: HashMap<String, Arc<ServiceConfig>>,
    present: HashSet<String>,
    listing_complete: bool,
    using: HashMap<String, BTreeSet<Name>>,
    geo: Arc<GeoDatabase>,
}

impl ServiceManager {
    #[must_use]
    pub fn new(geo: Arc<GeoDatabase>) -> Self {
        ServiceManager {
            services: HashMap::new(),
            present: HashSet::new(),
            listing_complete: false,
            using: HashMap::new(),
            geo,
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<ServiceConfig>> {
        self.services.get(name)
    }

    /// The record type served by `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceUndefined`] if the service isn't loaded.
    pub fn record_type(&self, name: &str) -> Result<RecordType, Error> {
        self.services
            .get(name)
            .map(|config| config.rtype)
            .ok_or_else(|| Error::ServiceUndefined(name.to_string()))
    }

    /// Record that `zone` has dynamic records naming `service`.
    pub fn register_service(&mut self, service: &str, zone: &Name) {
        self.using
            .entry(service.to_string())
            .or_default()
            .insert(zone.clone());
    }

    /// Drop the usage of `service` by `zone`.
    pub fn unregister_service(&mut self, service: &str, zone: &Name) {
        if let Some(zones) = self.using.get_mut(service) {
            zones.remove(zone);
            if zones.is_empty() {
                self.using.remove(service);
            }
        }
    }

    /// Zones currently using `service`.
    #[must_use]
    pub fn zone_references(&self, service: &str) -> Vec<&Name> {
        self.using
            .get(service)
            .map(|zones| zones.iter().collect())
            .unwrap_or_default()
    }

    /// Snapshot the loaded services for the query path.
    #[must_use]
    pub fn table(&self) -> ServiceTable {
        ServiceTable {
            services: self.services.clone(),
            geo: self.geo.clone(),
        }
    }

    #[must_use]
    pub fn statuses(&self) -> Vec<ServiceStatus> {
        let mut statuses: Vec<ServiceStatus> = self
            .services
            .values()
            .map(|config| ServiceStatus {
                name: config.name.clone(),
                rrtype: config.rtype.to_string(),
                zones: self
                    .zone_references(&config.name)
                    .into_iter()
                    .map(ToString::to_string)
                    .collect(),
                endpoints: config
                    .endpoints()
                    .into_iter()
                    .map(|endpoint| EndpointStatus {
                        id: endpoint.id.clone(),
                        address: endpoint.address,
                        monitor: endpoint.monitor.clone(),
                        up: endpoint.health.is_up(),
                    })
                    .collect(),
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Install `config`, replacing any service of the same name.
    ///
    /// Monitored endpoints are registered with `monitors`, and endpoints the previous version had
    /// but this one doesn't are unregistered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MonitorUndefined`] if an endpoint names an unknown monitor, or
    /// [`Error::ServiceTypeInUse`] if the record type changes while zones use the service. The
    /// previous version stays in effect.
    pub async fn insert(
        &mut self,
        config: ServiceConfig,
        monitors: &mut MonitorManager,
    ) -> Result<(), Error> {
        for endpoint in config.endpoints() {
            if let Some(monitor) = &endpoint.monitor {
                if !monitors.contains(monitor) {
                    return Err(Error::MonitorUndefined(monitor.clone()));
                }
            }
        }
        let previous = self.services.get(&config.name).cloned();
        if let Some(previous) = &previous {
            if previous.rtype != config.rtype && !self.zone_references(&config.name).is_empty() {
                return Err(Error::ServiceTypeInUse(config.name.clone()));
            }
        }

        let registrations = config
            .endpoints()
            .into_iter()
            .filter_map(|endpoint| {
                endpoint.monitor.as_ref().map(|monitor| Registration {
                    key: EntryKey {
                        monitor: monitor.clone(),
                        service: config.name.clone(),
                        endpoint: endpoint.id.clone(),
                    },
                    address: endpoint.address,
                    health: endpoint.health.clone(),
                })
            })
            .collect();
        monitors.register_endpoints(registrations).await?;
        if let Some(previous) = previous {
            let current = monitor_keys(&config);
            for key in monitor_keys(&previous).difference(&current) {
                monitors.unregister_endpoint(key).await;
            }
        }
        self.services.insert(config.name.clone(), Arc::new(config));
        Ok(())
    }

    /// Load new and changed services from `backends`. The first backend listing a name wins.
    pub async fn reconcile(
        &mut self,
        backends: &[DynBackend],
        monitors: &mut MonitorManager,
    ) -> Vec<LoadFailure> {
        let mut failures = Vec::new();
        self.present.clear();
        self.listing_complete = true;

        for backend in backends {
            let listings = match backend.list_services().await {
                Ok(listings) => listings,
                Err(error) => {
                    self.listing_complete = false;
                    failures.push(LoadFailure::new(Kind::Service, backend.describe(), error));
                    continue;
                }
            };
            for Listing {
                name,
                last_modified,
            } in listings
            {
                if !self.present.insert(name.clone()) {
                    continue;
                }
                if self
                    .services
                    .get(&name)
                    .is_some_and(|current| current.last_modified == last_modified)
                {
                    continue;
                }
                let loaded = match backend.get_service(&name).await {
                    Ok(content) => ServiceConfig::from_yaml(&name, &content, last_modified),
                    Err(error) => Err(error),
                };
                let inserted = match loaded {
                    Ok(config) => self.insert(config, monitors).await,
                    Err(error) => Err(error),
                };
                match inserted {
                    Ok(()) => info!(service = name, "loaded service"),
                    Err(error) => failures.push(LoadFailure::new(Kind::Service, name, error)),
                }
            }
        }
        failures
    }

    /// Remove services missing from the last reconciliation pass. A service still used by a
    /// zone is kept until the zone stops using it.
    pub async fn prune(&mut self, monitors: &mut MonitorManager) {
        if !self.listing_complete {
            return;
        }
        let missing: Vec<String> = self
            .services
            .keys()
            .filter(|name| !self.present.contains(*name))
            .cloned()
            .collect();
        for name in missing {
            let zones = self.zone_references(&name);
            if !zones.is_empty() {
                warn!(
                    service = name,
                    zones = zones.len(),
                    "service still in use, deferring removal"
                );
                continue;
            }
            if let Some(config) = self.services.remove(&name) {
                for key in monitor_keys(&config) {
                    monitors.unregister_endpoint(&key).await;
                }
                info!(service = name, "removed service");
            }
        }
    }
}
