//! Service definitions and routing strategies.
//!
//! ```yaml
//! rrtype: A
//! service:
//!   type: geolocation
//!   locations:
//!     "13":    { type: static, endpoints: [ { address: 192.0.2.1, monitor: web } ] }
//!     JP:      { type: static, endpoints: [ { name: jp1, address: 192.0.2.2 } ] }
//!     DEFAULT: { type: static, endpoints: [ { address: 198.51.100.1 } ] }
//! ```
//!
//! Strategies nest arbitrarily. Every geolocation strategy needs a `DEFAULT` location.

use crate::error::Error;
use crate::geo::{GeoDatabase, Tier};
use crate::monitor::Health;
use crate::service::ClientContext;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::time::SystemTime;
use trust_dns_proto::rr::{RData, RecordType};

/// Location key used when no configured location matches the client.
pub const DEFAULT_LOCATION: &str = "DEFAULT";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServiceDefinition {
    rrtype: String,
    service: StrategyDefinition,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
enum StrategyDefinition {
    Static {
        endpoints: Vec<EndpointDefinition>,
    },
    Geolocation {
        locations: BTreeMap<String, StrategyDefinition>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EndpointDefinition {
    #[serde(default)]
    name: Option<String>,
    address: IpAddr,
    #[serde(default)]
    monitor: Option<String>,
}

/// One address a service can answer with.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// Unique within the service: the location path followed by the endpoint name.
    pub id: String,
    pub address: IpAddr,
    pub monitor: Option<String>,
    pub health: Health,
}

/// How a service picks its answer for a client.
#[derive(Debug, Clone)]
pub enum Strategy {
    /// The healthy endpoints of a fixed list, in configuration order.
    Static(Vec<Endpoint>),
    /// A nested strategy chosen by the client's location.
    Geolocation {
        /// Keyed by upper-cased location code.
        locations: HashMap<String, Strategy>,
        default: Box<Strategy>,
    },
}

impl Strategy {
    fn build(
        definition: StrategyDefinition,
        path: &str,
        rtype: RecordType,
        ids: &mut HashSet<String>,
    ) -> Result<Self, Error> {
        match definition {
            StrategyDefinition::Static { endpoints } => {
                if endpoints.is_empty() {
                    return Err(Error::InvalidService(format!(
                        "static strategy at \"{path}\" has no endpoints"
                    )));
                }
                let endpoints = endpoints
                    .into_iter()
                    .map(|endpoint| {
                        let family_matches = matches!(
                            (rtype, endpoint.address),
                            (RecordType::A, IpAddr::V4(_)) | (RecordType::AAAA, IpAddr::V6(_))
                        );
                        if !family_matches {
                            return Err(Error::InvalidService(format!(
                                "endpoint {} can't be served in {rtype} records",
                                endpoint.address
                            )));
                        }
                        let name = endpoint
                            .name
                            .unwrap_or_else(|| endpoint.address.to_string());
                        let id = format!("{path}{name}");
                        if !ids.insert(id.clone()) {
                            return Err(Error::InvalidService(format!(
                                "duplicate endpoint \"{id}\""
                            )));
                        }
                        Ok(Endpoint {
                            id,
                            address: endpoint.address,
                            monitor: endpoint.monitor,
                            health: Health::default(),
                        })
                    })
                    .collect::<Result<Vec<_>, Error>>()?;
                Ok(Strategy::Static(endpoints))
            }
            StrategyDefinition::Geolocation { locations } => {
                let mut built = HashMap::new();
                for (key, nested) in locations {
                    let upper = key.to_ascii_uppercase();
                    let nested = Strategy::build(nested, &format!("{path}{upper}/"), rtype, ids)?;
                    if built.insert(upper, nested).is_some() {
                        return Err(Error::InvalidService(format!(
                            "location \"{key}\" is listed twice at \"{path}\""
                        )));
                    }
                }
                let default = built.remove(DEFAULT_LOCATION).ok_or_else(|| {
                    Error::InvalidService(format!(
                        "geolocation strategy at \"{path}\" has no {DEFAULT_LOCATION} location"
                    ))
                })?;
                Ok(Strategy::Geolocation {
                    locations: built,
                    default: Box::new(default),
                })
            }
        }
    }

    /// Every endpoint reachable from this strategy.
    pub fn endpoints(&self) -> Vec<&Endpoint> {
        match self {
            Strategy::Static(endpoints) => endpoints.iter().collect(),
            Strategy::Geolocation { locations, default } => {
                let mut endpoints = default.endpoints();
                for nested in locations.values() {
                    endpoints.extend(nested.endpoints());
                }
                endpoints
            }
        }
    }

    /// Pick the addresses to answer `client` with.
    ///
    /// Geolocation tries subdivision, then country, then continent codes. Within a tier the
    /// client's subnet hints are consulted in order before its source address.
    pub fn resolve(&self, client: &ClientContext, geo: &GeoDatabase) -> Vec<IpAddr> {
        match self {
            Strategy::Static(endpoints) => {
                let healthy: Vec<IpAddr> = endpoints
                    .iter()
                    .filter(|endpoint| endpoint.health.is_up())
                    .map(|endpoint| endpoint.address)
                    .collect();
                if healthy.is_empty() {
                    // Nothing is up: answering with everything beats answering with nothing.
                    endpoints.iter().map(|endpoint| endpoint.address).collect()
                } else {
                    healthy
                }
            }
            Strategy::Geolocation { locations, default } => {
                let located: Vec<_> = client
                    .candidates()
                    .filter_map(|addr| geo.lookup(addr))
                    .collect();
                for tier in Tier::ALL {
                    for record in &located {
                        for code in record.codes(tier) {
                            if let Some(nested) = locations.get(&code.to_ascii_uppercase()) {
                                return nested.resolve(client, geo);
                            }
                        }
                    }
                }
                default.resolve(client, geo)
            }
        }
    }
}

/// A loaded and validated service.
#[derive(Debug, Clone)]
#[allow(clippy::module_name_repetitions)]
pub struct ServiceConfig {
    pub name: String,
    pub rtype: RecordType,
    pub strategy: Strategy,
    pub last_modified: SystemTime,
}

impl ServiceConfig {
    /// Parse and validate a YAML service definition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidYAML`] for malformed documents and [`Error::InvalidService`] for
    /// unsupported record types, empty static lists, missing `DEFAULT` locations, duplicate
    /// endpoints, or addresses of the wrong family.
    pub fn from_yaml(name: &str, content: &[u8], last_modified: SystemTime) -> Result<Self, Error> {
        let definition: ServiceDefinition = serde_yaml::from_slice(content)?;
        let rtype = match definition.rrtype.to_ascii_uppercase().as_str() {
            "A" => RecordType::A,
            "AAAA" => RecordType::AAAA,
            other => {
                return Err(Error::InvalidService(format!(
                    "{name}: unsupported record type {other}"
                )))
            }
        };
        let strategy = Strategy::build(definition.service, "", rtype, &mut HashSet::new())
            .map_err(|err| match err {
                Error::InvalidService(message) => Error::InvalidService(format!("{name}: {message}")),
                other => other,
            })?;
        Ok(ServiceConfig {
            name: name.to_string(),
            rtype,
            strategy,
            last_modified,
        })
    }

    pub fn endpoints(&self) -> Vec<&Endpoint> {
        self.strategy.endpoints()
    }

    /// Resolve the service for `client` into record data of the service's type.
    pub fn resolve(&self, client: &ClientContext, geo: &GeoDatabase) -> Vec<RData> {
        self.strategy
            .resolve(client, geo)
            .into_iter()
            .map(|addr| match addr {
                IpAddr::V4(v4) => RData::A(v4),
                IpAddr::V6(v6) => RData::AAAA(v6),
            })
            .collect()
    }
}
