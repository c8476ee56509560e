//! IP geolocation used by the geolocation service strategy.
//!
//! Locations come from MaxMind GeoIP2 / GeoLite2 City databases (`.mmdb`). A single file serves
//! both address families, or separate files can be given per family:
//!
//! ```json
//! "geo_database": "/var/lib/GeoIP/GeoLite2-City.mmdb"
//! "geo_database": { "ipv4": "/var/lib/GeoIP/city-v4.mmdb", "ipv6": "/var/lib/GeoIP/city-v6.mmdb" }
//! ```
//!
//! The continent `code`, the country `iso_code` and every subdivision `iso_code` of the matching
//! City entry are the codes geolocation strategies match their locations against.

use crate::error::Error;
use ipnetwork::IpNetwork;
use maxminddb::{geoip2, MaxMindDBError, Reader};
use serde::Deserialize;
use std::fmt::{Debug, Formatter};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Where the MaxMind databases live.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum GeoDatabaseFiles {
    Single(PathBuf),
    PerFamily {
        #[serde(default)]
        ipv4: Option<PathBuf>,
        #[serde(default)]
        ipv6: Option<PathBuf>,
    },
}

/// A precedence tier of the geolocation strategy, most specific first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Subdivision,
    Country,
    Continent,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Subdivision, Tier::Country, Tier::Continent];
}

/// The location of an address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    pub continent: Option<String>,
    pub country: Option<String>,
    pub subdivisions: Vec<String>,
}

impl Location {
    /// The location codes within `tier`.
    #[must_use]
    pub fn codes(&self, tier: Tier) -> Vec<&str> {
        match tier {
            Tier::Subdivision => self.subdivisions.iter().map(String::as_str).collect(),
            Tier::Country => self.country.as_deref().into_iter().collect(),
            Tier::Continent => self.continent.as_deref().into_iter().collect(),
        }
    }
}

impl From<geoip2::City<'_>> for Location {
    fn from(city: geoip2::City<'_>) -> Self {
        Location {
            continent: city.continent.and_then(|c| c.code).map(str::to_string),
            country: city.country.and_then(|c| c.iso_code).map(str::to_string),
            subdivisions: city
                .subdivisions
                .unwrap_or_default()
                .into_iter()
                .filter_map(|s| s.iso_code)
                .map(str::to_string)
                .collect(),
        }
    }
}

/// A statically configured network, used to locate addresses without a MaxMind database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoRecord {
    pub network: IpNetwork,
    pub continent: Option<String>,
    pub country: Option<String>,
    pub subdivisions: Vec<String>,
}

impl GeoRecord {
    fn location(&self) -> Location {
        Location {
            continent: self.continent.clone(),
            country: self.country.clone(),
            subdivisions: self.subdivisions.clone(),
        }
    }
}

type MaxMindReader = Arc<Reader<Vec<u8>>>;

#[derive(Default)]
#[allow(clippy::module_name_repetitions)]
pub struct GeoDatabase {
    ipv4: Option<MaxMindReader>,
    ipv6: Option<MaxMindReader>,
    /// Sorted by descending prefix length.
    records: Vec<GeoRecord>,
}

impl Debug for GeoDatabase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoDatabase")
            .field("ipv4", &self.ipv4.is_some())
            .field("ipv6", &self.ipv6.is_some())
            .field("records", &self.records.len())
            .finish()
    }
}

fn open_reader(path: &Path) -> Result<MaxMindReader, Error> {
    let reader = Reader::open_readfile(path).map_err(|source| Error::InvalidGeoDatabase {
        path: path.to_path_buf(),
        source,
    })?;
    info!(
        path = %path.display(),
        database_type = reader.metadata.database_type.as_str(),
        "opened geo database"
    );
    Ok(Arc::new(reader))
}

impl GeoDatabase {
    /// A database that locates nothing. Geolocation services always use their `DEFAULT`.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// A database locating addresses by the longest matching network of `records`.
    #[must_use]
    pub fn from_records(mut records: Vec<GeoRecord>) -> Self {
        records.sort_by_key(|record| std::cmp::Reverse(record.network.prefix()));
        GeoDatabase {
            records,
            ..Self::default()
        }
    }

    /// Open the configured MaxMind databases.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidGeoDatabase`] if a file can't be read or isn't a MaxMind database.
    pub fn open(files: &GeoDatabaseFiles) -> Result<Self, Error> {
        let (ipv4, ipv6) = match files {
            GeoDatabaseFiles::Single(path) => {
                let reader = open_reader(path)?;
                (Some(reader.clone()), Some(reader))
            }
            GeoDatabaseFiles::PerFamily { ipv4, ipv6 } => (
                ipv4.as_deref().map(open_reader).transpose()?,
                ipv6.as_deref().map(open_reader).transpose()?,
            ),
        };
        Ok(GeoDatabase {
            ipv4,
            ipv6,
            records: Vec::new(),
        })
    }

    /// The location of `addr`, if any source knows it.
    #[must_use]
    pub fn lookup(&self, addr: IpAddr) -> Option<Location> {
        let reader = match addr {
            IpAddr::V4(_) => self.ipv4.as_ref(),
            IpAddr::V6(_) => self.ipv6.as_ref(),
        };
        if let Some(location) = reader.and_then(|reader| locate(reader, addr)) {
            return Some(location);
        }
        self.records
            .iter()
            .find(|record| record.network.contains(addr))
            .map(GeoRecord::location)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ipv4.is_none() && self.ipv6.is_none() && self.records.is_empty()
    }
}

fn locate(reader: &Reader<Vec<u8>>, addr: IpAddr) -> Option<Location> {
    match reader.lookup::<geoip2::City>(addr) {
        Ok(city) => Some(city.into()),
        Err(MaxMindDBError::AddressNotFoundError(_)) => None,
        Err(err) => {
            debug!(%addr, %err, "geo lookup failed");
            None
        }
    }
}
