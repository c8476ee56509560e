use crate::backend::{DirectoryBackend, DynBackend};
use crate::error::Error;
use crate::geo::{GeoDatabase, GeoDatabaseFiles};
use ipnetwork::IpNetwork;
use lazy_static::lazy_static;
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use std::fs::File;
use std::io::BufReader;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub type Shared = Arc<Config>;

fn default_reconcile_interval() -> Duration {
    Duration::from_secs(10)
}

/// Where zone, service and monitor definitions are read from.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum BackendConfig {
    Directory { path: PathBuf },
}

impl BackendConfig {
    #[must_use]
    pub fn build(&self) -> DynBackend {
        match self {
            BackendConfig::Directory { path } => Arc::new(DirectoryBackend::new(path)),
        }
    }
}

#[serde_as]
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub api_bind_addr: SocketAddr,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub api_timeout: Duration,
    pub dns_udp_bind_addr: SocketAddr,
    pub dns_tcp_bind_addr: SocketAddr,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub dns_tcp_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval: Duration,
    pub backends: Vec<BackendConfig>,
    /// MaxMind City database(s) for the [`GeoDatabase`]. Without one, geolocation services always
    /// answer with their `DEFAULT` location.
    #[serde(default)]
    pub geo_database: Option<GeoDatabaseFiles>,
    /// Answer for `hostname.bind` and `id.server` CHAOS queries.
    #[serde(default)]
    pub server_id: Option<String>,
}

lazy_static! {
    // NOTE(XXX): Once the "ip" feature has stabilized we can use Ipv6Addr.is_unique_local[0].
    //            Presently this feature is unstable so we home-roll. See also RFC 4193[1].
    // [0]: https://doc.rust-lang.org/std/net/struct.Ipv6Addr.html#method.is_unique_local
    // [1]: https://www.rfc-editor.org/rfc/rfc4193.html
    static ref IPV6_UNIQUE_LOCAL_NETWORK: IpNetwork = IpNetwork::from_str("fc00::/7").unwrap();
}

impl Config {
    /// Load a [`Config`] from the JSON file at the given path, or return an Error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IO`] or [`Error::InvalidJSON`] if the file can't be read or parsed, and
    /// [`Error::InsecureAPIBind`] if the status API would listen on a public address.
    pub fn try_from_file(p: impl AsRef<Path>) -> Result<Self, Error> {
        let f = File::open(p)?;
        let reader = BufReader::new(f);
        let conf: Config = serde_json::from_reader(reader)?;
        conf.bind_addr_is_secure()?;
        Ok(conf)
    }

    #[must_use]
    pub fn backends(&self) -> Vec<DynBackend> {
        self.backends.iter().map(BackendConfig::build).collect()
    }

    /// Load the configured geo database, or an empty one.
    ///
    /// # Errors
    ///
    /// Returns the error of [`GeoDatabase::open`].
    pub fn geo_database(&self) -> Result<GeoDatabase, Error> {
        match &self.geo_database {
            Some(files) => GeoDatabase::open(files),
            None => Ok(GeoDatabase::empty()),
        }
    }

    fn bind_addr_is_secure(&self) -> Result<(), Error> {
        match self.api_bind_addr {
            SocketAddr::V4(v4_addr) => {
                let ip = v4_addr.ip();
                if !ip.is_loopback() && !ip.is_private() {
                    return Err(Error::InsecureAPIBind(IpAddr::V4(*ip)));
                }
                Ok(())
            }
            SocketAddr::V6(v6_addr) => {
                let ip = v6_addr.ip();
                if !ip.is_loopback() && !IPV6_UNIQUE_LOCAL_NETWORK.contains(IpAddr::V6(*ip)) {
                    return Err(Error::InsecureAPIBind(IpAddr::V6(*ip)));
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(api_bind_addr: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "api_bind_addr": "{api_bind_addr}",
                "api_timeout": 5,
                "dns_udp_bind_addr": "127.0.0.1:5353",
                "dns_tcp_bind_addr": "127.0.0.1:5353",
                "dns_tcp_timeout": 10,
                "backends": [ {{ "type": "directory", "path": "/var/lib/rabbitdns" }} ],
                "server_id": "ns1"
            }}"#
        )
        .unwrap();
        file
    }

    #[test]
    fn loads_with_defaults() {
        let file = write_config("127.0.0.1:3000");
        let config = Config::try_from_file(file.path()).unwrap();
        assert_eq!(config.reconcile_interval, Duration::from_secs(10));
        assert_eq!(config.dns_tcp_timeout, Duration::from_secs(10));
        assert_eq!(
            config.backends,
            vec![BackendConfig::Directory {
                path: PathBuf::from("/var/lib/rabbitdns")
            }]
        );
        assert_eq!(config.backends().len(), 1);
        assert_eq!(config.server_id.as_deref(), Some("ns1"));
        assert!(config.geo_database().unwrap().is_empty());
    }

    #[test]
    fn api_bind_addr_must_be_private() {
        for addr in ["10.0.0.1:3000", "[::1]:3000", "[fd00::1]:3000"] {
            assert!(Config::try_from_file(write_config(addr).path()).is_ok());
        }
        for addr in ["192.0.2.1:3000", "[2001:db8::1]:3000"] {
            assert!(matches!(
                Config::try_from_file(write_config(addr).path()),
                Err(Error::InsecureAPIBind(_))
            ));
        }
    }

    #[test]
    fn geo_database_must_open() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "api_bind_addr": "127.0.0.1:3000",
                "api_timeout": 5,
                "dns_udp_bind_addr": "127.0.0.1:5353",
                "dns_tcp_bind_addr": "127.0.0.1:5353",
                "dns_tcp_timeout": 10,
                "backends": [],
                "geo_database": {{ "ipv4": "/nonexistent/city-v4.mmdb" }}
            }}"#
        )
        .unwrap();
        let config = Config::try_from_file(file.path()).unwrap();
        assert_eq!(
            config.geo_database,
            Some(GeoDatabaseFiles::PerFamily {
                ipv4: Some(PathBuf::from("/nonexistent/city-v4.mmdb")),
                ipv6: None,
            })
        );
        assert!(matches!(
            config.geo_database(),
            Err(Error::InvalidGeoDatabase { .. })
        ));
    }
}
