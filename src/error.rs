//! Error types.

use std::net::IpAddr;
use std::path::PathBuf;
use trust_dns_proto::error::ProtoError;
use trust_dns_proto::rr::{Name, RecordType};

/// Error enumerates the possible rabbitdns error states.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Returned when a zone master file line can't be parsed.
    #[error("zone parse error at line {line}: {message}")]
    ZoneParse { line: usize, message: String },

    /// Returned when a zone contains a record whose owner is not at or below the zone origin.
    #[error("record owner \"{0}\" is outside of the zone")]
    OutOfZone(Name),

    /// Returned when the zone origin node holds no records at all.
    #[error("apex node is empty")]
    EmptyApex,

    /// Returned when the zone apex has no SOA record.
    #[error("SOA record is missing at the apex")]
    MissingSOA,

    /// Returned when the zone apex has more than one SOA record.
    #[error("more than one SOA record at the apex")]
    DuplicateSOA,

    /// Returned when the zone apex has no NS record.
    #[error("NS record is missing at the apex")]
    MissingApexNS,

    /// Returned when a name holds more than one CNAME record.
    #[error("more than one CNAME record at \"{0}\"")]
    DuplicateCNAME(Name),

    /// Returned when a CNAME shares its owner with anything but a DNAME.
    #[error("CNAME at \"{0}\" coexists with other data")]
    CNAMEConflict(Name),

    /// Returned when a name holds more than one DNAME record.
    #[error("more than one DNAME record at \"{0}\"")]
    DuplicateDNAME(Name),

    /// Returned when names exist below a DNAME owner.
    #[error("DNAME at \"{0}\" has names below it")]
    DNAMEHasChildren(Name),

    /// Returned when a name holds more than one dynamic record answering the same type.
    #[error("more than one dynamic record of the same type at \"{0}\"")]
    DuplicateDynamic(Name),

    /// Returned when a dynamic record or a resolution names a service that isn't loaded.
    #[error("service \"{0}\" is not defined")]
    ServiceUndefined(String),

    /// Returned when a service is resolved for a record type other than the one it serves.
    #[error("service \"{service}\" serves {expected} records, not {requested}")]
    ServiceTypeMismatch {
        service: String,
        expected: RecordType,
        requested: RecordType,
    },

    /// Returned when a service update would change the record type of a service zones rely on.
    #[error("service \"{0}\" is referenced by zones and can't change its record type")]
    ServiceTypeInUse(String),

    /// Returned when a service definition is structurally invalid.
    #[error("invalid service definition: {0}")]
    InvalidService(String),

    /// Returned when a service endpoint refers to a monitor that isn't loaded.
    #[error("monitor \"{0}\" is not defined")]
    MonitorUndefined(String),

    /// Returned when a monitor definition is structurally invalid.
    #[error("invalid monitor definition: {0}")]
    InvalidMonitor(String),

    /// Returned when a referral is required but no delegation point can be found above a
    /// non-authoritative node.
    #[error("zone cut not found")]
    ZoneCutNotFound,

    /// Returned when a backend has no item with the requested name.
    #[error("{kind} \"{name}\" not found in backend")]
    NotFound { kind: &'static str, name: String },

    /// Returned when the [`Config::api_bind_addr`][`crate::config::Config::api_bind_addr`] is
    /// not a loopback address, or an address within a private network space. The status API
    /// exposes internal state and is only intended for private networks.
    #[error("API bind address ({0}) must be a loopback or private IP")]
    InsecureAPIBind(IpAddr),

    /// Returned when a generic IO error occurs.
    #[error("an IO error occurred")]
    IO(#[from] std::io::Error),

    /// Returned when backend content isn't valid UTF-8 text.
    #[error("content is not valid UTF-8")]
    InvalidUTF8(#[from] std::string::FromUtf8Error),

    /// Returned when processing the daemon [`Config`][crate::config::Config] from disk fails due to
    /// invalid JSON content.
    #[error("invalid JSON")]
    InvalidJSON(#[from] serde_json::Error),

    /// Returned when a configured [geo database][crate::geo::GeoDatabase] can't be opened as a
    /// MaxMind database.
    #[error("cannot open geo database {}: {source}", .path.display())]
    InvalidGeoDatabase {
        path: PathBuf,
        source: maxminddb::MaxMindDBError,
    },

    /// Returned when a service or monitor definition is not valid YAML.
    #[error("invalid YAML: {0}")]
    InvalidYAML(#[from] serde_yaml::Error),

    /// Returned when a generic DNS protocol error occurs.
    #[error("DNS error: {0}")]
    DNSError(#[from] ProtoError),
}

impl Error {
    pub(crate) fn zone_parse(line: usize, message: impl Into<String>) -> Self {
        Error::ZoneParse {
            line,
            message: message.into(),
        }
    }
}
