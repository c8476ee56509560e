//! Storage backends for zone, service and monitor definitions.
//!
//! A backend only supplies listings (name and modification time) and the raw bytes of a single
//! item. Parsing and validation happen in the [zone][crate::zone], [service][crate::service] and
//! [monitor][crate::monitor] managers.
//!
//! Two implementations are provided, [`file::DirectoryBackend`] and [`memory::InMemoryBackend`].
//! The former reads a directory tree on every reconciliation pass. The latter is not durable and is
//! mostly useful for embedding and tests.

use crate::error::Error;
use serde::Serialize;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::SystemTime;

pub mod file;
pub mod memory;

#[allow(clippy::module_name_repetitions)]
pub use file::DirectoryBackend;
#[allow(clippy::module_name_repetitions)]
pub use memory::InMemoryBackend;

/// `DynBackend` is a type alias for a [`Backend`] shared between the controller and its
/// reconciliation task.
#[allow(clippy::module_name_repetitions)]
pub type DynBackend = Arc<dyn Backend>;

/// The three kinds of item a backend stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Zone,
    Service,
    Monitor,
}

impl Kind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Zone => "zone",
            Kind::Service => "service",
            Kind::Monitor => "monitor",
        }
    }
}

impl Display for Kind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One item in a backend listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub name: String,
    pub last_modified: SystemTime,
}

/// An async trait describing a source of zone, service and monitor definitions.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// A short human readable description used in logs.
    fn describe(&self) -> String;

    /// List every item of `kind` with its modification time.
    async fn list(&self, kind: Kind) -> Result<Vec<Listing>, Error>;

    /// Read the content of a single item.
    async fn get(&self, kind: Kind, name: &str) -> Result<Vec<u8>, Error>;

    async fn list_zones(&self) -> Result<Vec<Listing>, Error> {
        self.list(Kind::Zone).await
    }

    async fn get_zone(&self, name: &str) -> Result<Vec<u8>, Error> {
        self.get(Kind::Zone, name).await
    }

    async fn list_services(&self) -> Result<Vec<Listing>, Error> {
        self.list(Kind::Service).await
    }

    async fn get_service(&self, name: &str) -> Result<Vec<u8>, Error> {
        self.get(Kind::Service, name).await
    }

    async fn list_monitors(&self) -> Result<Vec<Listing>, Error> {
        self.list(Kind::Monitor).await
    }

    async fn get_monitor(&self, name: &str) -> Result<Vec<u8>, Error> {
        self.get(Kind::Monitor, name).await
    }
}

/// A unit that couldn't be loaded during a reconciliation pass. The previously loaded version of
/// the unit, if any, stays in effect.
#[derive(Debug)]
pub struct LoadFailure {
    pub kind: Kind,
    /// The item name, or the backend description when the listing itself failed.
    pub name: String,
    pub error: Error,
}

impl LoadFailure {
    pub(crate) fn new(kind: Kind, name: impl Into<String>, error: Error) -> Self {
        LoadFailure {
            kind,
            name: name.into(),
            error,
        }
    }
}

impl Display for LoadFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {:?}: {}", self.kind, self.name, self.error)
    }
}
