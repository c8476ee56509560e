//! Rabbit DNS
//!
//! An authoritative DNS server answering from static zone data and from *dynamic records* whose
//! answers are chosen per query by a routing strategy over health-checked endpoints.
//!
//! Zones, services and monitors are read from one or more [backends][backend] and kept in sync by
//! a periodic reconciliation pass in the [`Controller`]. A failed reload keeps the previous
//! version of a unit in service.
//!
//! - [zone]: master-file zones indexed by name, with CNAME, DNAME, wildcard and delegation
//!   resolution.
//! - [service]: `DYNA` record targets answered by a static or a geolocation strategy.
//! - [monitor]: TCP and HTTP probes marking service endpoints up or down.
//!
#![warn(clippy::pedantic)]

pub mod api;
pub mod backend;
pub mod config;
pub mod controller;
pub mod dns;
pub mod error;
pub mod geo;
pub mod monitor;
pub mod service;
pub mod tree;
pub mod zone;

pub use api::new as new_http;
pub use backend::{DirectoryBackend, InMemoryBackend};
pub use config::{Config, Shared};
pub use controller::{Controller, SharedController};
pub use dns::new as new_dns;
