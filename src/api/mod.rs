//! Read-only HTTP API exposing the loaded state.
//!
//! # API Endpoints
//!
//! ## `/healthcheck` (GET)
//!
//!   Returns HTTP 200 (OK) and the JSON body `{"ok":"healthy"}` when the service is operational.
//!
//! ## `/zones` (GET)
//!
//!   Lists the loaded zones:
//!
//!   ```json
//!   [ { "origin": "example.jp.", "last_modified": "2023-03-12T09:00:00Z", "valid": true,
//!       "services": [ "service1" ] } ]
//!   ```
//!
//!   `valid` is `false` when the newest version in the backend was rejected and an older
//!   version is still being served.
//!
//! ## `/zones/:origin` (GET)
//!
//!   A single zone, or HTTP 404 (Not Found).
//!
//! ## `/services` (GET)
//!
//!   Lists the loaded services with the zones using them and the current health of every
//!   endpoint.
//!
//! ## `/monitors` (GET)
//!
//!   Lists the running monitor entries, one per (monitor, service, endpoint):
//!
//!   ```json
//!   [ { "monitor": "web", "service": "service1", "endpoint": "JP/jp1",
//!       "address": "192.0.2.2", "up": true } ]
//!   ```
//!
//! ## `/resolve` (GET)
//!
//!   Resolves a name like the DNS server would. Query parameters: `name`, `type` (default `A`),
//!   and optionally `client` (an address to resolve as, instead of the API client's) and
//!   `subnet` (a client subnet hint). Returns the sections in presentation format:
//!
//!   ```json
//!   { "rcode": "NoError", "authoritative": true,
//!     "answer": [ "www.example.jp. 300 IN A 192.168.0.1" ], "authority": [], "additional": [] }
//!   ```
//!
//!   Invalid names or types get HTTP 400 (Bad Request), resolution errors HTTP 500.

mod api_error;
mod model;
mod routes;
pub mod server;

pub use server::new;
