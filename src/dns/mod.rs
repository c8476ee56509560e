//! DNS server.
//!
//! # IN class
//!
//! Queries are answered from the loaded zones through
//! [`Controller::get_resource`][crate::controller::Controller::get_resource]. Names outside every
//! zone get `REFUSED`, and resolution errors (e.g. a dynamic record naming a service of the wrong
//! record type) get `SERVFAIL`.
//!
//! An EDNS client subnet option ([RFC 7871](https://www.rfc-editor.org/rfc/rfc7871)) is passed
//! on to the geolocation strategies, which prefer it over the query source address.
//!
//! E.g. with a zone `example.jp.` holding `www IN DYNA service1`, and `service1` a static
//! service with the single endpoint `192.168.0.1`:
//!
//! ```bash
//! ❯ dig @127.0.0.1 -p 5353 www.example.jp +short A
//! 192.168.0.1
//! ```
//!
//! # CH class
//!
//! `version.bind` and `version.server` `TXT` queries return the server version.
//! `hostname.bind` and `id.server` return
//! [`Config::server_id`][`crate::config::Config::server_id`], or `REFUSED` when none is
//! configured.
//!
//! ```bash
//! ❯ dig @127.0.0.1 -p 5353 version.bind CH TXT +short
//! "rabbitdns 0.1.0"
//! ```
//!
//! Other classes and non-query opcodes get `NOTIMP`.

mod handlers;
pub mod server;

pub use handlers::{parse_client_subnet, Handler};
pub use server::{from_sockets, new};
