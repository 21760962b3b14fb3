//! Split-routing HTTP/HTTPS forward proxy.
//!
//! Hosts on the blocklist (or the local custom list) are reached through an
//! upstream SOCKS5 proxy, everything else is dialed directly.

#![warn(clippy::all)]

pub mod config;
pub mod proxy;
pub mod refresher;
pub mod router;
pub mod rules;
pub mod stats;
pub mod tunnel;
