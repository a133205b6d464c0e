//! # Master Server Library
//!
//! Rendezvous point for online sessions. Hosts of PlayerMatch and Ranked
//! sessions register themselves here and re-register periodically; searchers
//! ask for the hosts of their application and for introductions to one of them.
//!
//! ## Module Organization
//!
//! ### Registry Module (`registry`)
//! Tracks advertised sessions per application id, refreshes them on every
//! registration and expires hosts that went quiet. Only the endpoint that
//! registered a session may refresh or withdraw it.
//!
//! ### Network Module (`network`)
//! Owns the UDP socket. A receiver task decodes datagrams and forwards them to
//! the main loop, which answers host list requests, brokers introductions by
//! telling each side the other's internal and external endpoints, and runs
//! the expiry timer.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use master::network::MasterServer;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let mut server = MasterServer::new("0.0.0.0:6000", 1024, Duration::from_secs(90)).await?;
//!     server.run().await
//! }
//! ```

pub mod network;
pub mod registry;
