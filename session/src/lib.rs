//! # Network Session Library
//!
//! A host-authoritative multiplayer session engine. One machine hosts, every
//! other machine connects to it, and the host relays whatever clients address
//! to each other. Applications drive a [`NetworkSession`] once per frame and
//! talk through gamers: the players signed in on each machine.
//!
//! ## Core Responsibilities
//!
//! ### Membership
//! The host hands out machine ids when it approves a connection and gamer ids
//! when a client asks for them, so ids never collide. Joining and leaving
//! gamers and machines are announced to everybody, and every machine keeps
//! the same view of who is in the session.
//!
//! ### Relay and Validation
//! Every message carries a three byte header naming its type, recipient and
//! origin machine. Before a handler runs, a receiver checks that the origin
//! is known, that a client did not forge another machine's origin, and that
//! host-only messages really came from the host. Rejected messages are
//! dropped and logged, never propagated.
//!
//! ### Game Flow
//! Sessions move between lobby and playing on the host's command, and end
//! for good when the host leaves. Ready flags are only meaningful in the
//! lobby and are cleared whenever a game ends.
//!
//! ### Application Data
//! Gamers exchange opaque packets, either with everybody or with one gamer.
//! Packets that arrive before their sender is announced are parked and
//! released in order once the sender shows up.
//!
//! ### Discovery
//! System link sessions answer LAN discovery requests. Online sessions keep
//! themselves registered with a master server from a background tokio task.
//!
//! ## Module Organization
//!
//! - `session`: the [`NetworkSession`] object, routing and protocol handlers
//! - `join`: finding sessions and the two stage join
//! - `message`: wire format of session messages
//! - `registry`, `machine`, `gamer`: who is in the session
//! - `queue`, `pool`: per-gamer packet queues and buffer recycling
//! - `transport`: the [`TransportPeer`] seam, with an in-process
//!   implementation in `local_transport`
//! - `master_client`: talking to the master server
//! - `config`, `state`, `error`: settings, lifecycle and error types
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use session::{LocalNetwork, NetworkSession, SessionConfig, SessionSettings, SignedInGamer};
//! use shared::{NetworkSessionType, SendDataOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let network = LocalNetwork::new();
//!     let config = SessionConfig::new("my-game");
//!     let mut host = NetworkSession::create(
//!         Box::new(network.peer("10.0.0.1:3074".parse()?)),
//!         SessionSettings::new(NetworkSessionType::SystemLink, 8),
//!         config.clone(),
//!         vec![SignedInGamer::new("Host")],
//!     )?;
//!
//!     // Once per frame
//!     let me = host.local_gamer_ids()[0];
//!     host.send_data(me, b"hello", SendDataOptions::RELIABLE_IN_ORDER, None)?;
//!     host.update()?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod gamer;
pub mod join;
pub mod local_transport;
pub mod machine;
pub mod master_client;
pub mod message;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod session;
pub mod state;
pub mod transport;

pub use config::{SessionConfig, SessionSettings, UnknownRecipientPolicy};
pub use error::{CodecError, JoinError, ProtocolViolation, SessionError};
pub use gamer::{LocalNetworkGamer, NetworkGamer, SignedInGamer};
pub use join::{AvailableNetworkSession, JoinAttempt, JoinProgress};
pub use local_transport::{LocalNetwork, LocalPeer};
pub use machine::NetworkMachine;
pub use master_client::{MasterServerClient, MasterServerError};
pub use session::{NetworkSession, HOST_MACHINE_ID};
pub use state::{SessionEndReason, SessionEvent, SessionState};
pub use transport::{TransportError, TransportPeer};
