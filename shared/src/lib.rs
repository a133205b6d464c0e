mod delivery;
mod ids;
mod master;
mod properties;
mod public_info;

pub use delivery::{DeliveryMethod, SendDataOptions, UnsupportedSendOptions};
pub use ids::{Address, GamerId, InvalidId, MachineId, SessionGuid, BROADCAST_ID, MAX_ID};
pub use master::{HostEntry, MasterServerMessage, DEFAULT_MASTER_SERVER_PORT, MASTER_DATAGRAM_SIZE};
pub use properties::{NetworkSessionProperties, PropertyIndexOutOfRange, SESSION_PROPERTY_COUNT};
pub use public_info::{NetworkSessionPublicInfo, NetworkSessionType, SessionQuery};

/// Default port hosts listen on for session traffic and LAN discovery.
pub const DEFAULT_SESSION_PORT: u16 = 3074;

/// Most gamers a single machine may bring into a session.
pub const MAX_LOCAL_GAMERS: usize = 4;
