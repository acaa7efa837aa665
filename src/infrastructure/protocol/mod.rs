//! Wire protocol between the dispatcher and remote workers.

pub mod connection;
pub mod packet;

pub use connection::{Connection, Transport};
pub use packet::{Header, Packet, PacketType, HEADER_LEN};
