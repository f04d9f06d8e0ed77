//! Datagram link for streaming player positions and loot to a live minimap
//!
//! A [`MapDataTransmitter`] inside the game samples a [`DataSource`] on a timer
//! and sends each snapshot as one UDP datagram. A [`MapDataReceiver`] in the
//! minimap process decodes the datagrams and publishes [`Record`]s on an
//! [`EventBus`]. Delivery is best-effort: a lost or corrupt packet is simply a
//! missed snapshot.

pub mod events;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod source;
pub mod types;

// Re-export commonly used types
pub use events::{EventBus, SubscriptionId};
pub use protocol::{decode, encode, PacketReader, Protocol, ProtocolError, MAX_DATAGRAM_SIZE};
pub use receiver::{MapDataReceiver, ReceiveError, ReceiverConfig, ReceiverStats};
pub use sender::{
    MapDataTransmitter, TickReport, TransmitError, TransmitterConfig, TransmitterStats,
};
pub use source::{DataSource, FnSource};
pub use types::{
    ItemRecord, LootBatchRecord, PositionRecord, Record, Rotation, Vec3, LOOT_CHANNEL_TAG,
};

/// Result type for transmitter operations
pub type Result<T> = std::result::Result<T, TransmitError>;
