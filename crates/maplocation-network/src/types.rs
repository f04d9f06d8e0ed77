//! Shared record types carried over the map link

use serde::{Deserialize, Serialize};

/// Channel tag reserved for loot batches. Every other tag is a map name.
pub const LOOT_CHANNEL_TAG: &str = "_loot";

/// World-space position
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    /// Create a new position
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Planar distance to another point, ignoring height
    pub fn horizontal_distance(&self, other: &Vec3) -> f32 {
        let dx = self.x - other.x;
        let dz = self.z - other.z;
        (dx * dx + dz * dz).sqrt()
    }
}

/// Look rotation of a player (yaw/pitch pair as reported by the host)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rotation {
    pub x: f32,
    pub y: f32,
}

impl Rotation {
    /// Create a new rotation
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// One player's location and orientation snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    /// Map identifier (e.g., "bigmap"), doubles as the channel tag
    pub map_name: String,
    /// Player position in world coordinates
    pub position: Vec3,
    /// Player look rotation
    pub rotation: Rotation,
}

impl PositionRecord {
    /// Create a new position record
    pub fn new(map_name: impl Into<String>, position: Vec3, rotation: Rotation) -> Self {
        Self {
            map_name: map_name.into(),
            position,
            rotation,
        }
    }

    /// Whether this record can be encoded without being mistaken for a loot batch
    pub fn is_transmittable(&self) -> bool {
        self.map_name != LOOT_CHANNEL_TAG
    }
}

/// A single loose loot item lying in the world
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    /// Host network id of the loot entity
    pub network_id: String,
    /// Item template id
    pub item_id: String,
    /// Localized short name shown to the player
    pub display_name: String,
    /// Where the item lies
    pub position: Vec3,
}

impl ItemRecord {
    pub fn new(
        network_id: impl Into<String>,
        item_id: impl Into<String>,
        display_name: impl Into<String>,
        position: Vec3,
    ) -> Self {
        Self {
            network_id: network_id.into(),
            item_id: item_id.into(),
            display_name: display_name.into(),
            position,
        }
    }
}

/// The loot layout of a session, sent under [`LOOT_CHANNEL_TAG`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LootBatchRecord {
    pub items: Vec<ItemRecord>,
}

impl LootBatchRecord {
    /// Create a new loot batch
    pub fn new(items: Vec<ItemRecord>) -> Self {
        Self { items }
    }

    /// Number of items in the batch
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if the batch carries no items
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// One decoded unit of telemetry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Record {
    Position(PositionRecord),
    LootBatch(LootBatchRecord),
}

impl Record {
    /// The channel tag this record travels under
    pub fn channel_tag(&self) -> &str {
        match self {
            Record::Position(position) => &position.map_name,
            Record::LootBatch(_) => LOOT_CHANNEL_TAG,
        }
    }

    /// Get the position snapshot, if this is one
    pub fn as_position(&self) -> Option<&PositionRecord> {
        match self {
            Record::Position(position) => Some(position),
            Record::LootBatch(_) => None,
        }
    }

    /// Get the loot batch, if this is one
    pub fn as_loot_batch(&self) -> Option<&LootBatchRecord> {
        match self {
            Record::Position(_) => None,
            Record::LootBatch(batch) => Some(batch),
        }
    }
}

impl From<PositionRecord> for Record {
    fn from(record: PositionRecord) -> Self {
        Record::Position(record)
    }
}

impl From<LootBatchRecord> for Record {
    fn from(record: LootBatchRecord) -> Self {
        Record::LootBatch(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_tag() {
        let position = Record::from(PositionRecord::new(
            "bigmap",
            Vec3::new(1.0, 2.0, 3.0),
            Rotation::default(),
        ));
        assert_eq!(position.channel_tag(), "bigmap");
        assert!(position.as_position().is_some());
        assert!(position.as_loot_batch().is_none());

        let loot = Record::from(LootBatchRecord::default());
        assert_eq!(loot.channel_tag(), LOOT_CHANNEL_TAG);
        assert!(loot.as_loot_batch().unwrap().is_empty());
    }

    #[test]
    fn test_reserved_map_name() {
        let record = PositionRecord::new(LOOT_CHANNEL_TAG, Vec3::default(), Rotation::default());
        assert!(!record.is_transmittable());

        // Only the exact tag is reserved
        let record = PositionRecord::new("_loot2", Vec3::default(), Rotation::default());
        assert!(record.is_transmittable());
    }

    #[test]
    fn test_horizontal_distance() {
        let a = Vec3::new(0.0, 10.0, 0.0);
        let b = Vec3::new(3.0, -5.0, 4.0);
        assert!((a.horizontal_distance(&b) - 5.0).abs() < 1e-6);
    }
}
