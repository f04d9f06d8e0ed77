//! Wire protocol for the map link
//!
//! Every datagram carries exactly one record:
//!
//! ```text
//! i32     channel name length
//! [u8]    channel name (UTF-8)
//! -- channel name == "_loot":
//! i32     blob length
//! [u8]    blob (UTF-8 JSON item list)
//! -- any other channel name (the map name):
//! f32     x, y, z
//! f32     rotation x, rotation y
//! ```
//!
//! All integers and floats are little-endian. Decoding walks the packet with a
//! [`PacketReader`] that checks bounds before every read, so a short or lying
//! packet surfaces as a typed [`ProtocolError`] instead of an out-of-range read.

use crate::types::{
    ItemRecord, LootBatchRecord, PositionRecord, Record, Rotation, Vec3, LOOT_CHANNEL_TAG,
};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use thiserror::Error;
use tracing::{error, trace};

/// Size of every length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of the fixed position payload: x, y, z, rotation x, rotation y
pub const POSITION_PAYLOAD_SIZE: usize = 5 * 4;

/// Largest payload a single UDP datagram can carry over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Largest string or blob length the decoder admits by default
pub const DEFAULT_MAX_FIELD_LENGTH: usize = MAX_DATAGRAM_SIZE;

/// Protocol error types
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Truncated packet: {field} needs {needed} bytes, {remaining} remaining")]
    TruncatedPacket {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },

    #[error("Invalid length for {field}: {declared} (maximum {max})")]
    InvalidLength {
        field: &'static str,
        declared: i32,
        max: usize,
    },

    #[error("Malformed UTF-8 in {field} after {valid_up_to} bytes")]
    MalformedUtf8 {
        field: &'static str,
        valid_up_to: usize,
    },

    #[error("Packet has {extra} unexpected trailing bytes")]
    TrailingBytes { extra: usize },

    #[error("Malformed loot blob: {0}")]
    MalformedBlob(#[from] serde_json::Error),
}

/// Bounds-checked cursor over a received packet
pub struct PacketReader<'a> {
    cursor: Cursor<&'a [u8]>,
    max_field_length: usize,
}

impl<'a> PacketReader<'a> {
    /// Create a reader positioned at the start of `packet`
    pub fn new(packet: &'a [u8], max_field_length: usize) -> Self {
        Self {
            cursor: Cursor::new(packet),
            max_field_length,
        }
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.cursor.get_ref().len() - self.position()
    }

    fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    fn require(&self, field: &'static str, needed: usize) -> Result<(), ProtocolError> {
        let remaining = self.remaining();
        if remaining < needed {
            return Err(ProtocolError::TruncatedPacket {
                field,
                needed,
                remaining,
            });
        }
        Ok(())
    }

    /// Read a little-endian `i32`
    pub fn read_i32(&mut self, field: &'static str) -> Result<i32, ProtocolError> {
        self.require(field, 4)?;
        let remaining = self.remaining();
        self.cursor
            .read_i32::<LittleEndian>()
            .map_err(|_| ProtocolError::TruncatedPacket {
                field,
                needed: 4,
                remaining,
            })
    }

    /// Read a little-endian `f32`
    pub fn read_f32(&mut self, field: &'static str) -> Result<f32, ProtocolError> {
        self.require(field, 4)?;
        let remaining = self.remaining();
        self.cursor
            .read_f32::<LittleEndian>()
            .map_err(|_| ProtocolError::TruncatedPacket {
                field,
                needed: 4,
                remaining,
            })
    }

    /// Read a length-prefixed byte field without copying it
    pub fn read_prefixed_bytes(
        &mut self,
        field: &'static str,
    ) -> Result<&'a [u8], ProtocolError> {
        let declared = self.read_i32(field)?;
        if declared < 0 || declared as usize > self.max_field_length {
            return Err(ProtocolError::InvalidLength {
                field,
                declared,
                max: self.max_field_length,
            });
        }

        let len = declared as usize;
        self.require(field, len)?;

        let packet: &'a [u8] = *self.cursor.get_ref();
        let start = self.position();
        let bytes = &packet[start..start + len];
        self.cursor.set_position((start + len) as u64);
        Ok(bytes)
    }

    /// Read a length-prefixed UTF-8 string without copying it
    pub fn read_str(&mut self, field: &'static str) -> Result<&'a str, ProtocolError> {
        let bytes = self.read_prefixed_bytes(field)?;
        std::str::from_utf8(bytes).map_err(|e| ProtocolError::MalformedUtf8 {
            field,
            valid_up_to: e.valid_up_to(),
        })
    }

    /// Check that the whole packet has been consumed
    pub fn finish(self) -> Result<(), ProtocolError> {
        match self.remaining() {
            0 => Ok(()),
            extra => Err(ProtocolError::TrailingBytes { extra }),
        }
    }
}

/// Little-endian packet builder
struct PacketWriter {
    buf: Vec<u8>,
}

impl PacketWriter {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    fn put_i32(&mut self, value: i32) {
        let mut bytes = [0u8; 4];
        LittleEndian::write_i32(&mut bytes, value);
        self.buf.extend_from_slice(&bytes);
    }

    fn put_f32(&mut self, value: f32) {
        let mut bytes = [0u8; 4];
        LittleEndian::write_f32(&mut bytes, value);
        self.buf.extend_from_slice(&bytes);
    }

    // Lengths beyond i32::MAX are outside the encode contract
    fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_i32(bytes.len() as i32);
        self.buf.extend_from_slice(bytes);
    }

    fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Loot item as it appears inside the JSON blob
#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct BlobItemRef<'a> {
    network_id: &'a str,
    item_id: &'a str,
    item_name: &'a str,
    position: Vec3,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlobItem {
    network_id: String,
    item_id: String,
    item_name: String,
    position: Vec3,
}

impl From<BlobItem> for ItemRecord {
    fn from(item: BlobItem) -> Self {
        ItemRecord {
            network_id: item.network_id,
            item_id: item.item_id,
            display_name: item.item_name,
            position: item.position,
        }
    }
}

/// Protocol handler for encoding and decoding records
#[derive(Debug, Clone, Copy)]
pub struct Protocol {
    max_field_length: usize,
}

impl Default for Protocol {
    fn default() -> Self {
        Self {
            max_field_length: DEFAULT_MAX_FIELD_LENGTH,
        }
    }
}

impl Protocol {
    /// Create a protocol handler with default limits
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the largest string or blob length accepted while decoding
    pub fn with_max_field_length(mut self, len: usize) -> Self {
        self.max_field_length = len;
        self
    }

    /// Largest string or blob length accepted while decoding
    pub fn max_field_length(&self) -> usize {
        self.max_field_length
    }

    /// Encode a record into one packet.
    ///
    /// Never fails. A [`PositionRecord`] whose map name is the loot tag is
    /// outside the contract: it encodes, but will not decode as a position.
    ///
    /// Size is not checked either. A map name or loot blob longer than
    /// [`Protocol::max_field_length`] is rejected by [`Protocol::decode`], and
    /// a packet over [`MAX_DATAGRAM_SIZE`] does not fit in one UDP datagram.
    pub fn encode(&self, record: &Record) -> Vec<u8> {
        match record {
            Record::Position(position) => self.encode_position(position),
            Record::LootBatch(batch) => self.encode_loot_batch(batch),
        }
    }

    /// Encode a position snapshot
    pub fn encode_position(&self, record: &PositionRecord) -> Vec<u8> {
        let name = record.map_name.as_bytes();
        let mut writer =
            PacketWriter::with_capacity(LENGTH_PREFIX_SIZE + name.len() + POSITION_PAYLOAD_SIZE);

        writer.put_bytes(name);
        writer.put_f32(record.position.x);
        writer.put_f32(record.position.y);
        writer.put_f32(record.position.z);
        writer.put_f32(record.rotation.x);
        writer.put_f32(record.rotation.y);

        trace!("Encoded position on '{}'", record.map_name);
        writer.into_inner()
    }

    /// Encode a loot batch
    pub fn encode_loot_batch(&self, batch: &LootBatchRecord) -> Vec<u8> {
        let blob = self.encode_loot_blob(&batch.items);
        let tag = LOOT_CHANNEL_TAG.as_bytes();
        let mut writer =
            PacketWriter::with_capacity(2 * LENGTH_PREFIX_SIZE + tag.len() + blob.len());

        writer.put_bytes(tag);
        writer.put_bytes(&blob);

        trace!(
            "Encoded loot batch: {} items, blob {} bytes",
            batch.items.len(),
            blob.len()
        );
        writer.into_inner()
    }

    /// Serialize an item list into the nested JSON blob
    pub fn encode_loot_blob(&self, items: &[ItemRecord]) -> Vec<u8> {
        let wire: Vec<BlobItemRef<'_>> = items
            .iter()
            .map(|item| BlobItemRef {
                network_id: &item.network_id,
                item_id: &item.item_id,
                item_name: &item.display_name,
                position: item.position,
            })
            .collect();

        match serde_json::to_vec(&wire) {
            Ok(blob) => blob,
            Err(e) => {
                // Plain structs of strings and floats always serialize
                error!("Failed to serialize loot blob: {}", e);
                b"[]".to_vec()
            }
        }
    }

    /// Parse the nested JSON blob back into items
    pub fn decode_loot_blob(&self, blob: &str) -> Result<Vec<ItemRecord>, ProtocolError> {
        let wire: Vec<BlobItem> = serde_json::from_str(blob)?;
        Ok(wire.into_iter().map(ItemRecord::from).collect())
    }

    /// Decode one packet into a record
    pub fn decode(&self, packet: &[u8]) -> Result<Record, ProtocolError> {
        trace!("Decoding packet of {} bytes", packet.len());

        let mut reader = PacketReader::new(packet, self.max_field_length);
        let channel = reader.read_str("channel name")?;

        let record = if channel == LOOT_CHANNEL_TAG {
            let blob = reader.read_str("loot blob")?;
            let items = self.decode_loot_blob(blob)?;
            Record::LootBatch(LootBatchRecord { items })
        } else {
            let position = Vec3 {
                x: reader.read_f32("position x")?,
                y: reader.read_f32("position y")?,
                z: reader.read_f32("position z")?,
            };
            let rotation = Rotation {
                x: reader.read_f32("rotation x")?,
                y: reader.read_f32("rotation y")?,
            };
            Record::Position(PositionRecord {
                map_name: channel.to_owned(),
                position,
                rotation,
            })
        };

        reader.finish()?;
        Ok(record)
    }
}

/// Encode a record with the default protocol handler
pub fn encode(record: &Record) -> Vec<u8> {
    Protocol::default().encode(record)
}

/// Decode a packet with the default protocol handler
pub fn decode(packet: &[u8]) -> Result<Record, ProtocolError> {
    Protocol::default().decode(packet)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bigmap() -> Record {
        Record::Position(PositionRecord::new(
            "bigmap",
            Vec3::new(1.5, 2.5, 3.5),
            Rotation::new(0.1, 0.2),
        ))
    }

    fn one_item_batch() -> Record {
        Record::LootBatch(LootBatchRecord::new(vec![ItemRecord::new(
            "net1",
            "itemA",
            "Name A",
            Vec3::new(0.0, 0.0, 0.0),
        )]))
    }

    fn raw_packet(channel: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut packet = (channel.len() as i32).to_le_bytes().to_vec();
        packet.extend_from_slice(channel);
        packet.extend_from_slice(payload);
        packet
    }

    #[test]
    fn test_position_layout() {
        let packet = encode(&bigmap());

        assert_eq!(packet.len(), LENGTH_PREFIX_SIZE + 6 + POSITION_PAYLOAD_SIZE);
        assert_eq!(&packet[..4], &6i32.to_le_bytes());
        assert_eq!(&packet[4..10], b"bigmap");
        assert_eq!(&packet[10..14], &1.5f32.to_le_bytes());
        assert_eq!(&packet[26..30], &0.2f32.to_le_bytes());
    }

    #[test]
    fn test_position_scenario() {
        let decoded = decode(&encode(&bigmap())).unwrap();
        let position = decoded.as_position().expect("position record");

        assert_eq!(position.map_name, "bigmap");
        assert_eq!(position.position, Vec3::new(1.5, 2.5, 3.5));
        assert!((position.rotation.x - 0.1).abs() < f32::EPSILON);
        assert!((position.rotation.y - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn test_loot_scenario() {
        let record = one_item_batch();
        let decoded = decode(&encode(&record)).unwrap();

        let batch = decoded.as_loot_batch().expect("loot batch");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.items[0].network_id, "net1");
        assert_eq!(batch.items[0].item_id, "itemA");
        assert_eq!(batch.items[0].display_name, "Name A");
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_empty_loot_batch() {
        let record = Record::LootBatch(LootBatchRecord::default());
        let decoded = decode(&encode(&record)).unwrap();
        assert!(decoded.as_loot_batch().unwrap().is_empty());
    }

    #[test]
    fn test_unicode_strings_round_trip() {
        let record = Record::LootBatch(LootBatchRecord::new(vec![ItemRecord::new(
            "5f1a \"quoted\"",
            "ид-42",
            "Граната 🎯\n\ttab",
            Vec3::new(-10.25, 0.5, 1e6),
        )]));
        assert_eq!(decode(&encode(&record)).unwrap(), record);

        let record = Record::Position(PositionRecord::new(
            "Таможня",
            Vec3::new(-1.0, 0.0, 1.0),
            Rotation::new(359.9, -89.0),
        ));
        assert_eq!(decode(&encode(&record)).unwrap(), record);
    }

    #[test]
    fn test_blob_field_names() {
        let blob = Protocol::new().encode_loot_blob(&[ItemRecord::new(
            "net1",
            "itemA",
            "Name A",
            Vec3::new(1.0, 2.0, 3.0),
        )]);
        let json: serde_json::Value = serde_json::from_slice(&blob).unwrap();

        let item = &json[0];
        assert_eq!(item["NetworkId"], "net1");
        assert_eq!(item["ItemId"], "itemA");
        assert_eq!(item["ItemName"], "Name A");
        assert_eq!(item["Position"]["y"], 2.0);
    }

    #[test]
    fn test_every_prefix_is_truncated() {
        let records = [
            bigmap(),
            one_item_batch(),
            Record::LootBatch(LootBatchRecord::default()),
        ];
        for record in records {
            let packet = encode(&record);
            for len in 0..packet.len() {
                let result = decode(&packet[..len]);
                assert!(
                    matches!(result, Err(ProtocolError::TruncatedPacket { .. })),
                    "prefix of {} bytes: {:?}",
                    len,
                    result
                );
            }
        }
    }

    #[test]
    fn test_loot_tag_without_payload() {
        let packet = raw_packet(LOOT_CHANNEL_TAG.as_bytes(), &[]);
        let result = decode(&packet);
        assert!(matches!(
            result,
            Err(ProtocolError::TruncatedPacket {
                field: "loot blob",
                ..
            })
        ));
    }

    #[test]
    fn test_length_lie() {
        let mut packet = i32::MAX.to_le_bytes().to_vec();
        packet.extend_from_slice(b"bigmap");
        assert!(matches!(
            decode(&packet),
            Err(ProtocolError::InvalidLength {
                field: "channel name",
                declared: i32::MAX,
                ..
            })
        ));

        let mut payload = (-1i32).to_le_bytes().to_vec();
        payload.extend_from_slice(b"[]");
        let packet = raw_packet(LOOT_CHANNEL_TAG.as_bytes(), &payload);
        assert!(matches!(
            decode(&packet),
            Err(ProtocolError::InvalidLength {
                field: "loot blob",
                declared: -1,
                ..
            })
        ));
    }

    #[test]
    fn test_custom_max_field_length() {
        let protocol = Protocol::new().with_max_field_length(4);
        let packet = encode(&bigmap());

        assert!(matches!(
            protocol.decode(&packet),
            Err(ProtocolError::InvalidLength { max: 4, .. })
        ));

        let packet = protocol.encode(&Record::Position(PositionRecord::new(
            "abc",
            Vec3::default(),
            Rotation::default(),
        )));
        assert!(protocol.decode(&packet).is_ok());
    }

    #[test]
    fn test_oversize_loot_batch_does_not_decode() {
        let items = (0..800)
            .map(|i| {
                ItemRecord::new(
                    format!("{}", 1000 + i),
                    format!("item{i:04}"),
                    format!("Test item {i}"),
                    Vec3::new(i as f32, 0.0, 0.0),
                )
            })
            .collect();
        let packet = encode(&Record::LootBatch(LootBatchRecord::new(items)));

        assert!(packet.len() > MAX_DATAGRAM_SIZE);
        assert!(matches!(
            decode(&packet),
            Err(ProtocolError::InvalidLength {
                field: "loot blob",
                max: DEFAULT_MAX_FIELD_LENGTH,
                ..
            })
        ));
    }

    #[test]
    fn test_malformed_utf8() {
        let packet = raw_packet(&[b'b', 0xff, 0xfe], &[0u8; POSITION_PAYLOAD_SIZE]);
        assert!(matches!(
            decode(&packet),
            Err(ProtocolError::MalformedUtf8 {
                field: "channel name",
                valid_up_to: 1,
            })
        ));

        let mut payload = 2i32.to_le_bytes().to_vec();
        payload.extend_from_slice(&[0xc3, 0x28]);
        let packet = raw_packet(LOOT_CHANNEL_TAG.as_bytes(), &payload);
        assert!(matches!(
            decode(&packet),
            Err(ProtocolError::MalformedUtf8 {
                field: "loot blob",
                ..
            })
        ));
    }

    #[test]
    fn test_trailing_bytes() {
        let mut packet = encode(&bigmap());
        packet.extend_from_slice(&[0, 0, 0]);
        assert!(matches!(
            decode(&packet),
            Err(ProtocolError::TrailingBytes { extra: 3 })
        ));

        let mut packet = encode(&Record::LootBatch(LootBatchRecord::default()));
        packet.push(b' ');
        assert!(matches!(
            decode(&packet),
            Err(ProtocolError::TrailingBytes { extra: 1 })
        ));
    }

    #[test]
    fn test_malformed_blob() {
        let blob = br#"[{"NetworkId":"net1"}]"#;
        let mut payload = (blob.len() as i32).to_le_bytes().to_vec();
        payload.extend_from_slice(blob);
        let packet = raw_packet(LOOT_CHANNEL_TAG.as_bytes(), &payload);

        assert!(matches!(
            decode(&packet),
            Err(ProtocolError::MalformedBlob(_))
        ));
    }

    #[test]
    fn test_tag_match_is_exact() {
        // A map name that merely starts with the tag is still a position
        let record = Record::Position(PositionRecord::new(
            "_looted_bunker",
            Vec3::new(4.0, 5.0, 6.0),
            Rotation::default(),
        ));
        assert_eq!(decode(&encode(&record)).unwrap(), record);
    }

    #[test]
    fn test_empty_map_name() {
        let record = Record::Position(PositionRecord::new(
            "",
            Vec3::new(4.0, 5.0, 6.0),
            Rotation::new(7.0, 8.0),
        ));
        assert_eq!(decode(&encode(&record)).unwrap(), record);
    }

    #[test]
    fn test_reader_remaining() {
        let packet = [1u8, 0, 0, 0, 0, 0, 128, 63];
        let mut reader = PacketReader::new(&packet, DEFAULT_MAX_FIELD_LENGTH);
        assert_eq!(reader.remaining(), 8);
        assert_eq!(reader.read_i32("int").unwrap(), 1);
        assert_eq!(reader.read_f32("float").unwrap(), 1.0);
        assert_eq!(reader.remaining(), 0);
        assert!(reader.finish().is_ok());
    }
}
