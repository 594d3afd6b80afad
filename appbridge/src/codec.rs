//! Compact transport encoding for full configuration snapshots.
//!
//! Snapshots exchanged during the discovery/identify handshake travel as a
//! single string field: JSON, zlib-compressed, hex-encoded. Decoding
//! reverses the steps exactly.

use crate::protocol::ConfigurationSnapshot;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to serialize snapshot")]
    Serialize(#[source] serde_json::Error),
    #[error("Failed to compress snapshot")]
    Compress(#[source] std::io::Error),
    #[error("Payload is not valid hex")]
    Hex(#[from] hex::FromHexError),
    #[error("Failed to decompress payload")]
    Decompress(#[source] std::io::Error),
    #[error("Failed to parse snapshot")]
    Parse(#[source] serde_json::Error),
}

pub fn encode(snapshot: &ConfigurationSnapshot) -> Result<String, Error> {
    let json = serde_json::to_vec(snapshot).map_err(Error::Serialize)?;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json).map_err(Error::Compress)?;
    let compressed = encoder.finish().map_err(Error::Compress)?;

    Ok(hex::encode(compressed))
}

pub fn decode(payload: &str) -> Result<ConfigurationSnapshot, Error> {
    let compressed = hex::decode(payload.trim())?;

    let mut json = Vec::new();
    ZlibDecoder::new(compressed.as_slice())
        .read_to_end(&mut json)
        .map_err(Error::Decompress)?;

    serde_json::from_slice(&json).map_err(Error::Parse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceInfo;
    use crate::entity::{AttrMap, AttrValue, Domain, EntityDefinition};
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn sample_snapshot() -> ConfigurationSnapshot {
        let mut attributes = AttrMap::new();
        attributes.insert("native_value".to_owned(), AttrValue::Number(0.42));

        let mut entities = BTreeMap::new();
        entities.insert(
            Domain::Sensor,
            vec![EntityDefinition {
                unique_id: "cpu-load".to_owned(),
                name: "CPU load".to_owned(),
                icon: Some("mdi:cpu-64-bit".to_owned()),
                category: None,
                labels: vec!["system".to_owned()],
                area_id: None,
                disabled: false,
                attributes,
            }],
        );

        ConfigurationSnapshot {
            app: "workstation".to_owned(),
            title: "Workstation Agent".to_owned(),
            hash: "h1".to_owned(),
            device: DeviceInfo {
                unique_id: "dev-1".to_owned(),
                name: "Workstation".to_owned(),
                manufacturer: Some("ACME".to_owned()),
                model: None,
                sw_version: Some("1.2.3".to_owned()),
                hw_version: None,
                serial_number: None,
                configuration_url: None,
                suggested_area: Some("office".to_owned()),
            },
            secondary_devices: vec![],
            hostname: "box".to_owned(),
            username: "user".to_owned(),
            entities,
        }
    }

    #[test]
    fn round_trips_a_snapshot() {
        let snapshot = sample_snapshot();

        let encoded = encode(&snapshot).unwrap();
        let decoded = decode(&encoded).unwrap();

        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn round_trips_floats_to_the_last_digit() {
        let mut snapshot = sample_snapshot();
        snapshot
            .entities
            .get_mut(&Domain::Sensor)
            .unwrap()[0]
            .attributes
            .insert(
                "native_value".to_owned(),
                AttrValue::Number(478473.73645633756),
            );

        let decoded = decode(&encode(&snapshot).unwrap()).unwrap();

        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn encoded_payload_is_plain_hex() {
        let encoded = encode(&sample_snapshot()).unwrap();

        assert!(encoded.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn rejects_non_hex_payloads() {
        assert!(matches!(decode("not hex at all"), Err(Error::Hex(_))));
    }

    #[test]
    fn rejects_hex_that_is_not_compressed_data() {
        assert!(matches!(decode("deadbeef"), Err(Error::Decompress(_))));
    }

    fn attr_value() -> impl Strategy<Value = AttrValue> {
        prop_oneof![
            Just(AttrValue::Null),
            any::<bool>().prop_map(AttrValue::Bool),
            (-1_000_000.0..1_000_000.0f64).prop_map(AttrValue::Number),
            "[a-z ]{0,12}".prop_map(AttrValue::Text),
        ]
    }

    fn entity_definition() -> impl Strategy<Value = EntityDefinition> {
        (
            "[a-z0-9-]{1,16}",
            "[A-Za-z ]{1,16}",
            proptest::collection::btree_map("attr_[a-z]{1,8}", attr_value(), 0..4),
        )
            .prop_map(|(unique_id, name, attributes)| EntityDefinition {
                unique_id,
                name,
                icon: None,
                category: None,
                labels: vec![],
                area_id: None,
                disabled: false,
                attributes,
            })
    }

    fn snapshot() -> impl Strategy<Value = ConfigurationSnapshot> {
        (
            "[a-z]{1,10}",
            "[a-f0-9]{8}",
            proptest::collection::vec(entity_definition(), 0..5),
        )
            .prop_map(|(app, hash, defs)| {
                let mut entities = BTreeMap::new();
                if !defs.is_empty() {
                    entities.insert(Domain::Sensor, defs);
                }
                ConfigurationSnapshot {
                    app: app.clone(),
                    title: app.clone(),
                    hash,
                    device: DeviceInfo {
                        unique_id: format!("{app}-device"),
                        name: app,
                        manufacturer: None,
                        model: None,
                        sw_version: None,
                        hw_version: None,
                        serial_number: None,
                        configuration_url: None,
                        suggested_area: None,
                    },
                    secondary_devices: vec![],
                    hostname: "host".to_owned(),
                    username: "user".to_owned(),
                    entities,
                }
            })
    }

    proptest! {
        #[test]
        fn round_trips_arbitrary_snapshots(snapshot in snapshot()) {
            let encoded = encode(&snapshot).unwrap();
            prop_assert_eq!(decode(&encoded).unwrap(), snapshot);
        }
    }
}
