use crate::schema::decoded::{Decoded, Hex};
use crate::schema::error;
use crate::schema::key::Key;
use serde::{de::Error as _, Deserializer};
use std::collections::HashMap;
use std::fmt;

/// Deserializes a key map, requiring each key ID to match the digest of its key's canonical
/// encoding and rejecting repeated key IDs. Entries are collected in document order first so
/// a repeated ID is caught rather than silently overwritten.
pub(super) fn deserialize_keys<'de, D>(
    deserializer: D,
) -> Result<HashMap<Decoded<Hex>, Key>, D::Error>
where
    D: Deserializer<'de>,
{
    struct EntryCollector;

    impl<'de> serde::de::Visitor<'de> for EntryCollector {
        type Value = Vec<(Decoded<Hex>, Key)>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a map of key IDs to public keys")
        }

        fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
        where
            M: serde::de::MapAccess<'de>,
        {
            let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
            while let Some(entry) = access.next_entry()? {
                entries.push(entry);
            }
            Ok(entries)
        }
    }

    let entries = deserializer.deserialize_map(EntryCollector)?;
    let mut map = HashMap::with_capacity(entries.len());
    for (keyid, key) in entries {
        let calculated = key.key_id().map_err(D::Error::custom)?;
        if keyid != calculated {
            return Err(D::Error::custom(
                error::InvalidKeyIdSnafu {
                    keyid: hex::encode(&keyid),
                    calculated: hex::encode(&calculated),
                }
                .build(),
            ));
        }
        let keyid_hex = hex::encode(&keyid);
        if map.insert(keyid, key).is_some() {
            return Err(D::Error::custom(
                error::DuplicateKeyIdSnafu { keyid: keyid_hex }.build(),
            ));
        }
    }
    Ok(map)
}
