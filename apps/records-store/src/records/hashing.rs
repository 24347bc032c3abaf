use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::records::types::Record;

/// Content hash of one record: sha256 over its JSON form with keys sorted.
pub fn record_hash(record: &Record) -> String {
    sha256_prefixed(canonical_record_json(record).as_bytes())
}

/// Order-sensitive checksum over `(id, content hash)` pairs.
pub fn set_checksum<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut hasher = Sha256::new();
    for (id, hash) in entries {
        hasher.update(id.as_bytes());
        hasher.update([0u8]);
        hasher.update(hash.as_bytes());
        hasher.update(b"\n");
    }
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn records_checksum(records: &[Record]) -> String {
    hashes_checksum(&record_hashes(records))
}

pub fn hashes_checksum(hashes: &[(String, String)]) -> String {
    set_checksum(hashes.iter().map(|(id, hash)| (id.as_str(), hash.as_str())))
}

/// `(id, hash)` in set order.
pub fn record_hashes(records: &[Record]) -> Vec<(String, String)> {
    records
        .iter()
        .map(|record| (record.id().to_string(), record_hash(record)))
        .collect()
}

fn canonical_record_json(record: &Record) -> String {
    let sorted = record
        .entries()
        .map(|(field, value)| (field.as_str(), value))
        .collect::<BTreeMap<_, _>>();
    Value::Object(
        sorted
            .into_iter()
            .map(|(key, value)| (key.to_string(), Value::String(value.to_string())))
            .collect(),
    )
    .to_string()
}

fn sha256_prefixed(input: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(input)))
}
