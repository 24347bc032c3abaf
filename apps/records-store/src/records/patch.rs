use std::collections::HashMap;

use crate::records::types::{PatchOperation, Record};

/// Applies `operations` to `current` strictly in list order.
///
/// Upserts replace an existing id in place or append a new id; deletes of an
/// absent id are no-ops. Repeated ids are not collapsed, so the last operation
/// touching an id wins.
pub fn apply(current: &[Record], operations: &[PatchOperation]) -> Vec<Record> {
    let mut slots = current.iter().cloned().map(Some).collect::<Vec<_>>();
    let mut index = HashMap::with_capacity(slots.len());
    for (position, record) in current.iter().enumerate() {
        index.entry(record.id().to_string()).or_insert(position);
    }

    for operation in operations {
        match operation {
            PatchOperation::Upsert { id, record } => match index.get(id) {
                Some(&position) => slots[position] = Some(record.clone()),
                None => {
                    index.insert(id.clone(), slots.len());
                    slots.push(Some(record.clone()));
                }
            },
            PatchOperation::Delete { id } => {
                if let Some(position) = index.remove(id) {
                    slots[position] = None;
                }
            }
        }
    }

    slots.into_iter().flatten().collect()
}
