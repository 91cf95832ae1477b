//! Stable identity hashing for topology entities
//!
//! Replica placement state crosses map and JSON boundaries constantly, so
//! composite struct keys are avoided in favor of opaque chained 64-bit hashes.
//! Seeded xxh64 keeps the values stable across processes and releases.

use xxhash_rust::xxh64::xxh64;

/// Identity of a (group, node) pair.
///
/// Seeds the hash with the node id, then folds in the group name bytes.
pub fn node_hash(group: &str, node_id: u32) -> u64 {
    xxh64(group.as_bytes(), u64::from(node_id))
}

/// Identity of a replica: a (node, shard) pair.
///
/// Returned as a decimal string so it can be used directly as a JSON map key.
pub fn shard_hash(node_hash: u64, shard_id: u32) -> String {
    let shard_key = shard_id.to_string();
    xxh64(shard_key.as_bytes(), node_hash).to_string()
}

/// Identity of a (database, table, partition) triple.
pub fn partition_hash(database: &str, table: &str, partition_id: u32) -> u64 {
    let seed = xxh64(database.as_bytes(), u64::from(partition_id));
    xxh64(table.as_bytes(), seed)
}

/// Identity of a (database, table) pair.
pub fn table_hash(database: &str, table: &str) -> u64 {
    let seed = xxh64(database.as_bytes(), 0);
    xxh64(table.as_bytes(), seed)
}

/// Shard id a partition maps to for a given shard count.
pub fn shard_id_for_partition(
    database: &str,
    table: &str,
    partition_id: u32,
    shard_number: u32,
) -> u32 {
    (partition_hash(database, table, partition_id) % u64::from(shard_number)) as u32
}

/// Fold one more value into a chained hash.
///
/// Used to fingerprint a replica's data generation: the base-version strings
/// of its partitions are folded in order, each seeded by the running hash.
pub fn chain(seed: u64, data: &[u8]) -> u64 {
    xxh64(data, seed)
}
