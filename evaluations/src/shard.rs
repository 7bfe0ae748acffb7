//! The stride sharding rule shared by request building and result collection.

/// Document positions owned by `rank`: `rank, rank + world_size, ...` below `min(limit, len)`.
pub fn shard_indices(
    len: usize,
    limit: Option<usize>,
    rank: usize,
    world_size: usize,
) -> impl Iterator<Item = usize> {
    let end = limit.map_or(len, |limit| limit.min(len));
    (rank..end).step_by(world_size.max(1))
}

/// Resolves a user limit against the number of evaluation documents.
/// Values below 1.0 are a fraction of the documents, rounded up.
pub fn resolve_limit(limit: Option<f64>, len: usize) -> Option<usize> {
    let limit = limit?;
    if limit < 1.0 {
        Some((len as f64 * limit).ceil() as usize)
    } else {
        Some(limit as usize)
    }
}
