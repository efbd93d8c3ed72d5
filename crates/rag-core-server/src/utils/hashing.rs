use sha2::{Digest, Sha256};

/// Cache key for a (content, model) pair.
///
/// The model prefix guarantees that switching embedding models never reads a
/// stale vector: `md5(model)[..8] + "_" + sha256(content)`.
pub fn embedding_cache_key(content: &str, model_name: &str) -> String {
    let content_hash = hex::encode(Sha256::digest(content.as_bytes()));
    let model_hash = format!("{:x}", md5::compute(model_name.as_bytes()));
    format!("{}_{}", &model_hash[..8], content_hash)
}

/// Short content digest for optimizer cache keys and coverage keys.
pub fn content_digest(content: &str) -> String {
    format!("{:x}", md5::compute(content.as_bytes()))
}
