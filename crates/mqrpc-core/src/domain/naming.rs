//! Queue naming conventions.

use super::ids::{REPLY_SUFFIX_LEN, random_suffix};

/// Service method の request queue 名: `<service>.<method>`
pub fn queue_name(service: &str, method: &str) -> String {
    format!("{service}.{method}")
}

/// Client reply queue 名: `<registry_id>.<random suffix>`
///
/// 同じ id を共有する複数の TaskRegistry が衝突しないように suffix を付けます。
pub fn reply_queue_name(registry_id: &str) -> String {
    format!("{registry_id}.{}", random_suffix(REPLY_SUFFIX_LEN))
}
