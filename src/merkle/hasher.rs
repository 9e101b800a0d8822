// =============================================================================
// Canonical hashing for snapshots and tree nodes
// =============================================================================

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::types::JsonMap;

/// Deterministic SHA-256 of snapshot content.
///
/// The payload is sorted-key JSON with no whitespace so any implementation
/// can independently reproduce the same hash. (`serde_json`'s default map is
/// key-ordered, which covers nested summaries too.)
pub fn canonical_snapshot_hash(
    model_id: &str,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    prediction_count: u64,
    result_summary: &JsonMap,
) -> String {
    let payload = serde_json::json!({
        "model_id": model_id,
        "period_start": period_start.to_rfc3339(),
        "period_end": period_end.to_rfc3339(),
        "prediction_count": prediction_count,
        "result_summary": result_summary,
    });
    let raw = payload.to_string();
    hex_sha256(raw.as_bytes())
}

/// Hash two hex-encoded hashes together: `SHA-256(left + right)` over the
/// ASCII hex strings, never the raw bytes.
pub fn sha256_concat(left: &str, right: &str) -> String {
    hex_sha256(format!("{left}{right}").as_bytes())
}

fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::Value;

    #[test]
    fn content_hash_is_field_order_independent() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 1, 1, 1, 0, 0).unwrap();

        let mut a = JsonMap::new();
        a.insert("value".into(), Value::from(0.5));
        a.insert("ic".into(), Value::from(0.1));
        let mut b = JsonMap::new();
        b.insert("ic".into(), Value::from(0.1));
        b.insert("value".into(), Value::from(0.5));

        assert_eq!(
            canonical_snapshot_hash("m1", start, end, 10, &a),
            canonical_snapshot_hash("m1", start, end, 10, &b)
        );
    }

    #[test]
    fn content_hash_changes_on_any_field() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 1, 1, 1, 0, 0).unwrap();
        let mut summary = JsonMap::new();
        summary.insert("value".into(), Value::from(0.5));

        let base = canonical_snapshot_hash("m1", start, end, 10, &summary);
        assert_ne!(base, canonical_snapshot_hash("m2", start, end, 10, &summary));
        assert_ne!(base, canonical_snapshot_hash("m1", start, end, 11, &summary));

        summary.insert("value".into(), Value::from(0.6));
        assert_ne!(base, canonical_snapshot_hash("m1", start, end, 10, &summary));
    }

    #[test]
    fn concat_hashes_hex_strings_not_bytes() {
        // SHA-256 of the ASCII string "aaaabbbb".
        let expected = {
            let mut hasher = Sha256::new();
            hasher.update(b"aaaabbbb");
            hex::encode(hasher.finalize())
        };
        assert_eq!(sha256_concat("aaaa", "bbbb"), expected);
    }
}
