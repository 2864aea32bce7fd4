use sha2::{Digest, Sha256};

use crate::job::{DateInput, IntervalInput};

/// Fingerprints the timing-relevant fields of a definition.
///
/// Any change to `name`, `interval`, `starts` or `ends` produces a new hash,
/// which invalidates occurrences queued under the previous one. Fields are
/// hashed in their JSON form, each followed by a separator byte so adjacent
/// values cannot run together.
pub fn version_hash(
  name: &str,
  interval: &IntervalInput,
  starts: Option<&DateInput>,
  ends: Option<&DateInput>,
) -> String {
  let mut hasher = Sha256::new();
  for part in [
    serde_json::json!(name),
    serde_json::json!(interval),
    serde_json::json!(starts),
    serde_json::json!(ends),
  ] {
    hasher.update(part.to_string().as_bytes());
    hasher.update([0x1f]);
  }
  hex::encode(hasher.finalize())
}
