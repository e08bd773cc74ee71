//! Byte-size estimation for cached payloads.
//!
//! The cache never measures the encoded size of what the backend writes; it
//! uses a cheap structural estimate instead. Strings count two bytes per
//! UTF-16 code unit, numbers eight, booleans four, and containers the sum of
//! their members (object keys included).

use serde_json::Value;

const NUMBER_SIZE: u64 = 8;
const BOOL_SIZE: u64 = 4;

/// Estimated size of a string: two bytes per UTF-16 code unit.
pub fn estimate_str(s: &str) -> u64 {
    2 * s.encode_utf16().count() as u64
}

/// Estimated size of an arbitrary JSON value.
pub fn estimate_size(value: &Value) -> u64 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => BOOL_SIZE,
        Value::Number(_) => NUMBER_SIZE,
        Value::String(s) => estimate_str(s),
        Value::Array(items) => items.iter().map(estimate_size).sum(),
        Value::Object(members) => members
            .iter()
            .map(|(k, v)| estimate_str(k) + estimate_size(v))
            .sum(),
    }
}

/// Estimated size of a cache entry: its key plus its value.
pub fn estimate_entry_size(key: &str, value: &Value) -> u64 {
    estimate_str(key) + estimate_size(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn scalars() {
        assert_eq!(estimate_size(&Value::Null), 0);
        assert_eq!(estimate_size(&json!(true)), 4);
        assert_eq!(estimate_size(&json!(42)), 8);
        assert_eq!(estimate_size(&json!(1.5)), 8);
        assert_eq!(estimate_size(&json!("abc")), 6);
    }

    #[test]
    fn non_bmp_characters_count_as_surrogate_pairs() {
        // U+1F600 is two UTF-16 code units.
        assert_eq!(estimate_str("\u{1F600}"), 4);
        assert_eq!(estimate_str("é"), 2);
    }

    #[test]
    fn containers_sum_their_members() {
        let value = json!({"ab": [1, "xy", false], "c": null});
        // "ab" = 4, [8 + 4 + 4] = 16, "c" = 2, null = 0
        assert_eq!(estimate_size(&value), 22);
    }

    #[test]
    fn entry_includes_key() {
        let value = json!("x".repeat(150));
        assert_eq!(estimate_entry_size("a", &value), 302);
    }

    proptest! {
        #[test]
        fn array_estimate_is_sum_of_parts(parts in proptest::collection::vec(".{0,16}", 0..8)) {
            let expected: u64 = parts.iter().map(|s| estimate_str(s)).sum();
            let value = Value::Array(parts.into_iter().map(Value::String).collect());
            prop_assert_eq!(estimate_size(&value), expected);
        }
    }
}
