use chrono::DateTime;
use serde_json::Value;

/// Reads an external version from a document field.
///
/// Integers are used as they are. Dates, as RFC 3339 strings or extended JSON `{"$date": ..}`
/// objects, become epoch milliseconds. Anything else has no usable version.
pub fn version_as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_u64().and_then(|value| i64::try_from(value).ok()))
            .or_else(|| {
                number
                    .as_f64()
                    .filter(|value| value.fract() == 0.0)
                    .map(|value| value as i64)
            }),
        Value::String(text) => text.parse::<i64>().ok().or_else(|| {
            DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|date| date.timestamp_millis())
        }),
        Value::Object(object) => object.get("$date").and_then(|date| match date {
            Value::Object(inner) => inner.get("$numberLong").and_then(version_as_integer),
            other => version_as_integer(other),
        }),
        _ => None,
    }
}

/// Version carried by a delete: one above the currently indexed version, so an external
/// version check accepts it.
pub fn increment_version_for_deletion(version: Option<i64>) -> Option<i64> {
    version.and_then(|version| version.checked_add(1))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn integers_are_used_as_is() {
        assert_eq!(version_as_integer(&json!(17)), Some(17));
        assert_eq!(version_as_integer(&json!(4.0)), Some(4));
        assert_eq!(version_as_integer(&json!(4.5)), None);
        assert_eq!(version_as_integer(&json!("12")), Some(12));
    }

    #[test]
    fn dates_become_epoch_millis() {
        assert_eq!(
            version_as_integer(&json!("2023-11-14T22:13:20Z")),
            Some(1_700_000_000_000)
        );
        assert_eq!(
            version_as_integer(&json!("2023-11-14T22:13:20.250+00:00")),
            Some(1_700_000_000_250)
        );
        assert_eq!(
            version_as_integer(&json!({"$date": "2023-11-14T22:13:20Z"})),
            Some(1_700_000_000_000)
        );
        assert_eq!(
            version_as_integer(&json!({"$date": {"$numberLong": "1700000000000"}})),
            Some(1_700_000_000_000)
        );
    }

    #[test]
    fn other_values_have_no_version() {
        assert_eq!(version_as_integer(&json!(null)), None);
        assert_eq!(version_as_integer(&json!("yesterday")), None);
        assert_eq!(version_as_integer(&json!([1])), None);
    }

    #[test]
    fn deletion_increments_known_versions() {
        assert_eq!(increment_version_for_deletion(Some(7)), Some(8));
        assert_eq!(increment_version_for_deletion(None), None);
        assert_eq!(increment_version_for_deletion(Some(i64::MAX)), None);
    }
}
