use std::cmp::Ordering;

use serde_json::Value as JsonValue;

/// A JSON scalar with a total, type-aware ordering used by filters, sorts
/// and bucketing.
///
/// Strings that look like ISO dates compare as dates, so `"2024-01-09"` and
/// `"2024-01-09T00:00:00"` are equal and order chronologically.
#[derive(Debug, Clone)]
pub enum OrderedValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    DateTime(i64), // millis since epoch
    String(String),
}

impl Eq for OrderedValue {}

impl PartialEq for OrderedValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl PartialOrd for OrderedValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedValue {
    fn cmp(&self, other: &Self) -> Ordering {
        use OrderedValue::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,

            (Boolean(a), Boolean(b)) => a.cmp(b),
            (Boolean(_), _) => Ordering::Less,
            (_, Boolean(_)) => Ordering::Greater,

            (Integer(a), Integer(b)) => a.cmp(b),
            (Integer(a), Float(b)) => (*a as f64).total_cmp(b),
            (Float(a), Integer(b)) => a.total_cmp(&(*b as f64)),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Integer(_) | Float(_), _) => Ordering::Less,
            (_, Integer(_) | Float(_)) => Ordering::Greater,

            (DateTime(a), DateTime(b)) => a.cmp(b),
            (DateTime(_), _) => Ordering::Less,
            (_, DateTime(_)) => Ordering::Greater,

            (String(a), String(b)) => a.cmp(b),
        }
    }
}

impl OrderedValue {
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => OrderedValue::Null,
            JsonValue::Bool(b) => OrderedValue::Boolean(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    OrderedValue::Integer(i)
                } else if let Some(f) = n.as_f64() {
                    OrderedValue::Float(f)
                } else {
                    OrderedValue::Null
                }
            }
            JsonValue::String(s) => Self::parse_string(s),
            // Arrays and objects compare by their serialized form
            other => OrderedValue::String(other.to_string()),
        }
    }

    pub fn parse_string(s: &str) -> Self {
        // Valid date strings start with YYYY-MM
        let b = s.as_bytes();
        if b.len() < 10
            || !b[..4].iter().all(u8::is_ascii_digit)
            || b[4] != b'-'
            || !b[5..7].iter().all(u8::is_ascii_digit)
        {
            return OrderedValue::String(s.to_string());
        }

        if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
            return OrderedValue::DateTime(dt.timestamp_millis());
        }
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
            return OrderedValue::DateTime(dt.and_utc().timestamp_millis());
        }
        if let Ok(d) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            if let Some(dt) = d.and_hms_opt(0, 0, 0) {
                return OrderedValue::DateTime(dt.and_utc().timestamp_millis());
            }
        }
        OrderedValue::String(s.to_string())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, OrderedValue::Null)
    }

    /// Whether two values belong to the same comparison bracket. Range
    /// operators only match values of the same bracket, so `{score: {$gt: 5}}`
    /// never matches a string score.
    pub fn same_bracket(&self, other: &Self) -> bool {
        use OrderedValue::*;
        matches!(
            (self, other),
            (Null, Null)
                | (Boolean(_), Boolean(_))
                | (Integer(_) | Float(_), Integer(_) | Float(_))
                | (DateTime(_), DateTime(_))
                | (String(_), String(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn date_strings_compare_as_dates() {
        let a = OrderedValue::from_json(&json!("2024-01-09"));
        let b = OrderedValue::from_json(&json!("2024-01-10"));
        assert!(matches!(a, OrderedValue::DateTime(_)));
        assert!(a < b);
        assert_eq!(a, OrderedValue::from_json(&json!("2024-01-09T00:00:00")));
    }

    #[test]
    fn phone_numbers_stay_strings() {
        let v = OrderedValue::from_json(&json!("050-1234567"));
        assert!(matches!(v, OrderedValue::String(_)));
    }

    #[test]
    fn integers_and_floats_compare_numerically() {
        assert!(OrderedValue::from_json(&json!(2)) < OrderedValue::from_json(&json!(2.5)));
        assert_eq!(
            OrderedValue::from_json(&json!(85)),
            OrderedValue::from_json(&json!(85.0))
        );
    }

    #[test]
    fn type_ordering() {
        let null = OrderedValue::Null;
        let boolean = OrderedValue::Boolean(true);
        let integer = OrderedValue::Integer(42);
        let date = OrderedValue::DateTime(1000);
        let string = OrderedValue::String("hello".into());
        assert!(null < boolean);
        assert!(boolean < integer);
        assert!(integer < date);
        assert!(date < string);
    }

    #[test]
    fn brackets() {
        assert!(OrderedValue::Integer(1).same_bracket(&OrderedValue::Float(0.5)));
        assert!(!OrderedValue::Integer(1).same_bracket(&OrderedValue::String("1".into())));
    }
}
