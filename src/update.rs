use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::expression::{resolve_field, set_field};
use crate::model::ID_FIELD;

/// Apply all update operators in `update` to `doc`.
///
/// `update` must be an object whose keys are operator names (only `$push`
/// is supported) and whose values map field paths to operands. The key
/// field cannot be changed.
pub fn apply_update(doc: &mut Value, update: &Value) -> Result<()> {
    let obj = update
        .as_object()
        .ok_or_else(|| Error::QuerySyntax("update must be an object".into()))?;

    for (op, fields) in obj {
        let fields = fields
            .as_object()
            .ok_or_else(|| Error::QuerySyntax(format!("{op} value must be an object")))?;
        if fields.keys().any(|path| path == ID_FIELD) {
            return Err(Error::QuerySyntax(format!(
                "field '{ID_FIELD}' is immutable"
            )));
        }
        match op.as_str() {
            "$push" => apply_push(doc, fields)?,
            _ => {
                return Err(Error::QuerySyntax(format!(
                    "unknown update operator: {op}"
                )));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Array operators
// ---------------------------------------------------------------------------

/// `$push` appends one value, or every value of `{$each: [...]}`.
fn apply_push(doc: &mut Value, fields: &Map<String, Value>) -> Result<()> {
    for (path, value) in fields {
        let items = match value.as_object().and_then(|m| m.get("$each")) {
            Some(Value::Array(each)) => each.clone(),
            Some(_) => {
                return Err(Error::QuerySyntax(format!(
                    "$each for '{path}' must be an array"
                )));
            }
            None => vec![value.clone()],
        };
        match resolve_field(doc, path) {
            Value::Null => set_field(doc, path, Value::Array(items)),
            Value::Array(mut arr) => {
                arr.extend(items);
                set_field(doc, path, Value::Array(arr));
            }
            _ => {
                return Err(Error::QuerySyntax(format!(
                    "$push requires field '{path}' to be an array"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn push_appends_in_order() {
        let mut doc = json!({"id": 1, "marks": [{"score": 1}]});
        apply_update(&mut doc, &json!({"$push": {"marks": {"score": 2}}})).unwrap();
        apply_update(
            &mut doc,
            &json!({"$push": {"marks": {"$each": [{"score": 3}, {"score": 4}]}}}),
        )
        .unwrap();
        assert_eq!(
            doc["marks"],
            json!([{"score": 1}, {"score": 2}, {"score": 3}, {"score": 4}])
        );
    }

    #[test]
    fn push_creates_array_from_missing() {
        let mut doc = json!({"id": 1});
        apply_update(&mut doc, &json!({"$push": {"marks": {"score": 1}}})).unwrap();
        assert_eq!(doc["marks"], json!([{"score": 1}]));
    }

    #[test]
    fn push_error_on_non_array() {
        let mut doc = json!({"id": 1, "marks": "none"});
        assert!(apply_update(&mut doc, &json!({"$push": {"marks": 1}})).is_err());
    }

    #[test]
    fn id_is_immutable() {
        let mut doc = json!({"id": 1});
        let err = apply_update(&mut doc, &json!({"$push": {"id": 2}})).unwrap_err();
        assert!(matches!(err, Error::QuerySyntax(_)));
        assert_eq!(doc["id"], 1);
    }

    #[test]
    fn unknown_operator() {
        let mut doc = json!({"id": 1});
        for op in ["$set", "$inc", "$rename"] {
            let err = apply_update(&mut doc, &json!({ op: {"a": 1} })).unwrap_err();
            assert!(matches!(err, Error::QuerySyntax(_)));
        }
        assert_eq!(doc, json!({"id": 1}));
    }
}
