//! Duck typing: coerce untyped values into their declared schema types
//!
//! Templates render everything as YAML scalars, so integers, booleans and
//! embedded objects frequently arrive as strings. The walk below visits
//! every leaf of an unstructured object, looks up the declared type of its
//! dotted path against the kind's schema, and coerces the value.
//!
//! Two failure modes are deliberately different: a path the schema does not
//! know passes through untouched (CRDs with open schemas are common), while
//! a coercion that cannot be performed on a known path (`"abc"` declared
//! integer) is an error.

use serde_json::{Map, Number, Value};
use tracing::debug;

use super::openapi::{Document, Schema};
use super::resolver::{find_type_in, TypedField};
use crate::{Error, Result};

/// Coerce `value` (an unstructured object) against the root `schema`.
///
/// The result is a new value; the walk is idempotent.
pub fn duck_type(document: &Document, schema: &Schema, value: Value) -> Result<Value> {
    duck_type_at(document, schema, value, "")
}

fn duck_type_at(document: &Document, schema: &Schema, value: Value, prefix: &str) -> Result<Value> {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, child) in map {
                let child_prefix = join_prefix(prefix, &escape_dots(&key));
                out.insert(key, duck_type_at(document, schema, child, &child_prefix)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (index, child) in items.into_iter().enumerate() {
                let child_prefix = join_prefix(prefix, &index.to_string());
                out.push(duck_type_at(document, schema, child, &child_prefix)?);
            }
            Ok(Value::Array(out))
        }
        Value::String(s) => match lookup(document, schema, prefix) {
            Some(field) => transform_string(s, &field, prefix),
            None => Ok(Value::String(s)),
        },
        Value::Number(n) => match lookup(document, schema, prefix) {
            Some(field) => transform_number(n, &field, prefix),
            None => Ok(Value::Number(n)),
        },
        Value::Bool(b) => match lookup(document, schema, prefix) {
            Some(field) => transform_bool(b, &field, prefix),
            None => Ok(Value::Bool(b)),
        },
        // Nulls carry strategic-merge deletion intent; never touch them.
        Value::Null => Ok(Value::Null),
    }
}

fn lookup(document: &Document, schema: &Schema, prefix: &str) -> Option<TypedField> {
    if prefix.is_empty() {
        return None;
    }
    match find_type_in(document, schema, prefix) {
        Ok(field) => Some(field),
        Err(e) => {
            debug!(key = %prefix, error = %e, "no declared type for key, passing value through");
            None
        }
    }
}

fn join_prefix(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else {
        format!("{}.{}", prefix, segment)
    }
}

// Map keys routinely contain dots (annotation keys, config file names); the
// path grammar reserves the dot, so keys are escaped before concatenation.
fn escape_dots(key: &str) -> String {
    key.replace('.', "_")
}

fn transform_string(value: String, field: &TypedField, path: &str) -> Result<Value> {
    match field.format.as_str() {
        "int8" => return parse_int_width(&value, i8::MIN as i64, i8::MAX as i64, path),
        "int32" => return parse_int_width(&value, i32::MIN as i64, i32::MAX as i64, path),
        "int64" => return parse_int_width(&value, i64::MIN, i64::MAX, path),
        "uint8" => return parse_uint_width(&value, u8::MAX as u64, path),
        "uint32" => return parse_uint_width(&value, u32::MAX as u64, path),
        "uint64" => return parse_uint_width(&value, u64::MAX, path),
        "double" => {
            let f: f64 = value.parse().map_err(|_| coercion_error(path, &value, field))?;
            return Ok(Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null));
        }
        // Secret payloads: already a base64 string on the wire, keep verbatim.
        "byte" => return Ok(Value::String(value)),
        _ => {}
    }

    if field.has_type("string") {
        return Ok(Value::String(value));
    }
    if field.has_type("integer") {
        return parse_int_width(&value, i64::MIN, i64::MAX, path);
    }
    if field.has_type("boolean") {
        return parse_bool(&value)
            .map(Value::Bool)
            .ok_or_else(|| coercion_error(path, &value, field));
    }
    if field.has_type("object") {
        let parsed: Value = serde_json::from_str(&value)
            .map_err(|e| Error::schema(format!(
                "failed to transform string at {} to object: {}", path, e
            )))?;
        return Ok(parsed);
    }

    Err(coercion_error(path, &value, field))
}

fn transform_number(value: Number, field: &TypedField, path: &str) -> Result<Value> {
    if let Some(i) = value.as_i64() {
        return transform_integer(i, field, path);
    }
    if let Some(u) = value.as_u64() {
        return transform_unsigned(u, field, path);
    }
    // Floats targeting integers truncate, then width-check.
    let f = value.as_f64().unwrap_or(0.0);
    if field.has_type("integer") || is_integer_format(&field.format) {
        return transform_integer(f.trunc() as i64, field, path);
    }
    if field.has_type("string") {
        return Ok(Value::String(format!("{}", f)));
    }
    if field.has_type("boolean") {
        return Ok(Value::Bool(f != 0.0));
    }
    if field.has_type("number") || field.format == "double" || field.format == "float" {
        return Ok(Value::Number(value));
    }
    Err(coercion_error(path, &f.to_string(), field))
}

fn transform_integer(value: i64, field: &TypedField, path: &str) -> Result<Value> {
    match field.format.as_str() {
        "int8" => return check_int_width(value, i8::MIN as i64, i8::MAX as i64, path, field),
        "int32" => return check_int_width(value, i32::MIN as i64, i32::MAX as i64, path, field),
        "int64" => return Ok(Value::Number(value.into())),
        "uint8" => return check_int_width(value, 0, u8::MAX as i64, path, field),
        "uint32" => return check_int_width(value, 0, u32::MAX as i64, path, field),
        "uint64" if value >= 0 => return Ok(Value::Number(value.into())),
        "uint64" => return Err(coercion_error(path, &value.to_string(), field)),
        _ => {}
    }

    if field.has_type("integer") || field.has_type("number") {
        return Ok(Value::Number(value.into()));
    }
    if field.has_type("string") {
        return Ok(Value::String(value.to_string()));
    }
    if field.has_type("boolean") {
        return Ok(Value::Bool(value != 0));
    }
    Err(coercion_error(path, &value.to_string(), field))
}

fn transform_unsigned(value: u64, field: &TypedField, path: &str) -> Result<Value> {
    if let Ok(i) = i64::try_from(value) {
        return transform_integer(i, field, path);
    }
    if field.has_type("integer") || field.format == "uint64" {
        return Ok(Value::Number(value.into()));
    }
    if field.has_type("string") {
        return Ok(Value::String(value.to_string()));
    }
    Err(coercion_error(path, &value.to_string(), field))
}

fn transform_bool(value: bool, field: &TypedField, path: &str) -> Result<Value> {
    if field.has_type("boolean") {
        return Ok(Value::Bool(value));
    }
    if field.has_type("string") {
        return Ok(Value::String(value.to_string()));
    }
    if field.has_type("integer") {
        return Ok(Value::Number(i64::from(value).into()));
    }
    Err(coercion_error(path, &value.to_string(), field))
}

fn is_integer_format(format: &str) -> bool {
    matches!(
        format,
        "int8" | "int32" | "int64" | "uint8" | "uint32" | "uint64"
    )
}

fn parse_int_width(value: &str, min: i64, max: i64, path: &str) -> Result<Value> {
    let parsed: i64 = value.trim().parse().map_err(|_| {
        Error::schema(format!("failed to parse '{}' at {} as integer", value, path))
    })?;
    if parsed < min || parsed > max {
        return Err(Error::schema(format!(
            "integer {} at {} out of declared range",
            parsed, path
        )));
    }
    Ok(Value::Number(parsed.into()))
}

fn check_int_width(value: i64, min: i64, max: i64, path: &str, field: &TypedField) -> Result<Value> {
    if value < min || value > max {
        return Err(coercion_error(path, &value.to_string(), field));
    }
    Ok(Value::Number(value.into()))
}

fn parse_uint_width(value: &str, max: u64, path: &str) -> Result<Value> {
    let parsed: u64 = value.trim().parse().map_err(|_| {
        Error::schema(format!("failed to parse '{}' at {} as unsigned integer", value, path))
    })?;
    if parsed > max {
        return Err(Error::schema(format!(
            "integer {} at {} out of declared range",
            parsed, path
        )));
    }
    Ok(Value::Number(parsed.into()))
}

// Accepts the spellings Go's strconv.ParseBool accepts.
fn parse_bool(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

fn coercion_error(path: &str, value: &str, field: &TypedField) -> Error {
    Error::schema(format!(
        "could not transform value '{}' at {} to types {:?} format '{}'",
        value, path, field.types, field.format
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::resolver::fixtures::{document, postgresql_db_schema};
    use serde_json::json;

    fn coerce(value: Value) -> Result<Value> {
        let doc = document();
        let schema = doc.definitions["io.k8s.api.apps.v1.Deployment"].clone();
        duck_type(&doc, &schema, value)
    }

    #[test]
    fn string_replicas_become_integer() {
        let out = coerce(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "nginx", "namespace": "web"},
            "spec": {"replicas": "3"}
        }))
        .unwrap();
        assert_eq!(out["spec"]["replicas"], json!(3));
    }

    #[test]
    fn declared_strings_survive_as_strings() {
        let out = coerce(json!({"metadata": {"name": "nginx"}})).unwrap();
        assert_eq!(out["metadata"]["name"], json!("nginx"));
    }

    #[test]
    fn integer_to_string_field_formats_decimal() {
        let doc = document();
        let schema = doc.definitions["io.k8s.api.core.v1.Secret"].clone();
        let out = duck_type(
            &doc,
            &schema,
            json!({"stringData": {"Host": "localhost", "Port": 8080}}),
        )
        .unwrap();
        assert_eq!(out["stringData"]["Port"], json!("8080"));
        assert_eq!(out["stringData"]["Host"], json!("localhost"));
    }

    #[test]
    fn byte_format_keeps_base64_payload() {
        let doc = document();
        let schema = doc.definitions["io.k8s.api.core.v1.Secret"].clone();
        let out = duck_type(&doc, &schema, json!({"data": {"foo": "YmFy"}})).unwrap();
        assert_eq!(out["data"]["foo"], json!("YmFy"));
    }

    #[test]
    fn string_boolean_parses() {
        let out = coerce(json!({"spec": {"paused": "true"}})).unwrap();
        assert_eq!(out["spec"]["paused"], json!(true));
    }

    #[test]
    fn json_string_becomes_object_for_object_fields() {
        let doc = Document::default();
        let schema = postgresql_db_schema();
        let out = duck_type(
            &doc,
            &schema,
            json!({
                "spec": {
                    "replicas": 2,
                    "postgresql": {
                        "parameters": "{\"max_connections\":\"1024\",\"work_mem\":\"475MB\"}"
                    }
                }
            }),
        )
        .unwrap();
        assert_eq!(out["spec"]["replicas"], json!(2));
        assert_eq!(
            out["spec"]["postgresql"]["parameters"]["max_connections"],
            json!("1024")
        );
    }

    #[test]
    fn unknown_paths_pass_through() {
        let out = coerce(json!({"spec": {"mystery": "value"}, "extra": 7})).unwrap();
        assert_eq!(out["spec"]["mystery"], json!("value"));
        assert_eq!(out["extra"], json!(7));
    }

    #[test]
    fn bad_integer_on_known_path_is_an_error() {
        let err = coerce(json!({"spec": {"replicas": "not-a-number"}})).unwrap_err();
        assert!(err.to_string().contains("not-a-number"));
    }

    #[test]
    fn int32_width_is_checked() {
        let err = coerce(json!({"spec": {"replicas": "3000000000"}})).unwrap_err();
        assert!(err.to_string().contains("out of declared range"));
    }

    #[test]
    fn float_truncates_into_integer_fields() {
        let out = coerce(json!({"spec": {"replicas": 3.9}})).unwrap();
        assert_eq!(out["spec"]["replicas"], json!(3));
    }

    #[test]
    fn nulls_pass_through() {
        let out = coerce(json!({"spec": {"replicas": null}})).unwrap();
        assert_eq!(out["spec"]["replicas"], Value::Null);
    }

    #[test]
    fn dotted_map_keys_are_escaped_before_lookup() {
        // annotation keys contain dots; they must resolve through
        // additionalProperties rather than splitting the path
        let out = coerce(json!({
            "metadata": {"annotations": {"app.kubernetes.io/name": "nginx"}}
        }))
        .unwrap();
        assert_eq!(
            out["metadata"]["annotations"]["app.kubernetes.io/name"],
            json!("nginx")
        );
    }

    #[test]
    fn duck_typing_is_idempotent() {
        let input = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "nginx",
                "annotations": {"a.b": "c"}
            },
            "spec": {"replicas": "3", "paused": "false"}
        });
        let once = coerce(input).unwrap();
        let twice = coerce(once.clone()).unwrap();
        assert_eq!(once, twice);
    }
}
