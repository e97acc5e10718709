//! Encoding filters for the template environment

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use minijinja::value::Value;
use minijinja::{Environment, Error, ErrorKind};

/// Register all filters on the environment
pub fn register(env: &mut Environment<'static>) {
    env.add_filter("toJSON", to_json);
    env.add_filter("toYAML", to_yaml);
    env.add_filter("b64enc", b64enc);
    env.add_filter("b64dec", b64dec);
}

/// Serialize any value as compact JSON
fn to_json(value: Value) -> Result<String, Error> {
    serde_json::to_string(&value)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("toJSON failed: {}", e)))
}

/// Serialize any value as YAML
fn to_yaml(value: Value) -> Result<String, Error> {
    serde_yaml::to_string(&value)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("toYAML failed: {}", e)))
}

/// Base64-encode a string
fn b64enc(value: &str) -> String {
    BASE64.encode(value.as_bytes())
}

/// Base64-decode into a UTF-8 string
fn b64dec(value: &str) -> Result<String, Error> {
    let bytes = BASE64
        .decode(value.trim())
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("b64dec failed: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("b64dec produced invalid utf-8: {}", e),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_json_is_compact() {
        let value = Value::from_serialize(serde_json::json!({"a": 1, "b": [true]}));
        assert_eq!(to_json(value).unwrap(), r#"{"a":1,"b":[true]}"#);
    }

    #[test]
    fn to_yaml_renders_maps() {
        let value = Value::from_serialize(serde_json::json!({"replicas": 3}));
        assert_eq!(to_yaml(value).unwrap().trim(), "replicas: 3");
    }

    #[test]
    fn b64_round_trips() {
        assert_eq!(b64enc("foo"), "Zm9v");
        assert_eq!(b64dec("Zm9v").unwrap(), "foo");
    }

    #[test]
    fn b64dec_rejects_garbage() {
        assert!(b64dec("!!not-base64!!").is_err());
    }
}
