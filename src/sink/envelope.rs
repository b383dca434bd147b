//! The `{error, message, data}` wrapper every server reply uses.

use serde::Deserialize;
use serde_json::Value;

use super::SinkError;

/// Decoded reply wrapper.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Envelope {
    /// Zero on success.
    #[serde(default)]
    pub error: i64,
    /// Human-readable status.
    #[serde(default)]
    pub message: String,
    /// Payload.
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Parses `body` and fails when the envelope reports an error.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Decode`] for malformed JSON and
    /// [`SinkError::Server`] for a non-zero `error` code.
    pub fn parse(endpoint: &str, body: &str) -> Result<Self, SinkError> {
        let envelope: Self = serde_json::from_str(body).map_err(|err| SinkError::Decode {
            endpoint: endpoint.to_owned(),
            message: err.to_string(),
        })?;
        if envelope.error != 0 {
            return Err(SinkError::Server {
                endpoint: endpoint.to_owned(),
                code: envelope.error,
                message: envelope.message,
            });
        }
        Ok(envelope)
    }

    /// Reads an unsigned integer at `path` inside `data`.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Decode`] when the field is missing or not an
    /// unsigned integer.
    pub fn data_u64(&self, endpoint: &str, path: &str) -> Result<u64, SinkError> {
        self.data_field(path)
            .and_then(value_as_u64)
            .ok_or_else(|| missing(endpoint, path))
    }

    /// Reads a field at `path` inside `data`, which may be nested with `.`.
    #[must_use]
    pub fn data_field(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(&self.data, |value, key| value.get(key))
    }

    /// Reads a string at `path` inside `data`.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Decode`] when the field is missing or not a
    /// string.
    pub fn data_str(&self, endpoint: &str, path: &str) -> Result<String, SinkError> {
        self.data_field(path)
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| missing(endpoint, path))
    }
}

/// Accepts both numbers and numeric strings; the server is not consistent.
fn value_as_u64(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|text| text.trim().parse().ok()))
}

fn missing(endpoint: &str, path: &str) -> SinkError {
    SinkError::Decode {
        endpoint: endpoint.to_owned(),
        message: format!("missing data.{path}"),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn non_zero_error_is_a_server_failure() {
        let err = Envelope::parse("x/", r#"{"error": 3, "message": "nope", "data": null}"#)
            .expect_err("error code");
        assert!(matches!(err, SinkError::Server { code: 3, .. }));
    }

    #[rstest]
    #[case(r#"{"error":0,"message":"","data":{"id":42}}"#)]
    #[case(r#"{"error":0,"message":"","data":{"id":"42"}}"#)]
    fn ids_are_read_from_numbers_or_strings(#[case] body: &str) {
        let envelope = Envelope::parse("x/", body).expect("envelope");
        assert_eq!(envelope.data_u64("x/", "id").expect("id"), 42);
    }

    #[test]
    fn nested_paths_resolve() {
        let envelope =
            Envelope::parse("x/", r#"{"error":0,"data":{"user":{"token":"abc"}}}"#).expect("parse");
        assert_eq!(envelope.data_str("x/", "user.token").expect("token"), "abc");
        assert!(envelope.data_str("x/", "user.name").is_err());
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        assert!(matches!(
            Envelope::parse("x/", "<html>"),
            Err(SinkError::Decode { .. })
        ));
    }
}
