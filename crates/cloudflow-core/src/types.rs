use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Opaque JSON payload attached to a task.
///
/// The engine never interprets the contents; only the handler registered
/// for the task's action name knows the shape. The same wrapper carries
/// handler results back into the store.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Params {
    value: serde_json::Value,
}

impl Params {
    /// Wrap a JSON value
    #[inline]
    pub fn new(value: serde_json::Value) -> Self {
        Self { value }
    }

    /// A null payload
    #[inline]
    pub fn null() -> Self {
        Self {
            value: serde_json::Value::Null,
        }
    }

    /// Borrow the inner JSON value
    #[inline]
    pub fn as_value(&self) -> &serde_json::Value {
        &self.value
    }

    /// Take ownership of the inner JSON value
    #[inline]
    pub fn into_value(self) -> serde_json::Value {
        self.value
    }

    /// Check whether the payload is null
    #[inline]
    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }

    /// Look up a field when the payload is an object
    #[inline]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.value.get(key)
    }

    /// Decode the payload into a handler-defined type
    pub fn decode<T>(&self) -> Result<T, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_value(self.value.clone())
    }

    /// Build a payload from any serializable value
    pub fn encode<T>(value: &T) -> Result<Self, serde_json::Error>
    where
        T: Serialize,
    {
        Ok(Self::new(serde_json::to_value(value)?))
    }
}

impl From<serde_json::Value> for Params {
    fn from(value: serde_json::Value) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_params_roundtrip() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct CreateEip {
            region: String,
            count: u32,
        }

        let source = CreateEip {
            region: "ap-southeast-1".to_string(),
            count: 2,
        };

        let params = Params::encode(&source).unwrap();
        assert_eq!(params.get("region").unwrap(), &json!("ap-southeast-1"));

        let decoded: CreateEip = params.decode().unwrap();
        assert_eq!(decoded, source);
    }

    #[test]
    fn test_params_null() {
        let params = Params::null();
        assert!(params.is_null());
        assert!(params.get("anything").is_none());
    }

    #[test]
    fn test_params_serde_transparent() {
        let params = Params::new(json!({"vpc": "vpc-1"}));
        let serialized = serde_json::to_string(&params).unwrap();
        assert_eq!(serialized, r#"{"vpc":"vpc-1"}"#);

        let back: Params = serde_json::from_str(&serialized).unwrap();
        assert_eq!(back, params);
    }
}
