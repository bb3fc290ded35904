//! Data models shared across the access layer.

use serde::{Deserialize, Serialize};

/// A positional parameter value for parameterized statements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
}

impl SqlParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
        }
    }
}

impl From<i64> for SqlParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for SqlParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for SqlParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for SqlParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl<T: Into<SqlParam>> From<Option<T>> for SqlParam {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => Self::Null,
        }
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_names() {
        assert_eq!(SqlParam::Null.type_name(), "null");
        assert_eq!(SqlParam::Int(7).type_name(), "int");
        assert_eq!(SqlParam::String("x".into()).type_name(), "string");
        assert_eq!(SqlParam::Bytes(vec![1, 2]).type_name(), "bytes");
    }

    #[test]
    fn test_is_null() {
        assert!(SqlParam::Null.is_null());
        assert!(!SqlParam::Int(0).is_null());
        assert!(SqlParam::from(None::<i64>).is_null());
    }

    #[test]
    fn test_from_conversions() {
        assert_eq!(SqlParam::from(42i64), SqlParam::Int(42));
        assert_eq!(SqlParam::from("hi"), SqlParam::String("hi".to_string()));
        assert_eq!(SqlParam::from(true), SqlParam::Bool(true));
        assert_eq!(SqlParam::from(Some(1i64)), SqlParam::Int(1));
    }

    #[test]
    fn test_serde_untagged_roundtrip() {
        let params = vec![
            SqlParam::Int(1),
            SqlParam::String("One".to_string()),
            SqlParam::Bool(false),
        ];
        let json = serde_json::to_string(&params).unwrap();
        assert_eq!(json, r#"[1,"One",false]"#);
        let back: Vec<SqlParam> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, params);
    }
}
