//! Values produced by read strategies before assignment into typed fields.

use crate::errors::DecodeError;

/// A value produced when reading a field from raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    U64(u64),
    I64(i64),
    Bytes(Vec<u8>),
    Str(String),
}

impl Value {
    /// Short name of the value's kind, used in mismatch errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::U64(_) => "u64",
            Value::I64(_) => "i64",
            Value::Bytes(_) => "bytes",
            Value::Str(_) => "str",
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            Value::U64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Checked accessor for field setters. Names the field in the error.
    pub fn expect_u64(self, field: &str) -> Result<u64, DecodeError> {
        let kind = self.kind();
        self.as_u64().ok_or_else(|| DecodeError::ValueMismatch {
            field: field.to_string(),
            got: kind,
        })
    }

    /// Checked accessor for field setters. Names the field in the error.
    pub fn expect_i64(self, field: &str) -> Result<i64, DecodeError> {
        let kind = self.kind();
        self.as_i64().ok_or_else(|| DecodeError::ValueMismatch {
            field: field.to_string(),
            got: kind,
        })
    }

    /// Checked accessor for field setters. Names the field in the error.
    pub fn expect_bytes(self, field: &str) -> Result<Vec<u8>, DecodeError> {
        match self {
            Value::Bytes(b) => Ok(b),
            other => Err(DecodeError::ValueMismatch {
                field: field.to_string(),
                got: other.kind(),
            }),
        }
    }

    /// Checked accessor for field setters. Names the field in the error.
    pub fn expect_str(self, field: &str) -> Result<String, DecodeError> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(DecodeError::ValueMismatch {
                field: field.to_string(),
                got: other.kind(),
            }),
        }
    }
}
