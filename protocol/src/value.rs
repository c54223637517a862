use crate::Format;
use anyhow::{bail, Result};
use common::ScatterError;
use smol_str::{format_smolstr, SmolStr};
use std::sync::Arc;

/// A typed argument value as handed over by the host runtime.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Text(SmolStr),
    Bytes(Box<[u8]>),
    /// One-dimensional array.
    Array(DatumArray),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// A deconstructed array argument: elements plus their null flags.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DatumArray {
    pub values: Vec<Value>,
    pub nulls: Vec<bool>,
}

impl DatumArray {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn push(&mut self, value: Value) {
        self.nulls.push(value.is_null());
        self.values.push(value);
    }

    /// Deconstruct an argument value into element form. NULL counts as an
    /// empty array; nested arrays are rejected as multi-dimensional.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(DatumArray::default()),
            Value::Array(da) => {
                if da.values.iter().any(|v| matches!(v, Value::Array(_))) {
                    bail!(ScatterError::Split(
                        "split multi-dimensional arrays are not supported".into()
                    ));
                }
                Ok(da.clone())
            }
            other => bail!(ScatterError::Split(format_smolstr!(
                "split argument is not an array: {other:?}"
            ))),
        }
    }
}

/// An encoded parameter. The byte payload is refcounted so one encoding
/// of a non-split argument can be shared by every selected partition.
#[derive(Clone, Debug)]
pub struct EncodedParam {
    pub bytes: Arc<[u8]>,
    pub format: Format,
}

impl EncodedParam {
    pub fn text(rendered: String) -> Self {
        Self {
            bytes: rendered.into_bytes().into(),
            format: Format::Text,
        }
    }
}

/// Render a value in the backend's text format. None carries SQL NULL.
pub fn render_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Int2(v) => Some(v.to_string()),
        Value::Int4(v) => Some(v.to_string()),
        Value::Int8(v) => Some(v.to_string()),
        Value::Text(s) => Some(s.to_string()),
        Value::Bytes(b) => {
            let mut out = String::with_capacity(2 + b.len() * 2);
            out.push_str("\\x");
            for byte in b.iter() {
                out.push_str(&format!("{byte:02x}"));
            }
            Some(out)
        }
        Value::Array(da) => Some(render_array_text(da)),
    }
}

fn render_array_text(da: &DatumArray) -> String {
    let mut out = String::from("{");
    for (i, v) in da.values.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        match render_text(v) {
            None => out.push_str("NULL"),
            Some(elem) => match v {
                Value::Text(_) | Value::Bytes(_) => {
                    out.push('"');
                    for ch in elem.chars() {
                        if ch == '"' || ch == '\\' {
                            out.push('\\');
                        }
                        out.push(ch);
                    }
                    out.push('"');
                }
                _ => out.push_str(&elem),
            },
        }
    }
    out.push('}');
    out
}
