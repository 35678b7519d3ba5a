//! Wire format for call batches and their responses.
//!
//! A batch is a JSON object `{"calls": [...]}` whose entries keep the order
//! they were queued in. The helper answers with
//! `{"results": [...], "warnings": [...]}`, one result per call.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DispatchError, Result};

/// One named method invocation with positional and keyword arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl Call {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Positional argument `index`, falling back to keyword `name`.
    pub fn param(&self, index: usize, name: &str) -> Option<&Value> {
        self.args.get(index).or_else(|| self.kwargs.get(name))
    }

    pub fn str_param(&self, index: usize, name: &str) -> Result<&str> {
        self.param(index, name)
            .and_then(Value::as_str)
            .ok_or_else(|| self.invalid(format!("missing string argument '{}'", name)))
    }

    pub fn bool_param(&self, index: usize, name: &str, default: bool) -> Result<bool> {
        match self.param(index, name) {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(self.invalid(format!("argument '{}' is not a boolean", name))),
        }
    }

    fn invalid(&self, message: String) -> DispatchError {
        DispatchError::InvalidCall {
            method: self.method.clone(),
            message,
        }
    }
}

impl std::fmt::Display for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(", self.method)?;
        let mut first = true;
        for arg in &self.args {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}", arg)?;
            first = false;
        }
        for (name, value) in &self.kwargs {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", name, value)?;
            first = false;
        }
        write!(f, ")")
    }
}

#[derive(Deserialize)]
struct CallBatch {
    calls: Vec<Call>,
}

pub fn encode_batch(calls: &[Call]) -> Result<String> {
    #[derive(Serialize)]
    struct Borrowed<'a> {
        calls: &'a [Call],
    }
    Ok(serde_json::to_string(&Borrowed { calls })?)
}

pub fn decode_batch(payload: &str) -> Result<Vec<Call>> {
    let batch: CallBatch = serde_json::from_str(payload)?;
    Ok(batch.calls)
}

/// Structured reply from the drone helper.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteResponse {
    pub results: Vec<Value>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl RemoteResponse {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload.trim())?)
    }
}
