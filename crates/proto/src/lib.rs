//! AnyInfer wire messages
//!
//! Requests and responses travel through the broker as JSON objects. User
//! fields are carried verbatim next to the reserved keys:
//!
//! - request: `{...fields, "uid": "...", "pid": "..."}`
//! - response: `{...fields, "uid": "...", "pid": "...", "prediction": ...}`

use anyinfer_common::{AnyInferError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key carrying the correlation identifier
pub const UID_KEY: &str = "uid";

/// Key carrying the sender identifier (output routing key)
pub const PID_KEY: &str = "pid";

/// Key carrying the inference output
pub const PREDICTION_KEY: &str = "prediction";

/// An inference request as published to the input queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation identifier, unique per request
    pub uid: String,

    /// Identifier of the sending client
    pub pid: String,

    /// Arbitrary user fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// A request paired with its prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(flatten)]
    pub request: Request,

    pub prediction: Value,
}

impl Request {
    /// Build a request; reserved keys in `fields` are dropped
    pub fn new(
        uid: impl Into<String>,
        pid: impl Into<String>,
        mut fields: Map<String, Value>,
    ) -> Self {
        fields.remove(UID_KEY);
        fields.remove(PID_KEY);
        Self {
            uid: uid.into(),
            pid: pid.into(),
            fields,
        }
    }

    /// Look up a user field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Encode as JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from JSON bytes
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body)
            .map_err(|e| AnyInferError::malformed(format!("request: {}", e)))
    }
}

impl Response {
    /// Merge a prediction into its request
    ///
    /// A user field named `prediction` is replaced by the inference output.
    pub fn new(mut request: Request, prediction: Value) -> Self {
        request.fields.remove(PREDICTION_KEY);
        Self {
            request,
            prediction,
        }
    }

    /// Correlation identifier of the originating request
    pub fn uid(&self) -> &str {
        &self.request.uid
    }

    /// Routing key of the client waiting for this response
    pub fn pid(&self) -> &str {
        &self.request.pid
    }

    /// Look up a user field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.request.get(key)
    }

    /// Flatten into the JSON object seen on the wire
    pub fn into_value(self) -> Value {
        let mut object = self.request.fields;
        object.insert(UID_KEY.to_string(), Value::String(self.request.uid));
        object.insert(PID_KEY.to_string(), Value::String(self.request.pid));
        object.insert(PREDICTION_KEY.to_string(), self.prediction);
        Value::Object(object)
    }

    /// Encode as JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from JSON bytes
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body)
            .map_err(|e| AnyInferError::malformed(format!("response: {}", e)))
    }
}
