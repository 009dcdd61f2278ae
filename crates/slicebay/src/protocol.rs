//! Engine wire protocol.
//!
//! Every message between the orchestrator and the engine worker is an
//! [`Envelope`]: a function name, a sequence id and an opaque JSON payload.
//! Function names are the engine's dotted paths (`kiri.api.slice`); on this
//! side they are parsed into the closed [`EngineCall`] enum and anything else
//! is rejected with [`SliceError::UnknownEngineCall`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SliceError};

/// Functions known to the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineCall {
    /// Handshake request.
    Init,
    /// Handshake reply, sent unsolicited by the engine.
    InitDone,
    /// Reply to a call, correlated by sequence id.
    Ack,
    /// Engine progress notice.
    Status,
    /// Load a device profile.
    SetDevice,
    /// Load a process profile.
    SetProcess,
    /// Parse model bytes.
    Parse,
    /// Slice the parsed model.
    Slice,
    /// Plan toolpaths.
    Prepare,
    /// Emit machine code.
    Export,
}

impl EngineCall {
    /// Entry points an engine must export to be usable.
    pub const REQUIRED: [EngineCall; 6] = [
        EngineCall::SetDevice,
        EngineCall::SetProcess,
        EngineCall::Parse,
        EngineCall::Slice,
        EngineCall::Prepare,
        EngineCall::Export,
    ];

    /// Wire name.
    pub fn name(&self) -> &'static str {
        match self {
            EngineCall::Init => "init",
            EngineCall::InitDone => "init_done",
            EngineCall::Ack => "ack",
            EngineCall::Status => "status",
            EngineCall::SetDevice => "kiri.api.set_device",
            EngineCall::SetProcess => "kiri.api.set_process",
            EngineCall::Parse => "kiri.api.parse",
            EngineCall::Slice => "kiri.api.slice",
            EngineCall::Prepare => "kiri.api.prepare",
            EngineCall::Export => "kiri.api.export",
        }
    }
}

impl fmt::Display for EngineCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EngineCall {
    type Err = SliceError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "init" => EngineCall::Init,
            "init_done" => EngineCall::InitDone,
            "ack" => EngineCall::Ack,
            "status" => EngineCall::Status,
            "kiri.api.set_device" => EngineCall::SetDevice,
            "kiri.api.set_process" => EngineCall::SetProcess,
            "kiri.api.parse" => EngineCall::Parse,
            "kiri.api.slice" => EngineCall::Slice,
            "kiri.api.prepare" => EngineCall::Prepare,
            "kiri.api.export" => EngineCall::Export,
            other => return Err(SliceError::UnknownEngineCall(other.to_string())),
        })
    }
}

fn is_zero(seq: &u64) -> bool {
    *seq == 0
}

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Dotted function path.
    pub f: String,
    /// Sequence id; 0 for fire-and-forget notifications.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub seq: u64,
    /// Opaque payload.
    #[serde(default)]
    pub data: Value,
    /// Binary buffers moved alongside the envelope; never serialized.
    #[serde(skip)]
    pub buffers: Vec<Vec<u8>>,
}

impl Envelope {
    /// Build an envelope for a known call.
    pub fn new(call: EngineCall, seq: u64, data: Value) -> Self {
        Self {
            f: call.name().to_string(),
            seq,
            data,
            buffers: Vec::new(),
        }
    }

    /// Fire-and-forget notification.
    pub fn notify(call: EngineCall, data: Value) -> Self {
        Self::new(call, 0, data)
    }

    /// Reply to the call with sequence id `seq`.
    pub fn ack(seq: u64, reply: Reply) -> Self {
        Self::new(EngineCall::Ack, seq, reply.into_value())
    }

    /// Attach binary buffers.
    pub fn with_buffers(mut self, buffers: Vec<Vec<u8>>) -> Self {
        self.buffers = buffers;
        self
    }

    /// Parse the function name.
    pub fn call(&self) -> Result<EngineCall> {
        self.f.parse()
    }
}

/// Payload of an `ack` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reply {
    /// Call succeeded.
    Ok(Value),
    /// Call failed with an engine message.
    Err(String),
}

impl Reply {
    /// Convert into a JSON value.
    pub fn into_value(self) -> Value {
        match self {
            Reply::Ok(value) => serde_json::json!({ "ok": value }),
            Reply::Err(message) => serde_json::json!({ "err": message }),
        }
    }

    /// Decode an ack payload.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| SliceError::Protocol(e.to_string()))
    }

    /// Convert into a `Result`, leaving error tagging to the caller.
    pub fn into_result(self) -> std::result::Result<Value, String> {
        match self {
            Reply::Ok(value) => Ok(value),
            Reply::Err(message) => Err(message),
        }
    }
}

/// Progress reported by the engine outside of call replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineNotice {
    /// Partial progress within a phase (0.0 to 1.0).
    Progress {
        /// Engine function reporting progress.
        call: String,
        /// Fraction complete.
        fraction: f64,
    },
    /// Slicing finished.
    SliceComplete,
    /// Toolpath preparation finished.
    PrepareComplete,
    /// Export finished.
    ExportComplete,
    /// Free-form engine log line.
    Log {
        /// Message text.
        message: String,
    },
}

impl EngineNotice {
    /// Wrap into a `status` notification.
    pub fn into_envelope(self) -> Envelope {
        let data = serde_json::to_value(&self).unwrap_or(Value::Null);
        Envelope::notify(EngineCall::Status, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_names_round_trip() {
        for call in EngineCall::REQUIRED {
            assert_eq!(call.name().parse::<EngineCall>().unwrap(), call);
        }
        assert_eq!("ack".parse::<EngineCall>().unwrap(), EngineCall::Ack);
    }

    #[test]
    fn test_unknown_call() {
        let err = "kiri.api.explode".parse::<EngineCall>().unwrap_err();
        assert_eq!(err, SliceError::UnknownEngineCall("kiri.api.explode".into()));
    }

    #[test]
    fn test_notification_omits_seq() {
        let env = Envelope::notify(EngineCall::InitDone, Value::Null);
        let json = serde_json::to_string(&env).unwrap();
        assert!(!json.contains("seq"));

        let decoded: Envelope = serde_json::from_str(r#"{"f":"init_done"}"#).unwrap();
        assert_eq!(decoded.seq, 0);
        assert_eq!(decoded.data, Value::Null);
    }

    #[test]
    fn test_buffers_not_serialized() {
        let env = Envelope::new(EngineCall::Parse, 4, json!({"name": "cube.stl"}))
            .with_buffers(vec![vec![1, 2, 3]]);
        let decoded: Envelope = serde_json::from_value(serde_json::to_value(&env).unwrap()).unwrap();
        assert_eq!(decoded.seq, 4);
        assert!(decoded.buffers.is_empty());
    }

    #[test]
    fn test_reply_payload() {
        let value = Reply::Err("bad mesh".into()).into_value();
        assert_eq!(value, json!({"err": "bad mesh"}));
        assert_eq!(
            Reply::from_value(json!({"ok": 3})).unwrap(),
            Reply::Ok(json!(3))
        );
        assert!(Reply::from_value(json!({"maybe": 1})).is_err());
    }

    #[test]
    fn test_notice_shape() {
        let env = EngineNotice::Progress {
            call: "kiri.api.slice".into(),
            fraction: 0.5,
        }
        .into_envelope();
        assert_eq!(env.f, "status");
        assert_eq!(env.data["event"], "progress");
    }
}
