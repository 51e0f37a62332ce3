//! Messages exchanged between the scheduler and its workers.
//!
//! Each message is JSON-serialized and carried in one length-prefixed frame
//! (see [`super::ipc`]).

use crate::compiler::{Autoloads, CompileOptions, CompiledUnit};
use crate::error::RemoteError;
use serde::{Deserialize, Serialize};

/// A message on either direction of a worker's channel pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Orchestrator → worker: compile one requirement.
    #[serde(rename = "compile")]
    Compile {
        /// File that declared the requirement.
        origin: String,
        requirement: String,
        autoloads: Autoloads,
        options: CompileOptions,
    },

    /// Worker → orchestrator: the compile finished. `None` means the
    /// requirement was already satisfied elsewhere.
    #[serde(rename = "new_asset")]
    NewAsset { unit: Option<CompiledUnit> },

    /// Worker → orchestrator: requirements discovered while compiling.
    #[serde(rename = "new_requires")]
    NewRequires {
        origin: String,
        requirements: Vec<String>,
        autoloads: Autoloads,
        options: CompileOptions,
    },

    /// Worker → orchestrator: `origin` names a requirement that doesn't exist.
    #[serde(rename = "missing_require_error")]
    MissingRequireError { origin: String, error: RemoteError },

    /// Worker → orchestrator: anything else went wrong.
    #[serde(rename = "fault")]
    Fault { error: RemoteError },

    /// Either direction: no more messages will follow.
    #[serde(rename = "close")]
    Close,
}

impl Message {
    /// Create a compile request.
    pub fn compile(
        origin: impl Into<String>,
        requirement: impl Into<String>,
        autoloads: Autoloads,
        options: CompileOptions,
    ) -> Self {
        Self::Compile {
            origin: origin.into(),
            requirement: requirement.into(),
            autoloads,
            options,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Compile { .. } => "compile",
            Self::NewAsset { .. } => "new_asset",
            Self::NewRequires { .. } => "new_requires",
            Self::MissingRequireError { .. } => "missing_require_error",
            Self::Fault { .. } => "fault",
            Self::Close => "close",
        }
    }

    /// Serialize to frame payload bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from frame payload bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_carries_pass_through_config() {
        let mut autoloads = Autoloads::new();
        autoloads.insert("Json".into(), "json".into());
        let mut options = CompileOptions::new();
        options.insert("arity_check".into(), serde_json::Value::Bool(true));

        let msg = Message::compile("app.rb", "json", autoloads.clone(), options.clone());
        let bytes = msg.to_bytes().unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains(r#""type":"compile""#));

        match Message::from_bytes(&bytes).unwrap() {
            Message::Compile {
                origin,
                requirement,
                autoloads: a,
                options: o,
            } => {
                assert_eq!(origin, "app.rb");
                assert_eq!(requirement, "json");
                assert_eq!(a, autoloads);
                assert_eq!(o, options);
            }
            other => panic!("Expected Compile, got {:?}", other),
        }
    }

    #[test]
    fn test_new_asset_none_is_distinct_from_missing() {
        let msg = Message::NewAsset { unit: None };
        let parsed = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, Message::NewAsset { unit: None });
    }

    #[test]
    fn test_missing_require_error_keeps_trace() {
        let msg = Message::MissingRequireError {
            origin: "lib/a.js".into(),
            error: RemoteError {
                message: "can't find file: \"b\"".into(),
                chain: vec![],
                trace: Some("0: compile".into()),
            },
        };
        let parsed = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        match parsed {
            Message::MissingRequireError { origin, error } => {
                assert_eq!(origin, "lib/a.js");
                assert_eq!(error.trace.as_deref(), Some("0: compile"));
            }
            other => panic!("Expected MissingRequireError, got {:?}", other),
        }
    }

    #[test]
    fn test_close_is_bare_tag() {
        let bytes = Message::Close.to_bytes().unwrap();
        assert_eq!(bytes, br#"{"type":"close"}"#);
        assert_eq!(Message::Close.kind(), "close");
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert!(Message::from_bytes(br#"{"type":"explode"}"#).is_err());
    }
}
