//! Wire types of the `GOCACHEPROG` protocol.
//!
//! `go` writes one JSON request per line on the helper's stdin. A `put` with
//! a non-zero `BodySize` is followed by the body as a base64 JSON string on
//! its own line. The helper answers with one JSON response per line, in any
//! order, and opens with an unsolicited response (ID 0) listing the commands
//! it understands.

use serde::{Deserialize, Serialize};

/// Commands this helper implements.
pub const KNOWN_COMMANDS: [&str; 3] = ["get", "put", "close"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(rename = "Command")]
    pub command: String,
    #[serde(rename = "ActionID", default, with = "base64_bytes", skip_serializing_if = "Option::is_none")]
    pub action_id: Option<Vec<u8>>,
    #[serde(rename = "OutputID", default, with = "base64_bytes", skip_serializing_if = "Option::is_none")]
    pub output_id: Option<Vec<u8>>,
    /// Name of `OutputID` before Go 1.24.
    #[serde(rename = "ObjectID", default, with = "base64_bytes", skip_serializing_if = "Option::is_none")]
    pub object_id: Option<Vec<u8>>,
    #[serde(rename = "BodySize", default, skip_serializing_if = "is_zero")]
    pub body_size: u64,
}

impl Request {
    /// The output ID under either of its names.
    pub fn output(&self) -> Option<&[u8]> {
        self.output_id.as_deref().or(self.object_id.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(rename = "Err", default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    #[serde(rename = "KnownCommands", default, skip_serializing_if = "Vec::is_empty")]
    pub known_commands: Vec<String>,
    #[serde(rename = "Miss", default, skip_serializing_if = "is_false")]
    pub miss: bool,
    #[serde(rename = "OutputID", default, with = "base64_bytes", skip_serializing_if = "Option::is_none")]
    pub output_id: Option<Vec<u8>>,
    #[serde(rename = "Size", default, skip_serializing_if = "is_zero")]
    pub size: u64,
    /// RFC 3339 timestamp of the entry.
    #[serde(rename = "Time", default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(rename = "DiskPath", default, skip_serializing_if = "Option::is_none")]
    pub disk_path: Option<String>,
}

impl Response {
    pub fn hello() -> Self {
        Self {
            known_commands: KNOWN_COMMANDS.iter().map(|c| (*c).to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn ok(id: i64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn miss(id: i64) -> Self {
        Self {
            id,
            miss: true,
            ..Self::default()
        }
    }

    pub fn error(id: i64, err: impl std::fmt::Display) -> Self {
        Self {
            id,
            err: Some(err.to_string()),
            ..Self::default()
        }
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(n: &u64) -> bool {
    *n == 0
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(b: &bool) -> bool {
    !*b
}

/// `[]byte` fields travel as standard base64 strings.
mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub(super) fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
