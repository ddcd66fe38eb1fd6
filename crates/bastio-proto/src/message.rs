//! Typed protocol messages and the routed parser.
//!
//! Every message is a JSON object carrying a `type` (`action` or `feedback`)
//! and a `mid`, an opaque message identifier minted as a 64-bit random hex
//! string by the originator and echoed verbatim in replies. Routing is a
//! two-level switch: `type` selects the message family, and within actions
//! `action` selects the concrete operation, so adding a new action touches
//! exactly one table.
//!
//! Parsing is strict: unknown types, unknown actions, out-of-range statuses,
//! and malformed usernames or public keys are all [`MessageError`]s, never a
//! best-effort pass-through.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Usernames must satisfy the useradd-safe pattern; this regex is the sole
/// acceptance criterion.
static USERNAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_]{0,30}$").expect("valid username regex"));

/// Protocol message parse or validation failure.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid JSON: {0}")]
    Json(#[source] serde_json::Error),

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("missing or invalid required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid field `{field}`: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },

    #[error("unknown message type `{0}`")]
    UnknownType(String),

    #[error("unknown action `{0}`")]
    UnknownAction(String),
}

impl MessageError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// Mint a fresh message identifier: 64 random bits, lowercase hex.
pub fn new_mid() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// Check a username against the acceptance pattern.
pub fn validate_username(username: &str) -> bool {
    USERNAME_RE.is_match(username)
}

/// Shape-check an OpenSSH `authorized_keys` line: an `ssh-` key type
/// followed by a base64 payload. Full cryptographic parsing happens where
/// the key is actually installed.
pub fn validate_public_key(line: &str) -> bool {
    let mut fields = line.split_whitespace();
    let Some(kind) = fields.next() else {
        return false;
    };
    if !kind.starts_with("ssh-") {
        return false;
    }
    let Some(payload) = fields.next() else {
        return false;
    };
    !payload.is_empty()
        && payload.len() % 4 == 0
        && payload
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=')
}

/// Feedback severity, carried on the wire as a bare integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackStatus {
    Success,
    Info,
    Warning,
    Error,
}

impl FeedbackStatus {
    pub fn code(self) -> u16 {
        match self {
            FeedbackStatus::Success => 200,
            FeedbackStatus::Info => 300,
            FeedbackStatus::Warning => 400,
            FeedbackStatus::Error => 500,
        }
    }
}

impl TryFrom<u64> for FeedbackStatus {
    type Error = MessageError;

    fn try_from(code: u64) -> Result<Self, MessageError> {
        match code {
            200 => Ok(FeedbackStatus::Success),
            300 => Ok(FeedbackStatus::Info),
            400 => Ok(FeedbackStatus::Warning),
            500 => Ok(FeedbackStatus::Error),
            other => Err(MessageError::invalid(
                "status",
                format!("unknown status code {other}"),
            )),
        }
    }
}

/// A reply carrying the outcome of a previously received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackMessage {
    pub mid: String,
    pub feedback: String,
    pub status: FeedbackStatus,
}

impl FeedbackMessage {
    /// Originate a feedback message with a fresh `mid`.
    pub fn new(feedback: impl Into<String>, status: FeedbackStatus) -> Self {
        Self {
            mid: new_mid(),
            feedback: feedback.into(),
            status,
        }
    }

    fn from_object(obj: &Map<String, Value>) -> Result<Self, MessageError> {
        let mid = require_str(obj, "mid")?;
        let feedback = require_str(obj, "feedback")?;
        let status = obj
            .get("status")
            .and_then(Value::as_u64)
            .ok_or(MessageError::MissingField("status"))?;
        Ok(Self {
            mid: mid.to_string(),
            feedback: feedback.to_string(),
            status: FeedbackStatus::try_from(status)?,
        })
    }
}

/// The concrete operation requested by an action message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    AddUser { sudo: bool },
    RemoveUser,
    UpdateUser { sudo: bool },
    AddKey { public_key: String },
    RemoveKey { public_key: String },
}

impl ActionKind {
    /// The wire name of this action.
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::AddUser { .. } => "add-user",
            ActionKind::RemoveUser => "remove-user",
            ActionKind::UpdateUser { .. } => "update-user",
            ActionKind::AddKey { .. } => "add-key",
            ActionKind::RemoveKey { .. } => "remove-key",
        }
    }
}

/// A provisioning request from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionMessage {
    pub mid: String,
    pub username: String,
    pub kind: ActionKind,
}

impl ActionMessage {
    /// Originate an action message with a fresh `mid`. The username is
    /// validated here so a malformed one can never leave this process.
    pub fn new(username: impl Into<String>, kind: ActionKind) -> Result<Self, MessageError> {
        let username = username.into();
        if !validate_username(&username) {
            return Err(MessageError::invalid(
                "username",
                format!("`{username}` does not match the allowed pattern"),
            ));
        }
        if let ActionKind::AddKey { public_key } | ActionKind::RemoveKey { public_key } = &kind {
            if !validate_public_key(public_key) {
                return Err(MessageError::invalid(
                    "public_key",
                    "not an OpenSSH public key line",
                ));
            }
        }
        Ok(Self {
            mid: new_mid(),
            username,
            kind,
        })
    }

    /// Build the feedback reply to this action; the `mid` is echoed.
    pub fn reply(&self, feedback: impl Into<String>, status: FeedbackStatus) -> FeedbackMessage {
        FeedbackMessage {
            mid: self.mid.clone(),
            feedback: feedback.into(),
            status,
        }
    }

    fn from_object(obj: &Map<String, Value>) -> Result<Self, MessageError> {
        let mid = require_str(obj, "mid")?.to_string();
        let username = require_str(obj, "username")?.to_string();
        if !validate_username(&username) {
            return Err(MessageError::invalid(
                "username",
                format!("`{username}` does not match the allowed pattern"),
            ));
        }

        let action = require_str(obj, "action")?;
        let kind = match action {
            "add-user" => ActionKind::AddUser {
                sudo: require_bool(obj, "sudo")?,
            },
            "remove-user" => ActionKind::RemoveUser,
            "update-user" => ActionKind::UpdateUser {
                sudo: require_bool(obj, "sudo")?,
            },
            "add-key" => ActionKind::AddKey {
                public_key: require_public_key(obj)?,
            },
            "remove-key" => ActionKind::RemoveKey {
                public_key: require_public_key(obj)?,
            },
            other => return Err(MessageError::UnknownAction(other.to_string())),
        };
        Ok(Self {
            mid,
            username,
            kind,
        })
    }
}

/// A parsed wire message of either family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMessage {
    Action(ActionMessage),
    Feedback(FeedbackMessage),
}

impl ProtocolMessage {
    /// Parse a wire payload: decode JSON, then route on `type`.
    pub fn from_json(payload: &[u8]) -> Result<Self, MessageError> {
        let value: Value = serde_json::from_slice(payload).map_err(MessageError::Json)?;
        let obj = value.as_object().ok_or(MessageError::NotAnObject)?;
        match require_str(obj, "type")? {
            "action" => ActionMessage::from_object(obj).map(ProtocolMessage::Action),
            "feedback" => FeedbackMessage::from_object(obj).map(ProtocolMessage::Feedback),
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }

    /// Serialize for the wire.
    pub fn to_json(&self) -> Vec<u8> {
        let value = match self {
            ProtocolMessage::Feedback(fb) => json!({
                "type": "feedback",
                "mid": fb.mid,
                "feedback": fb.feedback,
                "status": fb.status.code(),
            }),
            ProtocolMessage::Action(action) => {
                let mut obj = Map::new();
                obj.insert("type".into(), Value::from("action"));
                obj.insert("action".into(), Value::from(action.kind.name()));
                obj.insert("mid".into(), Value::from(action.mid.clone()));
                obj.insert("username".into(), Value::from(action.username.clone()));
                match &action.kind {
                    ActionKind::AddUser { sudo } | ActionKind::UpdateUser { sudo } => {
                        obj.insert("sudo".into(), Value::from(*sudo));
                    }
                    ActionKind::AddKey { public_key } | ActionKind::RemoveKey { public_key } => {
                        obj.insert("public_key".into(), Value::from(public_key.clone()));
                    }
                    ActionKind::RemoveUser => {}
                }
                Value::Object(obj)
            }
        };
        serde_json::to_vec(&value).expect("protocol messages serialize to JSON")
    }

    /// The message identifier.
    pub fn mid(&self) -> &str {
        match self {
            ProtocolMessage::Action(a) => &a.mid,
            ProtocolMessage::Feedback(f) => &f.mid,
        }
    }

    /// Build a feedback reply to this message, echoing its `mid`.
    pub fn reply(&self, feedback: impl Into<String>, status: FeedbackStatus) -> FeedbackMessage {
        FeedbackMessage {
            mid: self.mid().to_string(),
            feedback: feedback.into(),
            status,
        }
    }
}

impl From<ActionMessage> for ProtocolMessage {
    fn from(value: ActionMessage) -> Self {
        ProtocolMessage::Action(value)
    }
}

impl From<FeedbackMessage> for ProtocolMessage {
    fn from(value: FeedbackMessage) -> Self {
        ProtocolMessage::Feedback(value)
    }
}

fn require_str<'a>(
    obj: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, MessageError> {
    obj.get(field)
        .and_then(Value::as_str)
        .ok_or(MessageError::MissingField(field))
}

fn require_bool(obj: &Map<String, Value>, field: &'static str) -> Result<bool, MessageError> {
    obj.get(field)
        .and_then(Value::as_bool)
        .ok_or(MessageError::MissingField(field))
}

fn require_public_key(obj: &Map<String, Value>) -> Result<String, MessageError> {
    let key = require_str(obj, "public_key")?;
    if !validate_public_key(key) {
        return Err(MessageError::invalid(
            "public_key",
            "not an OpenSSH public key line",
        ));
    }
    Ok(key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAAAgQCxyzzyqwer/tyuiop+asdf agent@host";

    fn parse_str(s: &str) -> Result<ProtocolMessage, MessageError> {
        ProtocolMessage::from_json(s.as_bytes())
    }

    #[test]
    fn test_new_mid_is_64_bit_hex() {
        let mid = new_mid();
        assert_eq!(mid.len(), 16);
        assert!(mid.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn test_username_acceptance() {
        for ok in ["root", "a_b_1", "_user", "x", &"a".repeat(31)] {
            assert!(validate_username(ok), "{ok} should be accepted");
        }
        for bad in ["Root", "", "@user", "1user", "user name", &"a".repeat(32)] {
            assert!(!validate_username(bad), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_public_key_shape() {
        assert!(validate_public_key(TEST_KEY));
        assert!(validate_public_key("ssh-ed25519 AAAA"));
        assert!(!validate_public_key("ecdsa-sha2 AAAA"));
        assert!(!validate_public_key("ssh-rsa"));
        assert!(!validate_public_key("ssh-rsa not*base64!"));
        assert!(!validate_public_key("ssh-rsa AAA"));
        assert!(!validate_public_key(""));
    }

    #[test]
    fn test_parse_add_user() {
        let msg = parse_str(
            r#"{"type":"action","action":"add-user","mid":"abc123","username":"test_user","sudo":true}"#,
        )
        .unwrap();
        let ProtocolMessage::Action(action) = msg else {
            panic!("expected an action");
        };
        assert_eq!(action.mid, "abc123");
        assert_eq!(action.username, "test_user");
        assert_eq!(action.kind, ActionKind::AddUser { sudo: true });
    }

    #[test]
    fn test_parse_remove_user() {
        let msg = parse_str(
            r#"{"type":"action","action":"remove-user","mid":"m","username":"bob"}"#,
        )
        .unwrap();
        let ProtocolMessage::Action(action) = msg else {
            panic!("expected an action");
        };
        assert_eq!(action.kind, ActionKind::RemoveUser);
    }

    #[test]
    fn test_parse_feedback() {
        let msg =
            parse_str(r#"{"type":"feedback","mid":"m1","feedback":"done","status":200}"#).unwrap();
        let ProtocolMessage::Feedback(fb) = msg else {
            panic!("expected feedback");
        };
        assert_eq!(fb.status, FeedbackStatus::Success);
        assert_eq!(fb.feedback, "done");
    }

    #[test]
    fn test_feedback_status_codes() {
        for (code, status) in [
            (200u64, FeedbackStatus::Success),
            (300, FeedbackStatus::Info),
            (400, FeedbackStatus::Warning),
            (500, FeedbackStatus::Error),
        ] {
            assert_eq!(FeedbackStatus::try_from(code).unwrap(), status);
            assert_eq!(u64::from(status.code()), code);
        }
    }

    #[test]
    fn test_feedback_rejects_unknown_status() {
        for code in [0u64, 100, 201, 404, 999] {
            let raw = format!(
                r#"{{"type":"feedback","mid":"m","feedback":"x","status":{code}}}"#
            );
            assert!(matches!(
                parse_str(&raw),
                Err(MessageError::InvalidField { field: "status", .. })
            ));
        }
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(parse_str("{nope"), Err(MessageError::Json(_))));
    }

    #[test]
    fn test_not_an_object() {
        assert!(matches!(parse_str("[1,2]"), Err(MessageError::NotAnObject)));
    }

    #[test]
    fn test_missing_type() {
        assert!(matches!(
            parse_str(r#"{"mid":"m"}"#),
            Err(MessageError::MissingField("type"))
        ));
    }

    #[test]
    fn test_unknown_type() {
        assert!(matches!(
            parse_str(r#"{"type":"gossip","mid":"m"}"#),
            Err(MessageError::UnknownType(t)) if t == "gossip"
        ));
    }

    #[test]
    fn test_unknown_action() {
        assert!(matches!(
            parse_str(r#"{"type":"action","action":"destroy-host","mid":"m","username":"u"}"#),
            Err(MessageError::UnknownAction(a)) if a == "destroy-host"
        ));
    }

    #[test]
    fn test_action_missing_sudo() {
        assert!(matches!(
            parse_str(r#"{"type":"action","action":"add-user","mid":"m","username":"u"}"#),
            Err(MessageError::MissingField("sudo"))
        ));
    }

    #[test]
    fn test_action_rejects_bad_username() {
        assert!(matches!(
            parse_str(
                r#"{"type":"action","action":"remove-user","mid":"m","username":"Bad User"}"#
            ),
            Err(MessageError::InvalidField { field: "username", .. })
        ));
    }

    #[test]
    fn test_action_rejects_bad_public_key() {
        let raw = r#"{"type":"action","action":"add-key","mid":"m","username":"u","public_key":"not a key"}"#;
        assert!(matches!(
            parse_str(raw),
            Err(MessageError::InvalidField { field: "public_key", .. })
        ));
    }

    #[test]
    fn test_json_roundtrip_all_actions() {
        let kinds = [
            ActionKind::AddUser { sudo: true },
            ActionKind::AddUser { sudo: false },
            ActionKind::RemoveUser,
            ActionKind::UpdateUser { sudo: true },
            ActionKind::AddKey {
                public_key: TEST_KEY.to_string(),
            },
            ActionKind::RemoveKey {
                public_key: TEST_KEY.to_string(),
            },
        ];
        for kind in kinds {
            let msg = ProtocolMessage::from(ActionMessage::new("alice", kind).unwrap());
            let reparsed = ProtocolMessage::from_json(&msg.to_json()).unwrap();
            assert_eq!(reparsed, msg);
        }
    }

    #[test]
    fn test_json_roundtrip_feedback() {
        let msg = ProtocolMessage::from(FeedbackMessage::new("all good", FeedbackStatus::Info));
        let reparsed = ProtocolMessage::from_json(&msg.to_json()).unwrap();
        assert_eq!(reparsed, msg);
    }

    #[test]
    fn test_reply_echoes_mid() {
        let action = ActionMessage::new("alice", ActionKind::RemoveUser).unwrap();
        let reply = action.reply("gone", FeedbackStatus::Success);
        assert_eq!(reply.mid, action.mid);

        let msg = ProtocolMessage::from(action);
        let reply = msg.reply("gone", FeedbackStatus::Success);
        assert_eq!(reply.mid, msg.mid());
    }

    #[test]
    fn test_distinct_mids() {
        let a = ActionMessage::new("alice", ActionKind::RemoveUser).unwrap();
        let b = ActionMessage::new("alice", ActionKind::RemoveUser).unwrap();
        assert_ne!(a.mid, b.mid);
    }
}
