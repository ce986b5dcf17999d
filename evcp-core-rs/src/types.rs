//! Core message types for the charging point protocol
//!
//! Every message is an ordered list of string fields. Field 0 is the type tag,
//! the remaining fields are positional arguments whose meaning depends on the
//! tag (by convention argument 0 is the CP id).

use std::fmt;
use std::str::FromStr;

use crate::error::FrameError;

/// Start-of-frame marker
pub const STX: u8 = 0x02;

/// End-of-frame marker
pub const ETX: u8 = 0x03;

/// Separator between fields inside a frame
pub const FIELD_SEPARATOR: u8 = b'#';

/// Message type tag (field 0 of every message)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    // CP -> controller
    Authenticate,
    Register,
    Fault,
    Recovery,

    // Controller -> CP
    Authenticated,
    Deny,
    DriverStart,
    ChargingComplete,
    DriverStop,

    // Monitor <-> engine
    HealthCheck,
    HealthOk,
    HealthKo,

    /// Any tag this node does not know about. Kept so that decoding never
    /// fails on a well-formed frame with a new tag.
    Unknown(String),
}

impl MessageType {
    /// Wire representation of the tag
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Authenticate => "AUTHENTICATE",
            MessageType::Register => "REGISTER",
            MessageType::Fault => "FAULT",
            MessageType::Recovery => "RECOVERY",
            MessageType::Authenticated => "AUTHENTICATED",
            MessageType::Deny => "DENY",
            MessageType::DriverStart => "DRIVER_START",
            MessageType::ChargingComplete => "CHARGING_COMPLETE",
            MessageType::DriverStop => "DRIVER_STOP",
            MessageType::HealthCheck => "HEALTH_CHECK",
            MessageType::HealthOk => "HEALTH_OK",
            MessageType::HealthKo => "HEALTH_KO",
            MessageType::Unknown(tag) => tag,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "AUTHENTICATE" => MessageType::Authenticate,
            "REGISTER" => MessageType::Register,
            "FAULT" => MessageType::Fault,
            "RECOVERY" => MessageType::Recovery,
            "AUTHENTICATED" => MessageType::Authenticated,
            "DENY" => MessageType::Deny,
            "DRIVER_START" => MessageType::DriverStart,
            "CHARGING_COMPLETE" => MessageType::ChargingComplete,
            "DRIVER_STOP" => MessageType::DriverStop,
            "HEALTH_CHECK" => MessageType::HealthCheck,
            "HEALTH_OK" => MessageType::HealthOk,
            "HEALTH_KO" => MessageType::HealthKo,
            other => MessageType::Unknown(other.to_string()),
        })
    }
}

/// A protocol message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageType,
    args: Vec<String>,
}

impl Message {
    /// Build a message, rejecting fields that cannot be framed
    pub fn new<I, S>(kind: MessageType, args: I) -> Result<Self, FrameError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if kind.as_str().is_empty() {
            return Err(FrameError::EmptyTag);
        }
        validate_field(kind.as_str())?;
        // `Unknown("DENY")` and `Deny` are the same message on the wire
        let kind = kind.as_str().parse().unwrap_or(kind);
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        for arg in &args {
            validate_field(arg)?;
        }
        Ok(Self { kind, args })
    }

    /// AUTHENTICATE(cp_id, username, password)
    pub fn authenticate(cp_id: &str, username: &str, password: &str) -> Result<Self, FrameError> {
        Self::new(MessageType::Authenticate, [cp_id, username, password])
    }

    /// REGISTER(role, cp_id, cp_id)
    pub fn register(role: &str, cp_id: &str) -> Result<Self, FrameError> {
        Self::new(MessageType::Register, [role, cp_id, cp_id])
    }

    pub fn health_check(cp_id: &str) -> Result<Self, FrameError> {
        Self::new(MessageType::HealthCheck, [cp_id])
    }

    pub fn fault(cp_id: &str) -> Result<Self, FrameError> {
        Self::new(MessageType::Fault, [cp_id])
    }

    pub fn recovery(cp_id: &str) -> Result<Self, FrameError> {
        Self::new(MessageType::Recovery, [cp_id])
    }

    pub fn kind(&self) -> &MessageType {
        &self.kind
    }

    /// Positional arguments (every field after the type tag)
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Argument `index`, if present
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    /// All fields in wire order, type tag first
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.kind.as_str()).chain(self.args.iter().map(String::as_str))
    }

    /// Rebuild a message from decoded wire fields. Field 0 must exist.
    pub(crate) fn from_fields(mut fields: Vec<String>) -> Option<Self> {
        if fields.is_empty() || fields[0].is_empty() {
            return None;
        }
        let tag = fields.remove(0);
        let kind = tag.parse().unwrap_or(MessageType::Unknown(tag));
        Some(Self { kind, args: fields })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for field in self.fields() {
            if !first {
                f.write_str("#")?;
            }
            f.write_str(field)?;
            first = false;
        }
        Ok(())
    }
}

/// Fields may not contain the separator or any ASCII control byte
/// (which covers both frame markers).
fn validate_field(field: &str) -> Result<(), FrameError> {
    if let Some(byte) = field
        .bytes()
        .find(|b| *b == FIELD_SEPARATOR || b.is_ascii_control())
    {
        return Err(FrameError::InvalidField {
            field: field.to_string(),
            byte,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_round_trip() {
        for tag in [
            "AUTHENTICATE",
            "AUTHENTICATED",
            "DENY",
            "REGISTER",
            "HEALTH_CHECK",
            "HEALTH_OK",
            "HEALTH_KO",
            "FAULT",
            "RECOVERY",
            "DRIVER_START",
            "CHARGING_COMPLETE",
            "DRIVER_STOP",
        ] {
            let kind: MessageType = tag.parse().unwrap();
            assert!(!matches!(kind, MessageType::Unknown(_)), "{} unknown", tag);
            assert_eq!(kind.as_str(), tag);
        }

        let kind: MessageType = "PING".parse().unwrap();
        assert_eq!(kind, MessageType::Unknown("PING".to_string()));
    }

    #[test]
    fn test_register_layout() {
        let msg = Message::register("MONITOR", "CP-001").unwrap();
        assert_eq!(msg.kind(), &MessageType::Register);
        assert_eq!(msg.args(), ["MONITOR", "CP-001", "CP-001"]);
        assert_eq!(msg.to_string(), "REGISTER#MONITOR#CP-001#CP-001");
    }

    #[test]
    fn test_rejects_unframeable_fields() {
        assert!(matches!(
            Message::health_check("CP#1"),
            Err(FrameError::InvalidField { byte: b'#', .. })
        ));
        assert!(matches!(
            Message::authenticate("CP-001", "user", "pa\u{3}ss"),
            Err(FrameError::InvalidField { byte: ETX, .. })
        ));
        assert!(matches!(
            Message::new(MessageType::Unknown(String::new()), ["x"]),
            Err(FrameError::EmptyTag)
        ));
    }

    #[test]
    fn test_unknown_tag_naming_known_type_is_normalized() {
        let msg = Message::new(MessageType::Unknown("DENY".to_string()), ["CP-001", "x"]).unwrap();
        assert_eq!(msg.kind(), &MessageType::Deny);
        assert_eq!(msg, Message::new(MessageType::Deny, ["CP-001", "x"]).unwrap());

        let mut buf = bytes::BytesMut::from(&crate::frame::encode(&msg)[..]);
        match crate::frame::decode(&mut buf, crate::frame::MAX_FRAME_LEN) {
            crate::frame::Decoded::Frame(decoded) => assert_eq!(decoded, msg),
            other => panic!("unexpected {:?}", other),
        }

        let custom = Message::new(MessageType::Unknown("PING".to_string()), ["CP-001"]).unwrap();
        assert_eq!(custom.kind(), &MessageType::Unknown("PING".to_string()));
    }
}
