// Core ID and value types shared by the relay and the session layer.
//
// These are compact newtypes used on both wire layers: the relay control
// protocol (`message.rs`) and the unnamed-message payloads exchanged between
// peers (`unnamed.rs`). Peer and allocation IDs are relay-assigned integers;
// `Guid` is the user-stable identity string that survives reconnects and is
// what pin ownership is attributed to.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport-assigned peer ID, stable for the lifetime of one session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl PeerId {
    /// The host always holds ID 0 inside its allocation.
    pub const HOST: PeerId = PeerId(0);

    pub fn is_host(self) -> bool {
        self == Self::HOST
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Relay-assigned allocation ID.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AllocationId(pub u64);

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alloc-{}", self.0)
    }
}

/// Host-assigned ID of a spawned network object (player avatar, pin marker,
/// pin panel). Replicated variables are keyed by the object they live on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkObjectId(pub u64);

/// Stable per-user identity, independent of the transient `PeerId`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Guid(pub String);

impl Guid {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque token returned by anonymous sign-in. Required by every relay API
/// call.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerToken(pub String);

/// Relay-issued key that authorizes one bound connection to an allocation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionKey(pub String);

/// Discriminator byte at the front of every unnamed message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageKind(pub u8);

impl MessageKind {
    pub const TERRAIN: MessageKind = MessageKind(1);
    pub const LAYER_FIELD: MessageKind = MessageKind(2);
    pub const PIN: MessageKind = MessageKind(3);
    pub const ROSTER: MessageKind = MessageKind(4);
    pub const VARIABLE: MessageKind = MessageKind(5);
    pub const SESSION_CONTROL: MessageKind = MessageKind(6);
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kind-{}", self.0)
    }
}

/// Whether a peer is viewing in VR or on the desktop. Serialized as its
/// `u8` discriminant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum VrMode {
    #[default]
    Unassigned,
    Vr,
    Desktop,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid VR mode discriminant {0}")]
pub struct InvalidVrMode(pub u8);

impl From<VrMode> for u8 {
    fn from(mode: VrMode) -> u8 {
        match mode {
            VrMode::Unassigned => 0,
            VrMode::Vr => 1,
            VrMode::Desktop => 2,
        }
    }
}

impl TryFrom<u8> for VrMode {
    type Error = InvalidVrMode;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(VrMode::Unassigned),
            1 => Ok(VrMode::Vr),
            2 => Ok(VrMode::Desktop),
            other => Err(InvalidVrMode(other)),
        }
    }
}

/// Human-shareable room code. Always stored trimmed and ASCII-uppercase, so
/// `"xq7k2p"` and `"XQ7K2P"` are the same code.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JoinCode(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JoinCodeError {
    #[error("join code is empty")]
    Empty,
}

impl JoinCode {
    /// Length of relay-generated codes.
    pub const LEN: usize = 6;

    /// Characters used by relay-generated codes. `0`, `1`, `I` and `O` are
    /// left out so codes survive being read aloud.
    pub const ALPHABET: &'static [u8] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZ";

    /// Normalize a user-entered code. Only emptiness is checked here; whether
    /// the code is well-formed is for the relay to judge.
    pub fn parse(raw: &str) -> Result<Self, JoinCodeError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(JoinCodeError::Empty);
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    /// True if the code has the shape the relay generates.
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == Self::LEN && self.0.bytes().all(|b| Self::ALPHABET.contains(&b))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for JoinCode {
    type Err = JoinCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for JoinCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_code_is_case_insensitive() {
        let lower = JoinCode::parse("xq7k2p").unwrap();
        let upper = JoinCode::parse("XQ7K2P").unwrap();
        assert_eq!(lower, upper);
        assert_eq!(lower.as_str(), "XQ7K2P");
    }

    #[test]
    fn join_code_trims_whitespace() {
        let code = JoinCode::parse("  ab12cd \n").unwrap();
        assert_eq!(code.as_str(), "AB12CD");
    }

    #[test]
    fn empty_join_code_rejected() {
        assert_eq!(JoinCode::parse(""), Err(JoinCodeError::Empty));
        assert_eq!(JoinCode::parse("   "), Err(JoinCodeError::Empty));
    }

    #[test]
    fn well_formed_codes() {
        assert!(JoinCode::parse("xq7k2p").unwrap().is_well_formed());
        // Wrong length.
        assert!(!JoinCode::parse("XQ7K2").unwrap().is_well_formed());
        // '0' and 'O' are not in the alphabet.
        assert!(!JoinCode::parse("XQ7K20").unwrap().is_well_formed());
        assert!(!JoinCode::parse("XQ7K2O").unwrap().is_well_formed());
        assert!(!JoinCode::parse("XQ-K2P").unwrap().is_well_formed());
    }

    #[test]
    fn vr_mode_discriminants() {
        assert_eq!(u8::from(VrMode::Unassigned), 0);
        assert_eq!(u8::from(VrMode::Vr), 1);
        assert_eq!(u8::from(VrMode::Desktop), 2);
        assert_eq!(VrMode::try_from(2), Ok(VrMode::Desktop));
        assert_eq!(VrMode::try_from(3), Err(InvalidVrMode(3)));
    }

    #[test]
    fn vr_mode_serializes_as_integer() {
        let json = serde_json::to_string(&VrMode::Vr).unwrap();
        assert_eq!(json, "1");
        let back: VrMode = serde_json::from_str("2").unwrap();
        assert_eq!(back, VrMode::Desktop);
        assert!(serde_json::from_str::<VrMode>("7").is_err());
    }

    #[test]
    fn host_peer_id() {
        assert!(PeerId::HOST.is_host());
        assert!(!PeerId(3).is_host());
        assert_eq!(PeerId(3).to_string(), "peer-3");
    }
}
