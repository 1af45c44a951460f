use core::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoorState {
    #[default]
    Closed,
    Open,
}

impl DoorState {
    /// Maps a raw input level to a door state. Inputs are pulled up, so a
    /// closed door grounds the line and reads low.
    pub fn from_level(high: bool) -> Self {
        if high {
            Self::Open
        } else {
            Self::Closed
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DoorId {
    One,
    Two,
}

impl DoorId {
    pub const ALL: [DoorId; 2] = [DoorId::One, DoorId::Two];

    pub fn number(self) -> u8 {
        match self {
            Self::One => 1,
            Self::Two => 2,
        }
    }
}

impl fmt::Display for DoorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// A detected door transition. Built per change and serialized straight away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationEvent {
    pub door: DoorId,
    pub state: DoorState,
}

impl NotificationEvent {
    pub fn new(door: DoorId, state: DoorState) -> Self {
        Self { door, state }
    }

    /// Wire payload, `"<1|2>:<open|closed>"`.
    pub fn payload(&self) -> String {
        format!("{}:{}", self.door, self.state.as_str())
    }
}

/// Message received from the broker. Only ever logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}
