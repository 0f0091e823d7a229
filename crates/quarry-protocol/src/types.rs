//! Core game types shared by every node.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Opaque peer identifier handed out at registration.
pub type PeerId = String;

/// Reserved identifier of the prey node.
pub const PREY_ID: &str = "prey";

/// Whether `id` names the prey.
pub fn is_prey(id: &str) -> bool {
    id == PREY_ID
}

/// Integer grid position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Coordinate {
    pub x: i32,
    pub y: i32,
}

impl Coordinate {
    /// Size of the raw wire encoding.
    pub const ENCODED_LEN: usize = 8;

    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Raw bytes: `x` then `y`, little-endian.
    pub fn to_bytes(self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..4].copy_from_slice(&self.x.to_le_bytes());
        out[4..].copy_from_slice(&self.y.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return None;
        }
        let x = i32::from_le_bytes(bytes[..4].try_into().ok()?);
        let y = i32::from_le_bytes(bytes[4..].try_into().ok()?);
        Some(Self { x, y })
    }

    /// The neighbouring cell in `direction`. `Up` decreases `y`.
    pub fn step(self, direction: Direction) -> Self {
        match direction {
            Direction::Up => Self::new(self.x, self.y - 1),
            Direction::Down => Self::new(self.x, self.y + 1),
            Direction::Left => Self::new(self.x - 1, self.y),
            Direction::Right => Self::new(self.x + 1, self.y),
        }
    }

    pub fn manhattan(self, other: Self) -> u32 {
        self.x.abs_diff(other.x) + self.y.abs_diff(other.y)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Directional command emitted by the rendering client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::Up,
        Direction::Down,
        Direction::Left,
        Direction::Right,
    ];
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            "left" => Ok(Self::Left),
            "right" => Ok(Self::Right),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

/// Full game state as exchanged during join-time reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSnapshot {
    pub locations: HashMap<PeerId, Coordinate>,
    pub scores: HashMap<PeerId, i64>,
}
