pub mod coords;
pub mod entities;
pub mod events;
pub mod notify;
pub mod time;

pub use coords::{RegionCoord, TileCoord, REGION_SIZE};
pub use entities::{
    Creature, CreatureId, CreatureKind, CreatureSpecies, DelayedAction, DelayedKey, DelayedKind,
    Player, Region, RegionController, Tile, UpgradeKind,
};
pub use events::{DecodedEvent, EventBody, RawLog, Topic};
pub use notify::{LoadingStage, Notification};
pub use time::{BlockCursor, ChainTimeEstimate};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for parsing addresses and hashes from hex strings.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("wrong length: expected {expected} bytes, got {got}")]
    Length { expected: usize, got: usize },
}

macro_rules! fixed_bytes {
    ($name:ident, $len:expr, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{self}")
            }
        }

        impl FromStr for $name {
            type Err = ParseError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                let stripped = value.strip_prefix("0x").unwrap_or(value);
                let bytes = hex::decode(stripped)?;
                let got = bytes.len();
                let bytes: [u8; $len] = bytes
                    .try_into()
                    .map_err(|_| ParseError::Length { expected: $len, got })?;
                Ok(Self(bytes))
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let value = String::deserialize(deserializer)?;
                value.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

fixed_bytes!(Address, 20, "A ledger account or contract address.");
fixed_bytes!(TxHash, 32, "A ledger transaction hash.");
