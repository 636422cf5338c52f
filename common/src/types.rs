//! Core type definitions for dingo

use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};

use anyhow::{bail, Error, Result};

use crate::hash::BlockHash;

/// Protocol era
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum Era {
    Byron,
    Shelley,
    Allegra,
    Mary,
    Alonzo,
    Babbage,
    Conway,
}

impl Era {
    /// All eras, ordered by id
    pub const ALL: [Era; 7] = [
        Era::Byron,
        Era::Shelley,
        Era::Allegra,
        Era::Mary,
        Era::Alonzo,
        Era::Babbage,
        Era::Conway,
    ];
}

impl Default for Era {
    fn default() -> Era {
        Era::Byron
    }
}

impl From<Era> for u8 {
    fn from(e: Era) -> u8 {
        match e {
            Era::Byron => 0,
            Era::Shelley => 1,
            Era::Allegra => 2,
            Era::Mary => 3,
            Era::Alonzo => 4,
            Era::Babbage => 5,
            Era::Conway => 6,
        }
    }
}

impl From<Era> for u16 {
    fn from(e: Era) -> u16 {
        u8::from(e) as u16
    }
}

impl TryFrom<u8> for Era {
    type Error = anyhow::Error;
    fn try_from(v: u8) -> Result<Era, Error> {
        match v {
            0 => Ok(Era::Byron),
            1 => Ok(Era::Shelley),
            2 => Ok(Era::Allegra),
            3 => Ok(Era::Mary),
            4 => Ok(Era::Alonzo),
            5 => Ok(Era::Babbage),
            6 => Ok(Era::Conway),
            n => bail!("Impossible era {n}"),
        }
    }
}

impl Display for Era {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A position on the chain. `Origin` sorts before any block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Point {
    Origin,
    Specific { slot: u64, hash: BlockHash },
}

impl Point {
    pub fn specific(slot: u64, hash: BlockHash) -> Self {
        Point::Specific { slot, hash }
    }

    pub fn slot(&self) -> Option<u64> {
        match self {
            Point::Origin => None,
            Point::Specific { slot, .. } => Some(*slot),
        }
    }

    pub fn slot_or_default(&self) -> u64 {
        self.slot().unwrap_or_default()
    }

    pub fn hash(&self) -> Option<BlockHash> {
        match self {
            Point::Origin => None,
            Point::Specific { hash, .. } => Some(*hash),
        }
    }
}

impl PartialOrd for Point {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Point {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Point::Origin, Point::Origin) => Ordering::Equal,
            (Point::Origin, _) => Ordering::Less,
            (_, Point::Origin) => Ordering::Greater,
            (
                Point::Specific { slot: a, hash: ha },
                Point::Specific { slot: b, hash: hb },
            ) => a.cmp(b).then_with(|| ha.cmp(hb)),
        }
    }
}

impl Display for Point {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Point::Origin => write!(f, "origin"),
            Point::Specific { slot, hash } => write!(f, "{slot}.{hash}"),
        }
    }
}

impl From<Point> for pallas::network::miniprotocols::Point {
    fn from(point: Point) -> Self {
        match point {
            Point::Origin => pallas::network::miniprotocols::Point::Origin,
            Point::Specific { slot, hash } => {
                pallas::network::miniprotocols::Point::Specific(slot, hash.to_vec())
            }
        }
    }
}

impl TryFrom<pallas::network::miniprotocols::Point> for Point {
    type Error = anyhow::Error;

    fn try_from(point: pallas::network::miniprotocols::Point) -> Result<Self> {
        match point {
            pallas::network::miniprotocols::Point::Origin => Ok(Point::Origin),
            pallas::network::miniprotocols::Point::Specific(slot, hash) => {
                let Ok(hash) = BlockHash::try_from(hash.as_slice()) else {
                    bail!("point at slot {slot} has a malformed hash");
                };
                Ok(Point::Specific { slot, hash })
            }
        }
    }
}

/// The latest point on the chain plus its block number
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Tip {
    pub point: Point,
    pub block_number: u64,
}

impl Tip {
    pub const ORIGIN: Tip = Tip {
        point: Point::Origin,
        block_number: 0,
    };

    pub fn new(point: Point, block_number: u64) -> Self {
        Self {
            point,
            block_number,
        }
    }
}

/// A decoded block header, extracted before the body is fetched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub hash: BlockHash,
    pub slot: u64,
    pub number: u64,
    pub parent: Point,
    pub era: Era,
    /// Raw header CBOR as received on the wire
    pub bytes: Vec<u8>,
}

impl BlockHeader {
    pub fn point(&self) -> Point {
        Point::specific(self.slot, self.hash)
    }
}

/// A full block; immutable once constructed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    /// Raw block CBOR as received on the wire
    pub body: Vec<u8>,
}

impl Block {
    pub fn point(&self) -> Point {
        self.header.point()
    }

    pub fn hash(&self) -> BlockHash {
        self.header.hash
    }

    pub fn slot(&self) -> u64 {
        self.header.slot
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn era(&self) -> Era {
        self.header.era
    }
}

/// Direction of a peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

/// Opaque identifier of a peer session, unique for the lifetime of the
/// connection manager
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct ConnectionId(pub u64);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_sorts_before_any_point() {
        let point = Point::specific(1, BlockHash::default());
        assert!(Point::Origin < point);
        assert_eq!(Point::Origin, Point::Origin);
    }

    #[test]
    fn point_round_trips_through_pallas() {
        let hash: BlockHash =
            "aabbccddeeff00112233445566778899aabbccddeeff00112233445566778899".parse().unwrap();
        let point = Point::specific(42, hash);
        let pallas_point: pallas::network::miniprotocols::Point = point.into();
        assert_eq!(Point::try_from(pallas_point).unwrap(), point);
    }

    #[test]
    fn era_ids_round_trip() {
        for era in Era::ALL {
            assert_eq!(Era::try_from(u8::from(era)).unwrap(), era);
        }
        assert!(Era::try_from(7).is_err());
    }
}
