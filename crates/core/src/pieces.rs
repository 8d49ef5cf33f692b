//! Piece sets and their compact alias encoding.

use crate::error::{Error, Result};
use std::fmt;

/// Storage node identifier (32 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// The all-zero node id.
    pub const ZERO: NodeId = NodeId([0; 32]);

    /// Create from raw bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse from a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Encoding(format!("node id must be 32 bytes, got {}", bytes.len())))?;
        Ok(Self(arr))
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether this is the zero id.
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 32]
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Root piece identifier of a remote segment (32 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PieceId([u8; 32]);

impl PieceId {
    /// The all-zero piece id, used for inline segments.
    pub const ZERO: PieceId = PieceId([0; 32]);

    /// Create from raw bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse from a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Encoding(format!("piece id must be 32 bytes, got {}", bytes.len())))?;
        Ok(Self(arr))
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether this is the zero id.
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 32]
    }
}

impl fmt::Debug for PieceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PieceId({})", hex::encode(&self.0[..8]))
    }
}

/// A single erasure share: which node holds which piece number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Piece {
    pub number: u16,
    pub node: NodeId,
}

/// The piece set of a remote segment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pieces(pub Vec<Piece>);

impl Pieces {
    /// Number of pieces.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over pieces.
    pub fn iter(&self) -> std::slice::Iter<'_, Piece> {
        self.0.iter()
    }

    /// Validate the piece set: non-empty, sorted by strictly increasing piece
    /// number, and no zero node ids.
    pub fn verify(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(Error::InvalidArgument("pieces missing".into()));
        }
        let mut last: Option<u16> = None;
        for piece in &self.0 {
            if piece.node.is_zero() {
                return Err(Error::InvalidArgument(format!(
                    "piece number {} has zero node id",
                    piece.number
                )));
            }
            match last {
                Some(prev) if piece.number == prev => {
                    return Err(Error::InvalidArgument(format!(
                        "duplicate piece number {}",
                        piece.number
                    )));
                }
                Some(prev) if piece.number < prev => {
                    return Err(Error::InvalidArgument("pieces are not sorted".into()));
                }
                _ => {}
            }
            last = Some(piece.number);
        }
        Ok(())
    }
}

impl FromIterator<Piece> for Pieces {
    fn from_iter<T: IntoIterator<Item = Piece>>(iter: T) -> Self {
        Pieces(iter.into_iter().collect())
    }
}

/// Compact integer standing in for a [`NodeId`].
pub type NodeAlias = u32;

/// A piece with its node replaced by an alias.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AliasPiece {
    pub number: u16,
    pub alias: NodeAlias,
}

/// The aliased piece set, as stored in the segments table.
///
/// Wire form: a sequence of (varint piece-number, 4-byte big-endian alias)
/// pairs, sorted by piece number.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AliasPieces(pub Vec<AliasPiece>);

impl AliasPieces {
    /// Number of pieces.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Encode into the compact wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() * 6);
        for piece in &self.0 {
            encode_varint(piece.number as u64, &mut out);
            out.extend_from_slice(&piece.alias.to_be_bytes());
        }
        out
    }

    /// Decode from the compact wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut pieces = Vec::new();
        let mut rest = bytes;
        let mut last: Option<u16> = None;
        while !rest.is_empty() {
            let (number, tail) = decode_varint(rest)?;
            let number = u16::try_from(number)
                .map_err(|_| Error::Encoding(format!("piece number too large: {number}")))?;
            if tail.len() < 4 {
                return Err(Error::Encoding("truncated alias".into()));
            }
            let alias = u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]);
            if let Some(prev) = last {
                if number <= prev {
                    return Err(Error::Encoding("piece numbers are not ascending".into()));
                }
            }
            last = Some(number);
            pieces.push(AliasPiece { number, alias });
            rest = &tail[4..];
        }
        Ok(AliasPieces(pieces))
    }
}

fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn decode_varint(bytes: &[u8]) -> Result<(u64, &[u8])> {
    let mut value: u64 = 0;
    for (i, &byte) in bytes.iter().enumerate() {
        if i >= 10 {
            break;
        }
        value |= ((byte & 0x7F) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, &bytes[i + 1..]));
        }
    }
    Err(Error::Encoding("truncated varint".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(fill: u8) -> NodeId {
        NodeId::new([fill; 32])
    }

    #[test]
    fn pieces_verify_accepts_sorted_set() {
        let pieces = Pieces(vec![
            Piece { number: 0, node: node(1) },
            Piece { number: 1, node: node(2) },
            Piece { number: 5, node: node(3) },
        ]);
        assert!(pieces.verify().is_ok());
    }

    #[test]
    fn pieces_verify_rejects_duplicates_and_zero_nodes() {
        let dup = Pieces(vec![
            Piece { number: 1, node: node(1) },
            Piece { number: 1, node: node(2) },
        ]);
        assert!(dup.verify().is_err());

        let zero = Pieces(vec![Piece { number: 0, node: NodeId::ZERO }]);
        assert!(zero.verify().is_err());

        assert!(Pieces::default().verify().is_err());
    }

    #[test]
    fn alias_pieces_roundtrip() {
        let pieces = AliasPieces(vec![
            AliasPiece { number: 0, alias: 1 },
            AliasPiece { number: 3, alias: 0xDEAD_BEEF },
            AliasPiece { number: 300, alias: 7 },
        ]);
        let encoded = pieces.encode();
        assert_eq!(AliasPieces::decode(&encoded).unwrap(), pieces);
    }

    #[test]
    fn alias_pieces_decode_rejects_garbage() {
        assert!(AliasPieces::decode(&[0x01]).is_err());
        // descending piece numbers
        let bad = AliasPieces(vec![
            AliasPiece { number: 5, alias: 1 },
            AliasPiece { number: 2, alias: 2 },
        ])
        .encode();
        assert!(AliasPieces::decode(&bad).is_err());
    }

    #[test]
    fn empty_alias_pieces_encode_to_empty() {
        assert!(AliasPieces::default().encode().is_empty());
        assert_eq!(AliasPieces::decode(&[]).unwrap(), AliasPieces::default());
    }
}
