// bitproto-core
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The decoded value tree (§3): what [`crate::decode`] produces and [`crate::encode`] consumes.
//!
//! `Value` mirrors the shape of [`crate::ir::EntryKind`] one-for-one, so a caller can walk a
//! decoded tree the same way the protocol tree is walked, and can build the tree it wants encoded
//! using the same shapes.

use crate::bitstream::BitBuf;
use crate::ir::EntryId;

/// A single decoded entry's value, tagged with the [`EntryId`] it came from so callers (and the
/// encoder re-consuming a hand-built tree) can cross-reference it against the protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub entry: EntryId,
    pub name: String,
    pub value: Value,
}

impl Node {
    pub fn new(entry: EntryId, name: impl Into<String>, value: Value) -> Self {
        Node { entry, name: name.into(), value }
    }
}

/// The decoded payload of one entry (§3 Data Model).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A `Field(Format::Integer)`, already sign/zero-extended as declared.
    Integer(i64),
    /// A `Field(Format::Text)`, decoded as raw bytes; character-set interpretation is a caller
    /// concern (§6, "the core consumes structured data, not text").
    Text(Vec<u8>),
    /// A `Field(Format::Hex)`.
    Hex(Vec<u8>),
    /// A `Field(Format::Binary)`, a bit-exact (possibly non-byte-aligned) buffer.
    Binary(BitBuf),
    Float(f64),
    /// A `Sequence`'s children, in declaration order, plus its own derived scalar if it has one.
    Sequence { children: Vec<Node>, scalar: Option<i64> },
    /// A `Choice`'s single matched alternative.
    Choice { chosen: Box<Node> },
    /// A `SequenceOf`'s repeated elements, in order.
    SequenceOf(Vec<Node>),
}

impl Value {
    /// Coerces this value to a plain integer, the representation relational constraints and
    /// expression references operate on (§4.4: "binary and text fields are compared by their
    /// unsigned integer interpretation").
    ///
    /// `Float` has no arm: it cannot be published to an [`crate::expr::Env`] or compared by a
    /// constraint, so [`crate::ir::Protocol::validate`] statically rejects any `Format::Float`
    /// field that carries one rather than let it silently compare against a default.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            Value::Binary(b) => Some(b.as_unsigned() as i64),
            Value::Text(bytes) | Value::Hex(bytes) => {
                Some(bytes.iter().fold(0i64, |acc, b| (acc << 8) | *b as i64))
            }
            Value::Sequence { scalar: Some(v), .. } => Some(*v),
            _ => None,
        }
    }
}
