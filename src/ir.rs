// bitproto-core
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `ir` module defines the protocol intermediate representation: an immutable tree of
//! [`EntryDef`]s built once by an upstream loader (out of scope for this crate) and consumed by
//! [`crate::decode`] and [`crate::encode`].
//!
//! Entries live in a flat arena ([`Protocol::entries`]) and refer to each other by [`EntryId`]
//! rather than by owned pointer. This sidesteps the cyclic-ownership problem that a literal,
//! owned tree would run into for recursive grammars (a `Choice` alternative that recurses into
//! one of its own ancestors): the cycle is just a repeated index, not a reference cycle.

use crate::expr::Expr;

/// An index into [`Protocol::entries`]. Stable for the lifetime of the `Protocol`.
pub type EntryId = usize;

/// The four entry variants of the protocol IR (§3).
#[derive(Debug, Clone)]
pub enum EntryKind {
    Field(FieldDef),
    Sequence(SequenceDef),
    Choice(ChoiceDef),
    SequenceOf(SequenceOfDef),
    /// A back-reference to an ancestor entry, used to close a recursive grammar without an
    /// owned cycle (Design Notes, §9). Decoding/encoding a `Recurse` simply re-enters the
    /// target entry.
    Recurse(EntryId),
}

/// A single node of the protocol tree.
#[derive(Debug, Clone)]
pub struct EntryDef {
    pub name: String,
    pub hidden: bool,
    pub constraints: Vec<Constraint>,
    pub kind: EntryKind,
}

impl EntryDef {
    pub fn new(name: impl Into<String>, kind: EntryKind) -> Self {
        EntryDef { name: name.into(), hidden: false, constraints: Vec::new(), kind }
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }
}

/// The interpretation of a `Field`'s raw bits (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Integer,
    Text,
    Hex,
    Binary,
    Float,
}

/// Byte order for multi-bit `Field`s. `Little` is only legal for bit widths that are a multiple
/// of 8 (invariant enforced at decode/encode time, not construction time, since the width is
/// itself an expression that may not be a compile-time constant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub length: Expr,
    pub format: Format,
    pub endian: Endian,
}

/// A named link to a child entry. `Sequence` children and `Choice` alternatives both use this;
/// the name is what a dotted [`crate::expr::Reference`] resolves against.
#[derive(Debug, Clone)]
pub struct NamedChild {
    pub name: String,
    pub entry: EntryId,
}

#[derive(Debug, Clone)]
pub struct SequenceDef {
    pub children: Vec<NamedChild>,
    /// A scalar derived from child values, making the `Sequence` itself referenceable as if it
    /// were a `Field`.
    pub value: Option<Expr>,
    /// Total length of the sequence in bits; if set, decoding is confined to exactly this many
    /// bits and any leftover is an error (§4.4).
    pub length: Option<Expr>,
}

#[derive(Debug, Clone)]
pub struct ChoiceDef {
    /// Non-empty, ordered list of alternatives; first successful decode wins (Invariant 4).
    pub alternatives: Vec<NamedChild>,
}

/// Exactly one of these terminates a `SequenceOf`'s repetition (Invariant 2).
#[derive(Debug, Clone)]
pub enum Terminator {
    Count(Expr),
    Length(Expr),
    /// The named entry elsewhere in the tree whose successful decode sets the shared
    /// "should end" boolean (Design Notes, §9).
    EndMarker(EntryId),
}

#[derive(Debug, Clone)]
pub struct SequenceOfDef {
    pub child: EntryId,
    pub terminator: Terminator,
}

/// A relational or equality constraint attached to an entry (§3).
#[derive(Debug, Clone)]
pub struct Constraint {
    pub op: ConstraintOp,
    pub expr: Expr,
}

impl Constraint {
    pub fn new(op: ConstraintOp, expr: Expr) -> Self {
        Constraint { op, expr }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl ConstraintOp {
    /// Evaluates the constraint's relational operator over two already-coerced integers.
    pub fn holds(&self, lhs: i64, rhs: i64) -> bool {
        match self {
            ConstraintOp::Eq => lhs == rhs,
            ConstraintOp::Ne => lhs != rhs,
            ConstraintOp::Lt => lhs < rhs,
            ConstraintOp::Le => lhs <= rhs,
            ConstraintOp::Gt => lhs > rhs,
            ConstraintOp::Ge => lhs >= rhs,
        }
    }
}

/// An immutable, arena-backed protocol tree (§3, Lifecycles).
///
/// `Protocol` is built once by the caller (typically from a loader that is out of scope for this
/// crate, §6) and is safe to share across concurrent decode/encode calls since it is never
/// mutated after construction.
#[derive(Debug, Clone)]
pub struct Protocol {
    pub entries: Vec<EntryDef>,
    pub root: EntryId,
}

impl Protocol {
    pub fn new(entries: Vec<EntryDef>, root: EntryId) -> Self {
        Protocol { entries, root }
    }

    pub fn entry(&self, id: EntryId) -> &EntryDef {
        &self.entries[id]
    }

    pub fn root(&self) -> &EntryDef {
        self.entry(self.root)
    }

    /// Validates the structural invariants of §3 that can be checked without decoding any data.
    ///
    /// This includes Invariant 5 ("equality constraints on fixed-width integer fields must fit
    /// in the field width"), checked with [`crate::expr::range_of`] against the running table of
    /// constant-width fields' ranges: a constraint whose expression doesn't resolve to an exact
    /// value (e.g. it depends on another field that isn't itself a constant width) can't be
    /// proven to violate the invariant statically, so it's let through rather than rejected on a
    /// guess.
    pub fn validate(&self) -> crate::errors::Result<()> {
        use std::collections::HashMap;

        use crate::expr::{range_of, Range};

        let mut field_ranges: HashMap<EntryId, Range> = HashMap::new();

        for (id, entry) in self.entries.iter().enumerate() {
            match &entry.kind {
                EntryKind::Field(f) => {
                    if f.format == Format::Float {
                        // Width is an expression; constant widths are checked here, dynamic ones
                        // at decode/encode time (§4.4).
                        if let Some(w) = f.length.as_const() {
                            if w != 32 && w != 64 {
                                return crate::errors::invalid_protocol(
                                    "Float field width must be 32 or 64 bits",
                                );
                            }
                        }
                        if !entry.constraints.is_empty() {
                            return crate::errors::invalid_protocol(
                                "Float fields cannot carry constraints",
                            );
                        }
                    }

                    if f.format == Format::Integer {
                        if let Some(w) = f.length.as_const() {
                            if (0..=64).contains(&w) {
                                let field_range = Range::unsigned(w as u32);
                                for constraint in &entry.constraints {
                                    if constraint.op == ConstraintOp::Eq {
                                        let range = range_of(&constraint.expr, &field_ranges);
                                        if range.min == range.max && !field_range.contains(range.min)
                                        {
                                            return crate::errors::invalid_protocol(
                                                "equality constraint does not fit in its field's width",
                                            );
                                        }
                                    }
                                }
                                field_ranges.insert(id, field_range);
                            }
                        }
                    }
                }
                EntryKind::Choice(c) => {
                    if c.alternatives.is_empty() {
                        return crate::errors::invalid_protocol(
                            "Choice must have at least one alternative",
                        );
                    }
                }
                EntryKind::SequenceOf(_) | EntryKind::Sequence(_) | EntryKind::Recurse(_) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;

    fn int_field(width: Expr) -> EntryDef {
        EntryDef::new("x", EntryKind::Field(FieldDef { length: width, format: Format::Integer, endian: Endian::Big }))
    }

    #[test]
    fn float_field_width_must_be_32_or_64() {
        let entries = vec![EntryDef::new(
            "x",
            EntryKind::Field(FieldDef { length: Expr::Const(16), format: Format::Float, endian: Endian::Big }),
        )];
        let protocol = Protocol::new(entries, 0);
        assert!(protocol.validate().is_err());
    }

    #[test]
    fn float_field_cannot_carry_a_constraint() {
        let entries = vec![EntryDef::new(
            "x",
            EntryKind::Field(FieldDef { length: Expr::Const(32), format: Format::Float, endian: Endian::Big }),
        )
        .with_constraint(Constraint::new(ConstraintOp::Eq, Expr::Const(0)))];
        let protocol = Protocol::new(entries, 0);
        assert!(protocol.validate().is_err());
    }

    #[test]
    fn choice_must_have_at_least_one_alternative() {
        let entries = vec![EntryDef::new("c", EntryKind::Choice(ChoiceDef { alternatives: vec![] }))];
        let protocol = Protocol::new(entries, 0);
        assert!(protocol.validate().is_err());
    }

    #[test]
    fn equality_constraint_wider_than_field_is_rejected() {
        let entries =
            vec![int_field(Expr::Const(8)).with_constraint(Constraint::new(ConstraintOp::Eq, Expr::Const(300)))];
        let protocol = Protocol::new(entries, 0);
        assert!(protocol.validate().is_err());
    }

    #[test]
    fn equality_constraint_within_field_width_is_accepted() {
        let entries =
            vec![int_field(Expr::Const(8)).with_constraint(Constraint::new(ConstraintOp::Eq, Expr::Const(200)))];
        let protocol = Protocol::new(entries, 0);
        assert!(protocol.validate().is_ok());
    }
}
