// bitproto-core
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The recursive-descent decoder (C6): turns a byte buffer into a [`value::Node`] tree against a
//! [`Protocol`].

use log::trace;

use crate::bitstream::{self, BitReader};
use crate::errors::{self, Result};
use crate::expr::{self, Env};
use crate::ir::{Endian, EntryId, EntryKind, Format, Protocol, Terminator};
use crate::params::{self, Params};
use crate::value::{Node, Value};

/// Tuning knobs for [`decode`] that don't change what a protocol means, only how defensively the
/// walk runs against it (§5, "timeouts are not modeled inside the core" — but unbounded
/// recursion through a cyclic `Recurse` entry is, since it would otherwise blow the call stack
/// rather than return an error).
#[derive(Debug, Clone, Copy)]
pub struct DecodeOptions {
    /// Maximum entry nesting depth before giving up with
    /// [`errors::Error::RecursionLimitExceeded`]. Default: `256`.
    pub max_depth: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        DecodeOptions { max_depth: 256 }
    }
}

/// Decodes `protocol.root` from `data` with [`DecodeOptions::default`], returning the decoded
/// tree plus the number of bits consumed.
pub fn decode(protocol: &Protocol, data: &[u8]) -> Result<(Node, u64)> {
    decode_with_options(protocol, data, &DecodeOptions::default())
}

/// Decodes `protocol.root` from `data`, returning the decoded tree plus the number of bits
/// consumed.
pub fn decode_with_options(
    protocol: &Protocol,
    data: &[u8],
    options: &DecodeOptions,
) -> Result<(Node, u64)> {
    protocol.validate()?;
    let mut reader = BitReader::new(data, data.len() as u64 * 8);
    let params = params::analyze(protocol);
    let mut ctx = Decoder { protocol, params, env: Env::new(), depth: 0, max_depth: options.max_depth };
    let start = reader.remaining();
    let node = ctx.decode_entry(&mut reader, protocol.root)?;
    Ok((node, start - reader.remaining()))
}

struct Decoder<'p> {
    protocol: &'p Protocol,
    /// Computed once per call from the static IR (C5); consulted before decoding an entry so a
    /// forward or otherwise unsatisfiable reference is reported against the dependency's name
    /// rather than surfacing as a generic `entry#<id>` from deep inside [`expr::eval`].
    params: Params,
    env: Env,
    depth: usize,
    max_depth: usize,
}

impl<'p> Decoder<'p> {
    fn decode_entry(&mut self, reader: &mut BitReader<'_>, id: EntryId) -> Result<Node> {
        let entry = self.protocol.entry(id);
        trace!("decoding {}", entry.name);

        if self.depth >= self.max_depth {
            return errors::recursion_limit_exceeded(entry.name.clone(), self.max_depth);
        }
        self.depth += 1;
        let result = self.decode_entry_inner(reader, id);
        self.depth -= 1;
        result
    }

    /// Fails fast, before any bits are consumed for `id`, if a value `id`'s own expressions need
    /// hasn't been published yet (§4.3 parameter analysis; Invariant 1 guarantees every such
    /// dependency is supposed to already be in `env` by the time we get here).
    ///
    /// A `SequenceOf`'s `EndMarker` terminator is excluded: parameter analysis records it as a
    /// dependency so encode's pending-resolution can see the link, but the marker itself is
    /// decoded lazily, inside the `SequenceOf`'s own loop (§4.4) — it is never available *before*
    /// the `SequenceOf` starts, so treating it as a precondition here would always fail.
    fn check_dependencies(&self, id: EntryId) -> Result<()> {
        let entry = self.protocol.entry(id);
        let lazy_dep = match &entry.kind {
            EntryKind::SequenceOf(s) => match &s.terminator {
                Terminator::EndMarker(marker) => Some(*marker),
                _ => None,
            },
            _ => None,
        };
        for dep in self.params.depends_on(id) {
            if Some(dep) == lazy_dep {
                continue;
            }
            if self.env.get(dep).is_none() {
                let dep_name = self.protocol.entry(dep).name.clone();
                return errors::missing_input(entry.name.clone(), dep_name);
            }
        }
        Ok(())
    }

    fn decode_entry_inner(&mut self, reader: &mut BitReader<'_>, id: EntryId) -> Result<Node> {
        let entry = self.protocol.entry(id);
        self.check_dependencies(id)?;

        let value = match &entry.kind {
            EntryKind::Field(_) => self.decode_field(reader, id)?,
            EntryKind::Sequence(_) => self.decode_sequence(reader, id)?,
            EntryKind::Choice(_) => self.decode_choice(reader, id)?,
            EntryKind::SequenceOf(_) => self.decode_sequence_of(reader, id)?,
            EntryKind::Recurse(target) => return self.decode_entry(reader, *target),
        };

        if let Some(v) = value.as_integer() {
            self.env.set(id, v);
        }
        self.check_constraints(id, &value)?;

        let entry = self.protocol.entry(id);
        Ok(Node::new(id, entry.name.clone(), value))
    }

    fn check_constraints(&self, id: EntryId, value: &Value) -> Result<()> {
        let entry = self.protocol.entry(id);
        if entry.constraints.is_empty() {
            return Ok(());
        }
        let actual = value.as_integer().unwrap_or_default();
        for constraint in &entry.constraints {
            let expected = expr::eval(&constraint.expr, &self.env, &entry.name)?;
            if !constraint.op.holds(actual, expected) {
                return errors::constraint_failed(entry.name.clone(), constraint.op);
            }
        }
        Ok(())
    }

    fn decode_field(&mut self, reader: &mut BitReader<'_>, id: EntryId) -> Result<Value> {
        let entry = self.protocol.entry(id);
        let name = entry.name.clone();
        let f = match &entry.kind {
            EntryKind::Field(f) => f.clone(),
            _ => unreachable!(),
        };

        let width = expr::eval(&f.length, &self.env, &name)?;
        if width < 0 {
            return errors::invalid_format(name, "negative length");
        }
        let width = width as u64;

        match f.format {
            Format::Integer => {
                if width > 64 {
                    return errors::invalid_format(name, "integer field wider than 64 bits");
                }
                let raw = match f.endian {
                    Endian::Big => reader.take(width as u32, &name)?,
                    Endian::Little => reader.take_le(width as u32, &name)?,
                };
                Ok(Value::Integer(raw as i64))
            }
            Format::Text => {
                if width % 8 != 0 {
                    return errors::invalid_format(name, "text field not byte-aligned");
                }
                let bytes = reader.take_bytes((width / 8) as usize, &name)?;
                Ok(Value::Text(bytes))
            }
            Format::Hex => {
                if width % 8 != 0 {
                    return errors::invalid_format(name, "hex field not byte-aligned");
                }
                let bytes = reader.take_bytes((width / 8) as usize, &name)?;
                Ok(Value::Hex(bytes))
            }
            Format::Binary => {
                let buf = reader.take_bits(width, &name)?;
                Ok(Value::Binary(buf))
            }
            Format::Float => match width {
                32 => Ok(Value::Float(bitstream::decode_float32(reader, f.endian, &name)? as f64)),
                64 => Ok(Value::Float(bitstream::decode_float64(reader, f.endian, &name)?)),
                _ => errors::invalid_format(name, "float field width must be 32 or 64"),
            },
        }
    }

    fn decode_sequence(&mut self, reader: &mut BitReader<'_>, id: EntryId) -> Result<Value> {
        let entry = self.protocol.entry(id);
        let name = entry.name.clone();
        let seq = match &entry.kind {
            EntryKind::Sequence(s) => s.clone(),
            _ => unreachable!(),
        };

        let budget = match &seq.length {
            Some(expr) => Some(expr::eval(expr, &self.env, &name)? as u64),
            None => None,
        };
        let start_remaining = reader.remaining();

        let mut children = Vec::with_capacity(seq.children.len());
        for child in &seq.children {
            children.push(self.decode_entry(reader, child.entry)?);
        }

        if let Some(length) = budget {
            let consumed = start_remaining - reader.remaining();
            if consumed != length {
                return errors::under_run(name, length, consumed);
            }
        }

        let scalar = match &seq.value {
            Some(expr) => Some(expr::eval(expr, &self.env, &name)?),
            None => None,
        };

        Ok(Value::Sequence { children, scalar })
    }

    fn decode_choice(&mut self, reader: &mut BitReader<'_>, id: EntryId) -> Result<Value> {
        let entry = self.protocol.entry(id);
        let name = entry.name.clone();
        let choice = match &entry.kind {
            EntryKind::Choice(c) => c.clone(),
            _ => unreachable!(),
        };

        for alt in &choice.alternatives {
            let mut attempt = reader.clone();
            let env_snapshot = self.env.clone();
            match self.decode_entry(&mut attempt, alt.entry) {
                Ok(node) => {
                    *reader = attempt;
                    return Ok(Value::Choice { chosen: Box::new(node) });
                }
                Err(_) => {
                    self.env = env_snapshot;
                }
            }
        }
        errors::no_choice_matched(name, choice.alternatives.len())
    }

    fn decode_sequence_of(&mut self, reader: &mut BitReader<'_>, id: EntryId) -> Result<Value> {
        let entry = self.protocol.entry(id);
        let name = entry.name.clone();
        let def = match &entry.kind {
            EntryKind::SequenceOf(s) => s.clone(),
            _ => unreachable!(),
        };

        let mut items = Vec::new();

        match &def.terminator {
            Terminator::Count(expr) => {
                let count = expr::eval(expr, &self.env, &name)?;
                if count < 0 {
                    return errors::invalid_format(name, "negative repetition count");
                }
                for _ in 0..count {
                    items.push(self.decode_entry(reader, def.child)?);
                }
            }
            Terminator::Length(expr) => {
                let budget = expr::eval(expr, &self.env, &name)? as u64;
                let start_remaining = reader.remaining();
                loop {
                    let consumed = start_remaining - reader.remaining();
                    if consumed == budget {
                        break;
                    }
                    if consumed > budget {
                        return errors::under_run(name, budget, consumed);
                    }
                    items.push(self.decode_entry(reader, def.child)?);
                }
            }
            Terminator::EndMarker(marker) => loop {
                let mut attempt = reader.clone();
                let env_snapshot = self.env.clone();
                match self.decode_entry(&mut attempt, *marker) {
                    Ok(_) => {
                        *reader = attempt;
                        break;
                    }
                    Err(_) => {
                        self.env = env_snapshot;
                    }
                }
                if reader.remaining() == 0 {
                    return errors::unterminated_repetition(name);
                }
                items.push(self.decode_entry(reader, def.child)?);
            },
        }

        Ok(Value::SequenceOf(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Constraint, ConstraintOp, EntryDef, FieldDef, NamedChild, SequenceDef, SequenceOfDef};

    fn int_field(name: &str, width: i64, endian: Endian) -> EntryDef {
        EntryDef::new(name, EntryKind::Field(FieldDef {
            length: crate::expr::Expr::Const(width),
            format: Format::Integer,
            endian,
        }))
    }

    #[test]
    fn decodes_big_endian_16_bit_integer() {
        let entries = vec![int_field("value", 16, Endian::Big)];
        let protocol = Protocol::new(entries, 0);
        let (node, bits) = decode(&protocol, &[0x01, 0x02]).unwrap();
        assert_eq!(bits, 16);
        assert_eq!(node.value, Value::Integer(258));
    }

    #[test]
    fn decodes_little_endian_16_bit_integer() {
        let entries = vec![int_field("value", 16, Endian::Little)];
        let protocol = Protocol::new(entries, 0);
        let (node, _) = decode(&protocol, &[0x01, 0x02]).unwrap();
        assert_eq!(node.value, Value::Integer(513));
    }

    #[test]
    fn length_prefixed_text_reads_declared_byte_count() {
        // len: u8; text: Text[len * 8]
        let entries = vec![
            int_field("len", 8, Endian::Big),
            EntryDef::new("text", EntryKind::Field(FieldDef {
                length: crate::expr::Expr::mul(crate::expr::Expr::Ref(0), crate::expr::Expr::Const(8)),
                format: Format::Text,
                endian: Endian::Big,
            })),
            EntryDef::new("frame", EntryKind::Sequence(SequenceDef {
                children: vec![
                    NamedChild { name: "len".into(), entry: 0 },
                    NamedChild { name: "text".into(), entry: 1 },
                ],
                value: None,
                length: None,
            })),
        ];
        let protocol = Protocol::new(entries, 2);
        let (node, _) = decode(&protocol, &[3, b'h', b'i', b'!']).unwrap();
        match node.value {
            Value::Sequence { children, .. } => {
                assert_eq!(children[1].value, Value::Text(b"hi!".to_vec()));
            }
            _ => panic!("expected sequence"),
        }
    }

    #[test]
    fn choice_picks_first_successful_alternative() {
        let entries = vec![
            int_field("a", 8, Endian::Big).with_constraint(Constraint::new(
                ConstraintOp::Eq,
                crate::expr::Expr::Const(1),
            )),
            int_field("b", 8, Endian::Big),
            EntryDef::new("choice", EntryKind::Choice(crate::ir::ChoiceDef {
                alternatives: vec![
                    NamedChild { name: "a".into(), entry: 0 },
                    NamedChild { name: "b".into(), entry: 1 },
                ],
            })),
        ];
        let protocol = Protocol::new(entries, 2);
        let (node, _) = decode(&protocol, &[99]).unwrap();
        match node.value {
            Value::Choice { chosen } => assert_eq!(chosen.name, "b"),
            _ => panic!("expected choice"),
        }
    }

    #[test]
    fn end_marked_sequence_of_stops_at_marker() {
        let entries = vec![
            int_field("marker", 8, Endian::Big).with_constraint(Constraint::new(
                ConstraintOp::Eq,
                crate::expr::Expr::Const(0),
            )),
            int_field("item", 8, Endian::Big),
            EntryDef::new("items", EntryKind::SequenceOf(SequenceOfDef {
                child: 1,
                terminator: Terminator::EndMarker(0),
            })),
        ];
        let protocol = Protocol::new(entries, 2);
        let (node, _) = decode(&protocol, &[10, 20, 0]).unwrap();
        match node.value {
            Value::SequenceOf(items) => {
                assert_eq!(items.len(), 2);
                assert_eq!(items[0].value, Value::Integer(10));
                assert_eq!(items[1].value, Value::Integer(20));
            }
            _ => panic!("expected sequence_of"),
        }
    }

    #[test]
    fn constraint_failure_is_reported() {
        let entries =
            vec![int_field("flag", 8, Endian::Big)
                .with_constraint(Constraint::new(ConstraintOp::Eq, crate::expr::Expr::Const(1)))];
        let protocol = Protocol::new(entries, 0);
        assert!(decode(&protocol, &[2]).is_err());
    }

    #[test]
    fn forward_reference_is_reported_against_the_dependency_name() {
        // "text" is declared (and decoded) before "len", which its own length expression
        // references — a violation of Invariant 1. Parameter analysis catches it immediately,
        // naming "len" rather than failing deep inside expression evaluation with a bare id.
        let entries = vec![
            EntryDef::new("text", EntryKind::Field(FieldDef {
                length: crate::expr::Expr::mul(crate::expr::Expr::Ref(1), crate::expr::Expr::Const(8)),
                format: Format::Text,
                endian: Endian::Big,
            })),
            int_field("len", 8, Endian::Big),
            EntryDef::new("frame", EntryKind::Sequence(SequenceDef {
                children: vec![
                    NamedChild { name: "text".into(), entry: 0 },
                    NamedChild { name: "len".into(), entry: 1 },
                ],
                value: None,
                length: None,
            })),
        ];
        let protocol = Protocol::new(entries, 2);
        let err = decode(&protocol, &[3, b'h', b'i', b'!']).unwrap_err();
        match err {
            crate::errors::Error::MissingInput { entry, reference } => {
                assert_eq!(entry, "text");
                assert_eq!(reference, "len");
            }
            other => panic!("expected MissingInput, got {other:?}"),
        }
    }

    #[test]
    fn cyclic_recurse_hits_the_depth_limit_instead_of_overflowing_the_stack() {
        let entries = vec![EntryDef::new("looping", EntryKind::Recurse(0))];
        let protocol = Protocol::new(entries, 0);
        let options = DecodeOptions { max_depth: 32 };
        let err = decode_with_options(&protocol, &[], &options).unwrap_err();
        assert!(matches!(err, crate::errors::Error::RecursionLimitExceeded { limit: 32, .. }));
    }
}
