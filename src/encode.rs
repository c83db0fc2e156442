// bitproto-core
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The encoder (C7): turns a [`value::Node`] tree into bytes against a [`Protocol`].
//!
//! Most entries carry a caller-supplied value straight through. The interesting case is a
//! *hidden* entry — typically a length or count prefix the caller never has to populate because
//! it's implied by the rest of the message. Those are written as a zero-width-preserving mock
//! value first; once every sibling that depends on them has actually been written, their real
//! value is solved for with [`crate::expr::solve`] and patched into the already-written bits
//! (§4.5). A hidden entry with no dependent to solve from falls back to the constant side of an
//! equality constraint, which covers fixed sentinel values such as end-of-repetition markers.

use log::trace;

use crate::bitstream::{BitReader, BitWriter};
use crate::errors::{self, Result};
use crate::expr::{self, Env, Expr};
use crate::ir::{ConstraintOp, Endian, EntryId, EntryKind, Format, Protocol, Terminator};
use crate::params::{self, Params};
use crate::value::{Node, Value};

/// A hidden field written as a placeholder, waiting to be solved once enough of the message
/// around it is known.
struct Pending {
    entry: EntryId,
    bit_pos: u64,
    width: u32,
}

/// Tuning knobs for [`encode`], mirroring [`crate::decode::DecodeOptions`].
#[derive(Debug, Clone, Copy)]
pub struct EncodeOptions {
    /// Maximum entry nesting depth before giving up with
    /// [`errors::Error::RecursionLimitExceeded`]. Default: `256`.
    pub max_depth: usize,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        EncodeOptions { max_depth: 256 }
    }
}

/// Encodes `node` against `protocol.root` with [`EncodeOptions::default`], returning the
/// finished byte buffer.
pub fn encode(protocol: &Protocol, node: &Node) -> Result<Vec<u8>> {
    encode_with_options(protocol, node, &EncodeOptions::default())
}

/// Encodes `node` against `protocol.root`, returning the finished byte buffer.
pub fn encode_with_options(
    protocol: &Protocol,
    node: &Node,
    options: &EncodeOptions,
) -> Result<Vec<u8>> {
    protocol.validate()?;
    let mut writer = BitWriter::new();
    let params = params::analyze(protocol);
    let mut ctx = Encoder {
        protocol,
        params,
        env: Env::new(),
        pending: Vec::new(),
        depth: 0,
        max_depth: options.max_depth,
    };
    ctx.encode_entry(&mut writer, protocol.root, Some(node))?;

    if let Some(p) = ctx.pending.first() {
        let entry = ctx.protocol.entry(p.entry);
        return errors::missing_input(entry.name.clone(), "no sibling resolves this value");
    }

    let (bytes, _) = writer.into_inner();
    Ok(bytes)
}

struct Encoder<'p> {
    protocol: &'p Protocol,
    /// Computed once per call from the static IR (C5); lets a hidden field with no supplied
    /// value and no implied constant fail immediately if nothing in the protocol could ever
    /// solve it, instead of writing a placeholder that lingers to the end-of-call pending check.
    params: Params,
    env: Env,
    pending: Vec<Pending>,
    depth: usize,
    max_depth: usize,
}

/// What kind of "freshly known" metric resolves a pending hidden field once its relating entry
/// finishes encoding: most entries relate to a sibling by bit width, but a `SequenceOf` whose
/// terminator is a repetition `Count` relates by item count instead (§4.5).
enum RelatingMetric {
    Bits(Expr),
    Count(Expr),
}

impl<'p> Encoder<'p> {
    fn encode_entry(
        &mut self,
        writer: &mut BitWriter,
        id: EntryId,
        node: Option<&Node>,
    ) -> Result<u64> {
        let entry = self.protocol.entry(id);
        if self.depth >= self.max_depth {
            return errors::recursion_limit_exceeded(entry.name.clone(), self.max_depth);
        }
        self.depth += 1;
        let result = self.encode_entry_inner(writer, id, node);
        self.depth -= 1;
        result
    }

    fn encode_entry_inner(
        &mut self,
        writer: &mut BitWriter,
        id: EntryId,
        node: Option<&Node>,
    ) -> Result<u64> {
        let entry = self.protocol.entry(id);
        trace!("encoding {}", entry.name);
        let start = writer.num_bits();

        let item_count = match &entry.kind {
            EntryKind::Field(_) => {
                self.encode_field(writer, id, node)?;
                None
            }
            EntryKind::Sequence(_) => {
                self.encode_sequence(writer, id, node)?;
                None
            }
            EntryKind::Choice(_) => {
                self.encode_choice(writer, id, node)?;
                None
            }
            EntryKind::SequenceOf(_) => Some(self.encode_sequence_of(writer, id, node)?),
            EntryKind::Recurse(target) => return self.encode_entry(writer, *target, node),
        };

        let bits = writer.num_bits() - start;
        self.try_resolve_pending(writer, id, bits as i64, item_count)?;
        self.check_constraints(id)?;
        Ok(bits)
    }

    /// The constant a hidden entry must carry when no dependent gives us a value to solve from,
    /// e.g. an end-of-repetition marker constrained to `== 0`.
    fn implied_constant(&self, id: EntryId) -> Option<i64> {
        let entry = self.protocol.entry(id);
        entry.constraints.iter().find_map(|c| {
            if c.op == ConstraintOp::Eq { c.expr.as_const() } else { None }
        })
    }

    fn check_constraints(&self, id: EntryId) -> Result<()> {
        let entry = self.protocol.entry(id);
        if entry.constraints.is_empty() {
            return Ok(());
        }
        let Some(actual) = self.env.get(id) else { return Ok(()) };
        for constraint in &entry.constraints {
            let expected = expr::eval(&constraint.expr, &self.env, &entry.name)?;
            if !constraint.op.holds(actual, expected) {
                return errors::constraint_failed(entry.name.clone(), constraint.op);
            }
        }
        Ok(())
    }

    /// After writing an entry, see whether any still-pending hidden field can now be solved
    /// against the expression that relates it to `id`'s freshly-known metric: its encoded bit
    /// width for a `Field`/`Sequence`/length-terminated `SequenceOf`, or its repetition count for
    /// a count-terminated `SequenceOf` (§4.5) — these are different quantities and must not be
    /// conflated, or solving a hidden `count` field against a byte count silently produces the
    /// wrong value instead of an error.
    fn try_resolve_pending(
        &mut self,
        writer: &mut BitWriter,
        id: EntryId,
        bits: i64,
        item_count: Option<i64>,
    ) -> Result<()> {
        let (relating_expr, metric) = match self.relating_metric(id) {
            Some(RelatingMetric::Bits(e)) => (e, bits),
            Some(RelatingMetric::Count(e)) => match item_count {
                Some(count) => (e, count),
                None => return Ok(()),
            },
            None => return Ok(()),
        };

        let mut resolved_index = None;
        for (i, p) in self.pending.iter().enumerate() {
            if relating_expr.references(p.entry) {
                resolved_index = Some(i);
                break;
            }
        }
        let Some(i) = resolved_index else { return Ok(()) };
        let p = self.pending.remove(i);
        let entry_name = self.protocol.entry(p.entry).name.clone();
        let solved = expr::solve(&relating_expr, p.entry, metric, &self.env, &entry_name)?;
        writer.patch_be(p.bit_pos, solved as u64, p.width, &entry_name)?;
        self.env.set(p.entry, solved);
        Ok(())
    }

    /// The expression that determines `id`'s own size metric, if any, and which kind of metric it
    /// is measured in: a variable-width `Field`'s declared length, a `Sequence`'s byte budget, and
    /// a length-terminated `SequenceOf` all relate the entry's *bit width* back to some other
    /// (possibly still-pending) entry; a count-terminated `SequenceOf` instead relates its
    /// *repetition count*.
    fn relating_metric(&self, id: EntryId) -> Option<RelatingMetric> {
        match &self.protocol.entry(id).kind {
            EntryKind::Field(f) => Some(RelatingMetric::Bits(f.length.clone())),
            EntryKind::Sequence(s) => s.length.clone().map(RelatingMetric::Bits),
            EntryKind::SequenceOf(s) => match &s.terminator {
                Terminator::Count(e) => Some(RelatingMetric::Count(e.clone())),
                Terminator::Length(e) => Some(RelatingMetric::Bits(e.clone())),
                Terminator::EndMarker(_) => None,
            },
            _ => None,
        }
    }

    fn encode_field(&mut self, writer: &mut BitWriter, id: EntryId, node: Option<&Node>) -> Result<()> {
        let entry = self.protocol.entry(id);
        let name = entry.name.clone();
        let f = match &entry.kind {
            EntryKind::Field(f) => f.clone(),
            _ => unreachable!(),
        };

        if let Some(node) = node {
            return self.encode_field_value(writer, id, &name, &f, &node.value);
        }

        if let Some(constant) = self.implied_constant(id) {
            return self.encode_field_value(writer, id, &name, &f, &Value::Integer(constant));
        }

        if !self.params.is_referenced(id) {
            // Nothing in the protocol could ever solve this: fail now rather than writing a
            // placeholder that will only be discovered unresolved once the whole message is done.
            return errors::missing_input(name, "no sibling resolves this value");
        }

        // Hidden, no supplied value, no implied constant, but referenced by something later:
        // write a zero placeholder of the declared width and solve it once that reference is
        // known (§4.5).
        let width = expr::eval(&f.length, &self.env, &name)?;
        if width < 0 || width > 64 {
            return errors::invalid_format(name, "unresolvable hidden field width");
        }
        let bit_pos = writer.num_bits();
        writer.append_be(0, width as u32, &name)?;
        self.pending.push(Pending { entry: id, bit_pos, width: width as u32 });
        Ok(())
    }

    fn encode_field_value(
        &mut self,
        writer: &mut BitWriter,
        id: EntryId,
        name: &str,
        f: &crate::ir::FieldDef,
        value: &Value,
    ) -> Result<()> {
        match (f.format, value) {
            (Format::Integer, Value::Integer(v)) => {
                let width = expr::eval(&f.length, &self.env, name)?;
                if !(0..=64).contains(&width) {
                    return errors::invalid_format(name, "integer field width out of range");
                }
                match f.endian {
                    Endian::Big => writer.append_be(*v as u64, width as u32, name)?,
                    Endian::Little => writer.append_le(*v as u64, width as u32, name)?,
                }
                self.env.set(id, *v);
            }
            (Format::Text, Value::Text(bytes)) | (Format::Hex, Value::Hex(bytes)) => {
                for b in bytes {
                    writer.append_be(*b as u64, 8, name)?;
                }
                self.env.set(id, bytes.iter().fold(0i64, |acc, b| (acc << 8) | *b as i64));
            }
            (Format::Binary, Value::Binary(buf)) => {
                writer.append_bitbuf(buf, name)?;
                self.env.set(id, buf.as_unsigned() as i64);
            }
            (Format::Float, Value::Float(v)) => {
                let width = expr::eval(&f.length, &self.env, name)?;
                match width {
                    32 => writer.append_float32(*v as f32, f.endian, name)?,
                    64 => writer.append_float64(*v, f.endian, name)?,
                    _ => return errors::invalid_format(name, "float field width must be 32 or 64"),
                }
            }
            _ => return errors::invalid_format(name.to_string(), "value does not match field format"),
        }
        Ok(())
    }

    fn encode_sequence(&mut self, writer: &mut BitWriter, id: EntryId, node: Option<&Node>) -> Result<()> {
        let entry = self.protocol.entry(id);
        let name = entry.name.clone();
        let seq = match &entry.kind {
            EntryKind::Sequence(s) => s.clone(),
            _ => unreachable!(),
        };
        let Some(node) = node else { return errors::missing_input(name, "sequence value") };
        let supplied = match &node.value {
            Value::Sequence { children, .. } => children,
            _ => return errors::invalid_format(name, "expected a sequence value"),
        };

        for child in &seq.children {
            let child_node = supplied.iter().find(|n| n.name == child.name);
            self.encode_entry(writer, child.entry, child_node)?;
        }

        if let Some(value_expr) = &seq.value {
            let scalar = expr::eval(value_expr, &self.env, &name)?;
            self.env.set(id, scalar);
        }
        Ok(())
    }

    fn encode_choice(&mut self, writer: &mut BitWriter, id: EntryId, node: Option<&Node>) -> Result<()> {
        let entry = self.protocol.entry(id);
        let name = entry.name.clone();
        let choice = match &entry.kind {
            EntryKind::Choice(c) => c.clone(),
            _ => unreachable!(),
        };

        if let Some(node) = node {
            let chosen = match &node.value {
                Value::Choice { chosen } => chosen,
                _ => return errors::invalid_format(name, "expected a choice value"),
            };
            let alt = match choice.alternatives.iter().find(|a| a.name == chosen.name) {
                Some(a) => a,
                None => return errors::invalid_format(name, "no alternative matches the supplied value"),
            };
            self.encode_entry(writer, alt.entry, Some(chosen))?;
            return Ok(());
        }

        // Hidden choice, no caller-supplied tag: try each alternative in order on a scratch
        // buffer, with no input of its own, and commit the first that encodes successfully
        // (§4.5, "Choice encoder"). This only ever succeeds for an alternative whose own entries
        // are all themselves solvable with no external value (e.g. a fixed discriminant chain).
        for alt in &choice.alternatives {
            let mut scratch = BitWriter::new();
            let env_snapshot = self.env.clone();
            let pending_before = self.pending.len();

            match self.encode_entry(&mut scratch, alt.entry, None) {
                Ok(_) => {
                    let offset = writer.num_bits();
                    let (bytes, bits) = scratch.into_inner();
                    let mut reader = BitReader::new(&bytes, bits);
                    writer.append_bits(&mut reader, &name)?;
                    for p in &mut self.pending[pending_before..] {
                        p.bit_pos += offset;
                    }
                    return Ok(());
                }
                Err(_) => {
                    self.env = env_snapshot;
                    self.pending.truncate(pending_before);
                }
            }
        }
        errors::no_choice_matched(name, choice.alternatives.len())
    }

    /// Encodes every item and, for an `EndMarker` terminator, the marker itself. Returns the
    /// number of items written, the metric a `Terminator::Count` relates a hidden sibling to
    /// (§4.5).
    fn encode_sequence_of(&mut self, writer: &mut BitWriter, id: EntryId, node: Option<&Node>) -> Result<i64> {
        let entry = self.protocol.entry(id);
        let name = entry.name.clone();
        let def = match &entry.kind {
            EntryKind::SequenceOf(s) => s.clone(),
            _ => unreachable!(),
        };
        let Some(node) = node else { return errors::missing_input(name, "sequence-of value") };
        let items = match &node.value {
            Value::SequenceOf(items) => items,
            _ => return errors::invalid_format(name, "expected a sequence-of value"),
        };

        for item in items {
            self.encode_entry(writer, def.child, Some(item))?;
        }

        if let Terminator::EndMarker(marker) = &def.terminator {
            self.encode_entry(writer, *marker, None)?;
        }
        Ok(items.len() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Constraint, EntryDef, FieldDef, NamedChild, SequenceDef, SequenceOfDef};

    fn int_field(name: &str, width: Expr, endian: Endian) -> EntryDef {
        EntryDef::new(name, EntryKind::Field(FieldDef { length: width, format: Format::Integer, endian }))
    }

    #[test]
    fn encodes_big_endian_16_bit_integer() {
        let entries = vec![int_field("value", Expr::Const(16), Endian::Big)];
        let protocol = Protocol::new(entries, 0);
        let node = Node::new(0, "value", Value::Integer(258));
        let bytes = encode(&protocol, &node).unwrap();
        assert_eq!(bytes, vec![0x01, 0x02]);
    }

    #[test]
    fn solves_hidden_length_prefix_from_payload_size() {
        // len: u8 (hidden); text: Text[len * 8]
        let entries = vec![
            int_field("len", Expr::Const(8), Endian::Big).hidden(),
            EntryDef::new(
                "text",
                EntryKind::Field(FieldDef {
                    length: Expr::mul(Expr::Ref(0), Expr::Const(8)),
                    format: Format::Text,
                    endian: Endian::Big,
                }),
            ),
            EntryDef::new(
                "frame",
                EntryKind::Sequence(SequenceDef {
                    children: vec![
                        NamedChild { name: "len".into(), entry: 0 },
                        NamedChild { name: "text".into(), entry: 1 },
                    ],
                    value: None,
                    length: None,
                }),
            ),
        ];
        let protocol = Protocol::new(entries, 2);

        let frame = Node::new(
            2,
            "frame",
            Value::Sequence {
                children: vec![Node::new(1, "text", Value::Text(b"hi!".to_vec()))],
                scalar: None,
            },
        );
        let bytes = encode(&protocol, &frame).unwrap();
        assert_eq!(bytes, vec![3, b'h', b'i', b'!']);
    }

    #[test]
    fn end_marker_is_written_from_its_own_constraint() {
        let entries = vec![
            int_field("marker", Expr::Const(8), Endian::Big)
                .hidden()
                .with_constraint(Constraint::new(ConstraintOp::Eq, Expr::Const(0))),
            int_field("item", Expr::Const(8), Endian::Big),
            EntryDef::new(
                "items",
                EntryKind::SequenceOf(SequenceOfDef { child: 1, terminator: Terminator::EndMarker(0) }),
            ),
        ];
        let protocol = Protocol::new(entries, 2);
        let node = Node::new(
            2,
            "items",
            Value::SequenceOf(vec![
                Node::new(1, "item", Value::Integer(10)),
                Node::new(1, "item", Value::Integer(20)),
            ]),
        );
        let bytes = encode(&protocol, &node).unwrap();
        assert_eq!(bytes, vec![10, 20, 0]);
    }

    #[test]
    fn decode_then_encode_is_bit_exact_across_random_payloads() {
        use rand::rngs::SmallRng;
        use rand::{Rng, SeedableRng};

        let entries = vec![
            int_field("len", Expr::Const(8), Endian::Big).hidden(),
            EntryDef::new(
                "text",
                EntryKind::Field(FieldDef {
                    length: Expr::mul(Expr::Ref(0), Expr::Const(8)),
                    format: Format::Text,
                    endian: Endian::Big,
                }),
            ),
            EntryDef::new(
                "frame",
                EntryKind::Sequence(SequenceDef {
                    children: vec![
                        NamedChild { name: "len".into(), entry: 0 },
                        NamedChild { name: "text".into(), entry: 1 },
                    ],
                    value: None,
                    length: None,
                }),
            ),
        ];
        let protocol = Protocol::new(entries, 2);
        let mut rng = SmallRng::seed_from_u64(0xC0FFEE);

        for _ in 0..64 {
            let len = rng.random_range(0..=40usize);
            let text: Vec<u8> = (0..len).map(|_| rng.random_range(b'a'..=b'z')).collect();
            let mut wire = vec![text.len() as u8];
            wire.extend_from_slice(&text);

            let (decoded, bits) = crate::decode::decode(&protocol, &wire).unwrap();
            assert_eq!(bits, wire.len() as u64 * 8);

            let frame = Node::new(
                2,
                "frame",
                Value::Sequence {
                    children: vec![Node::new(1, "text", Value::Text(text.clone()))],
                    scalar: None,
                },
            );
            let re_encoded = encode(&protocol, &frame).unwrap();
            assert_eq!(re_encoded, wire);

            match decoded.value {
                Value::Sequence { children, .. } => {
                    assert_eq!(children[1].value, Value::Text(text));
                }
                _ => panic!("expected sequence"),
            }
        }
    }

    #[test]
    fn hidden_count_prefix_is_solved_from_repetition_count_not_bit_width() {
        // count: u8 (hidden); item: u8; items: SequenceOf[count]
        let entries = vec![
            int_field("count", Expr::Const(8), Endian::Big).hidden(),
            int_field("item", Expr::Const(8), Endian::Big),
            EntryDef::new(
                "items",
                EntryKind::SequenceOf(SequenceOfDef { child: 1, terminator: Terminator::Count(Expr::Ref(0)) }),
            ),
            EntryDef::new(
                "frame",
                EntryKind::Sequence(SequenceDef {
                    children: vec![
                        NamedChild { name: "count".into(), entry: 0 },
                        NamedChild { name: "items".into(), entry: 2 },
                    ],
                    value: None,
                    length: None,
                }),
            ),
        ];
        let protocol = Protocol::new(entries, 3);

        let frame = Node::new(
            3,
            "frame",
            Value::Sequence {
                children: vec![Node::new(
                    2,
                    "items",
                    Value::SequenceOf(vec![
                        Node::new(1, "item", Value::Integer(10)),
                        Node::new(1, "item", Value::Integer(20)),
                        Node::new(1, "item", Value::Integer(30)),
                    ]),
                )],
                scalar: None,
            },
        );
        let bytes = encode(&protocol, &frame).unwrap();
        // The hidden count must be patched to the item count (3), not the items' bit width (24).
        assert_eq!(bytes, vec![3, 10, 20, 30]);
    }

    #[test]
    fn hidden_choice_probes_alternatives_and_commits_the_first_that_solves() {
        // "a" has no constraint and nothing references it, so it can never be solved and the
        // probe must fall through to "b", whose value is implied by its own `== 2` constraint.
        let entries = vec![
            int_field("a", Expr::Const(8), Endian::Big).hidden(),
            int_field("b", Expr::Const(8), Endian::Big)
                .hidden()
                .with_constraint(Constraint::new(ConstraintOp::Eq, Expr::Const(2))),
            EntryDef::new(
                "choice",
                EntryKind::Choice(crate::ir::ChoiceDef {
                    alternatives: vec![
                        NamedChild { name: "a".into(), entry: 0 },
                        NamedChild { name: "b".into(), entry: 1 },
                    ],
                }),
            ),
        ];
        // Exercise `encode_entry` on the choice directly with `node: None`, the no-supplied-tag
        // path a hidden `Choice` takes when its parent `Sequence` has no value for it.
        let protocol = Protocol::new(entries, 2);
        let mut writer = BitWriter::new();
        let params = params::analyze(&protocol);
        let mut ctx = Encoder { protocol: &protocol, params, env: Env::new(), pending: Vec::new(), depth: 0, max_depth: 256 };
        ctx.encode_entry(&mut writer, 2, None).unwrap();
        let (bytes, _) = writer.into_inner();
        assert_eq!(bytes, vec![2]);
    }

    #[test]
    fn hidden_field_with_no_solver_is_reported_as_missing_input() {
        // A hidden length field with no dependent sibling and no implied constant can't be
        // solved for and has no constant fallback.
        let entries = vec![
            int_field("len", Expr::Const(8), Endian::Big).hidden(),
            EntryDef::new(
                "frame",
                EntryKind::Sequence(SequenceDef {
                    children: vec![NamedChild { name: "len".into(), entry: 0 }],
                    value: None,
                    length: None,
                }),
            ),
        ];
        let protocol = Protocol::new(entries, 1);
        let frame = Node::new(1, "frame", Value::Sequence { children: vec![], scalar: None });
        assert!(encode(&protocol, &frame).is_err());
    }
}
