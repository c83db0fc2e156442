// bitproto-core
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `bitproto-core` decodes and encodes binary wire formats from a declarative protocol
//! description: a tree of fields, sequences, choices and repetitions ([`ir`]), lengths and
//! constraints expressed as arithmetic over sibling values ([`expr`]), and a bit-accurate stream
//! codec underneath it all ([`bitstream`]).
//!
//! The crate does not parse a protocol description language and does not know about any
//! particular wire format; it is the runtime that a generated or hand-built [`ir::Protocol`] is
//! decoded and encoded against. Building that `Protocol` from source text is the job of a loader
//! living outside this crate.
//!
//! Module map:
//!
//! - [`ir`] — the protocol tree: `Field`, `Sequence`, `Choice`, `SequenceOf`.
//! - [`expr`] — arithmetic expressions: evaluation, inversion, range analysis.
//! - [`bitstream`] — bit-addressable reading and writing, and the float/integer codec.
//! - [`params`] — static analysis of which entries need a value fed in from outside before they
//!   can be decoded or encoded.
//! - [`value`] — the decoded value tree handed back to callers.
//! - [`decode`] — turns bytes into a [`value::Value`] tree against a [`ir::Protocol`].
//! - [`encode`] — turns a [`value::Value`] tree into bytes against a [`ir::Protocol`].
//! - [`errors`] — the shared error taxonomy.

pub mod bitstream;
pub mod decode;
pub mod encode;
pub mod errors;
pub mod expr;
pub mod ir;
pub mod params;
pub mod value;
