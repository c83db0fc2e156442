// bitproto-core
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Parameter analysis (C5): for every entry, which other entries' values it needs before it can
//! be decoded or encoded, and which entries need *its* value in turn.
//!
//! The generated C decoder threads these as explicit function parameters — a `decodeField` whose
//! length depends on an earlier sibling takes that sibling's value as an argument rather than
//! reaching into shared state. [`decode`](crate::decode) and [`encode`](crate::encode) use a
//! single [`crate::expr::Env`] instead, but still need to know *which* entries are referenced
//! from outside their own subtree so the walk can fail fast with [`crate::errors::Error::MissingInput`]
//! rather than discovering it mid-decode.

use std::collections::{HashMap, HashSet};

use crate::ir::{EntryId, EntryKind, Protocol, Terminator};

/// The cross-entry value dependencies of a [`Protocol`], computed once and reused across every
/// decode/encode call against that protocol.
#[derive(Debug, Clone, Default)]
pub struct Params {
    /// Entries whose length/terminator/constraint expressions reference `id`, keyed by `id`.
    /// This is the "who needs my value" side.
    outbound: HashMap<EntryId, HashSet<EntryId>>,
    /// The entries `id`'s own expressions reference. This is the "what do I need" side.
    inbound: HashMap<EntryId, HashSet<EntryId>>,
}

impl Params {
    /// Entries that must have already published a value before `id` can be processed.
    pub fn depends_on(&self, id: EntryId) -> impl Iterator<Item = EntryId> + '_ {
        self.inbound.get(&id).into_iter().flatten().copied()
    }

    /// Entries that read `id`'s value once it is available.
    pub fn dependents_of(&self, id: EntryId) -> impl Iterator<Item = EntryId> + '_ {
        self.outbound.get(&id).into_iter().flatten().copied()
    }

    /// True if any entry in the protocol references `id`'s value.
    pub fn is_referenced(&self, id: EntryId) -> bool {
        self.outbound.get(&id).is_some_and(|s| !s.is_empty())
    }
}

/// Walks every entry's length, terminator, and constraint expressions to build the dependency
/// tables. Run once per [`Protocol`] (e.g. at load time), not per decode/encode call.
pub fn analyze(protocol: &Protocol) -> Params {
    let mut params = Params::default();

    for (id, entry) in protocol.entries.iter().enumerate() {
        let mut refs = Vec::new();

        match &entry.kind {
            EntryKind::Field(f) => f.length.referenced_entries(&mut refs),
            EntryKind::Sequence(s) => {
                if let Some(v) = &s.value {
                    v.referenced_entries(&mut refs);
                }
                if let Some(l) = &s.length {
                    l.referenced_entries(&mut refs);
                }
            }
            EntryKind::SequenceOf(s) => match &s.terminator {
                Terminator::Count(e) | Terminator::Length(e) => e.referenced_entries(&mut refs),
                Terminator::EndMarker(marker) => refs.push(*marker),
            },
            EntryKind::Choice(_) | EntryKind::Recurse(_) => {}
        }

        for constraint in &entry.constraints {
            constraint.expr.referenced_entries(&mut refs);
        }

        for r in refs {
            params.inbound.entry(id).or_default().insert(r);
            params.outbound.entry(r).or_default().insert(id);
        }
    }

    params
}
