// bitproto-core
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `errors` module defines the error taxonomy shared by the decoder and encoder.

use std::fmt;

use thiserror::Error;

use crate::ir::ConstraintOp;

/// A bit position at which a decode or encode operation failed, expressed as an offset from the
/// start of the top-level call in bits. Used for diagnostic reporting only; it has no effect on
/// control flow.
pub type BitPos = u64;

/// `Error` enumerates every way a decode or encode call can fail.
///
/// Every variant carries the name of the entry that raised it plus whatever positional
/// information is useful for a caller building a diagnostic message. The core never attempts to
/// recover from any of these except via the `Choice` dispatcher (see [`crate::decode`]), which
/// swallows a failed alternative and tries the next one on a stream snapshot.
#[derive(Error, Debug)]
pub enum Error {
    /// The stream was exhausted while reading a field.
    #[error("{entry}: end of data at bit {pos}")]
    EndOfData { entry: String, pos: BitPos },

    /// A sized `Sequence` or `Field` did not consume exactly its declared length.
    #[error("{entry}: did not consume all of its {length}-bit allocation ({consumed} bits used)")]
    UnderRun { entry: String, length: u64, consumed: u64 },

    /// A constraint on an entry's value was violated.
    #[error("{entry}: constraint `{op}` failed")]
    ConstraintFailed { entry: String, op: ConstraintOp },

    /// Every alternative of a `Choice` failed to decode.
    #[error("{entry}: no alternative matched ({attempts} tried)")]
    NoChoiceMatched { entry: String, attempts: usize },

    /// An end-marked `SequenceOf` ran out of data before the marker was set.
    #[error("{entry}: repetition ended without its terminator")]
    UnterminatedRepetition { entry: String },

    /// A `Float` field had a length outside `{32, 64}`, or a `Text`/`Hex` field had a
    /// non-byte-aligned length.
    #[error("{entry}: invalid format ({reason})")]
    InvalidFormat { entry: String, reason: &'static str },

    /// An encode value did not fit in its declared bit width.
    #[error("{entry}: value does not fit in {width} bits")]
    ValueTooWide { entry: String, width: u32 },

    /// Expression inversion left a non-zero residual.
    #[error("{entry}: expression is not solvable for its free variable(s)")]
    Unsolvable { entry: String },

    /// The encoder needed a referenced value the caller did not supply and could not derive one.
    #[error("{entry}: missing required input `{reference}`")]
    MissingInput { entry: String, reference: String },

    /// The in-memory protocol IR itself is invalid (caught before any bytes are read).
    #[error("invalid protocol: {0}")]
    InvalidProtocol(&'static str),

    /// The recursive walk went deeper than its configured limit, most likely because a `Recurse`
    /// entry forms a cycle with no terminating condition.
    #[error("{entry}: recursion limit of {limit} exceeded")]
    RecursionLimitExceeded { entry: String, limit: usize },
}

impl Error {
    /// The name of the entry that raised this error, if any.
    pub fn entry(&self) -> Option<&str> {
        match self {
            Error::EndOfData { entry, .. }
            | Error::UnderRun { entry, .. }
            | Error::ConstraintFailed { entry, .. }
            | Error::NoChoiceMatched { entry, .. }
            | Error::UnterminatedRepetition { entry }
            | Error::InvalidFormat { entry, .. }
            | Error::ValueTooWide { entry, .. }
            | Error::Unsolvable { entry }
            | Error::MissingInput { entry, .. }
            | Error::RecursionLimitExceeded { entry, .. } => Some(entry),
            Error::InvalidProtocol(_) => None,
        }
    }
}

impl fmt::Display for ConstraintOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConstraintOp::Eq => "=",
            ConstraintOp::Ne => "!=",
            ConstraintOp::Lt => "<",
            ConstraintOp::Le => "<=",
            ConstraintOp::Gt => ">",
            ConstraintOp::Ge => ">=",
        };
        f.write_str(s)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Convenience function to raise [`Error::EndOfData`].
pub fn end_of_data<T>(entry: impl Into<String>, pos: BitPos) -> Result<T> {
    Err(Error::EndOfData { entry: entry.into(), pos })
}

/// Convenience function to raise [`Error::UnderRun`].
pub fn under_run<T>(entry: impl Into<String>, length: u64, consumed: u64) -> Result<T> {
    Err(Error::UnderRun { entry: entry.into(), length, consumed })
}

/// Convenience function to raise [`Error::ConstraintFailed`].
pub fn constraint_failed<T>(entry: impl Into<String>, op: ConstraintOp) -> Result<T> {
    Err(Error::ConstraintFailed { entry: entry.into(), op })
}

/// Convenience function to raise [`Error::NoChoiceMatched`].
pub fn no_choice_matched<T>(entry: impl Into<String>, attempts: usize) -> Result<T> {
    Err(Error::NoChoiceMatched { entry: entry.into(), attempts })
}

/// Convenience function to raise [`Error::UnterminatedRepetition`].
pub fn unterminated_repetition<T>(entry: impl Into<String>) -> Result<T> {
    Err(Error::UnterminatedRepetition { entry: entry.into() })
}

/// Convenience function to raise [`Error::InvalidFormat`].
pub fn invalid_format<T>(entry: impl Into<String>, reason: &'static str) -> Result<T> {
    Err(Error::InvalidFormat { entry: entry.into(), reason })
}

/// Convenience function to raise [`Error::ValueTooWide`].
pub fn value_too_wide<T>(entry: impl Into<String>, width: u32) -> Result<T> {
    Err(Error::ValueTooWide { entry: entry.into(), width })
}

/// Convenience function to raise [`Error::Unsolvable`].
pub fn unsolvable<T>(entry: impl Into<String>) -> Result<T> {
    Err(Error::Unsolvable { entry: entry.into() })
}

/// Convenience function to raise [`Error::MissingInput`].
pub fn missing_input<T>(entry: impl Into<String>, reference: impl Into<String>) -> Result<T> {
    Err(Error::MissingInput { entry: entry.into(), reference: reference.into() })
}

/// Convenience function to raise [`Error::InvalidProtocol`].
pub fn invalid_protocol<T>(reason: &'static str) -> Result<T> {
    Err(Error::InvalidProtocol(reason))
}

/// Convenience function to raise [`Error::RecursionLimitExceeded`].
pub fn recursion_limit_exceeded<T>(entry: impl Into<String>, limit: usize) -> Result<T> {
    Err(Error::RecursionLimitExceeded { entry: entry.into(), limit })
}
