// bitproto-core
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `expr` module implements the arithmetic expression engine (C3): pure evaluation over a
//! reference environment, inversion ("solving") for a single unknown, and interval range
//! analysis.

use std::collections::HashMap;

use crate::errors::{self, Result};
use crate::ir::EntryId;

/// An arithmetic expression over integer constants and entry references (§3).
///
/// A [`Reference`] is carried as an already-resolved [`EntryId`] rather than a textual dotted
/// path: path resolution (walking up to the common ancestor and back down, §4.3) is a
/// build-time concern handled once when the IR is assembled, not a per-evaluation cost.
#[derive(Debug, Clone)]
pub enum Expr {
    Const(i64),
    Ref(EntryId),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Mod(Box<Expr>, Box<Expr>),
}

impl Expr {
    // Smart constructors named after the operator they build, not an arithmetic operation on
    // `self`, so they don't implement `std::ops::Add` et al.
    #[allow(clippy::should_implement_trait)]
    pub fn add(a: Expr, b: Expr) -> Expr {
        Expr::Add(Box::new(a), Box::new(b))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn sub(a: Expr, b: Expr) -> Expr {
        Expr::Sub(Box::new(a), Box::new(b))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn mul(a: Expr, b: Expr) -> Expr {
        Expr::Mul(Box::new(a), Box::new(b))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn div(a: Expr, b: Expr) -> Expr {
        Expr::Div(Box::new(a), Box::new(b))
    }

    /// Returns the value of this expression if it is a bare constant, without needing an
    /// environment. Used by static validation (e.g. checking a `Field`'s declared width when it
    /// happens to not depend on any reference).
    pub fn as_const(&self) -> Option<i64> {
        match self {
            Expr::Const(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns true if `id` occurs anywhere within this expression.
    pub fn references(&self, id: EntryId) -> bool {
        match self {
            Expr::Const(_) => false,
            Expr::Ref(r) => *r == id,
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Div(a, b) | Expr::Mod(a, b) => {
                a.references(id) || b.references(id)
            }
        }
    }

    /// Collects every entry referenced by this expression, in evaluation order (duplicates
    /// included). Used by parameter analysis (C5) to determine an entry's inbound dependencies.
    pub fn referenced_entries(&self, out: &mut Vec<EntryId>) {
        match self {
            Expr::Const(_) => {}
            Expr::Ref(r) => out.push(*r),
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Div(a, b) | Expr::Mod(a, b) => {
                a.referenced_entries(out);
                b.referenced_entries(out);
            }
        }
    }
}

/// Maps entries to the integer value they published during the current decode or encode call.
/// Threaded through the recursive walk per §4.3/§4.4.
#[derive(Debug, Clone, Default)]
pub struct Env {
    values: HashMap<EntryId, i64>,
}

impl Env {
    pub fn new() -> Self {
        Env::default()
    }

    pub fn set(&mut self, id: EntryId, value: i64) {
        self.values.insert(id, value);
    }

    pub fn get(&self, id: EntryId) -> Option<i64> {
        self.values.get(&id).copied()
    }
}

/// Floor division towards negative infinity (§4.2), as opposed to Rust's (and C's) division
/// towards zero. With `round_up_on_remainder` set, a non-zero remainder rounds the quotient up
/// by one instead of down; used by the expression solver when an original field's value was
/// itself computed with rounding (e.g. `length_in_bytes = bits / 8`, rounded up).
pub fn divide_with_rounding(numerator: i64, denominator: i64, round_up_on_remainder: bool) -> i64 {
    let mut result = numerator / denominator;
    let remainder = numerator % denominator;
    if remainder != 0 && ((numerator < 0 && denominator > 0) || (numerator > 0 && denominator < 0)) {
        result -= 1;
    }
    if round_up_on_remainder && remainder != 0 {
        result += 1;
    }
    result
}

/// Evaluates `expr` in `env`, failing with [`errors::Error::MissingInput`] if a referenced entry
/// has not yet published a value.
pub fn eval(expr: &Expr, env: &Env, entry_name: &str) -> Result<i64> {
    match expr {
        Expr::Const(v) => Ok(*v),
        Expr::Ref(id) => match env.get(*id) {
            Some(v) => Ok(v),
            None => errors::missing_input(entry_name, format!("entry#{id}")),
        },
        Expr::Add(a, b) => Ok(eval(a, env, entry_name)? + eval(b, env, entry_name)?),
        Expr::Sub(a, b) => Ok(eval(a, env, entry_name)? - eval(b, env, entry_name)?),
        Expr::Mul(a, b) => Ok(eval(a, env, entry_name)? * eval(b, env, entry_name)?),
        Expr::Div(a, b) => {
            let (n, d) = (eval(a, env, entry_name)?, eval(b, env, entry_name)?);
            Ok(divide_with_rounding(n, d, false))
        }
        Expr::Mod(a, b) => {
            let (n, d) = (eval(a, env, entry_name)?, eval(b, env, entry_name)?);
            Ok(n - d * divide_with_rounding(n, d, false))
        }
    }
}

/// Inverts `expr = target` for the single unknown `unknown`, given that every other reference in
/// `expr` already has a value in `env` (§4.3, "Inversion").
///
/// The expression is first flattened into a sum of signed additive terms; exactly one term may
/// contain `unknown`. The other terms are evaluated and subtracted from `target` to form a
/// residual, which is then solved against the one remaining term by peeling off multiplicative
/// and divisive factors. A structure the solver cannot decompose (e.g. `unknown` under a `Mod`,
/// or split across more than one additive term) is [`errors::Error::Unsolvable`].
pub fn solve(expr: &Expr, unknown: EntryId, target: i64, env: &Env, entry_name: &str) -> Result<i64> {
    let mut terms = Vec::new();
    flatten_additive(expr, 1, &mut terms);

    let mut residual = target;
    let mut unknown_term: Option<(i64, &Expr)> = None;

    for (sign, term) in &terms {
        if term.references(unknown) {
            if unknown_term.is_some() {
                return errors::unsolvable(entry_name);
            }
            unknown_term = Some((*sign, term));
        } else {
            residual -= sign * eval(term, env, entry_name)?;
        }
    }

    let (sign, term) = match unknown_term {
        Some(t) => t,
        None => return errors::unsolvable(entry_name),
    };

    // Fold the additive term's sign into the residual before descending into the factor chain.
    let adjusted = if sign == -1 { -residual } else { residual };
    invert_factor(term, unknown, adjusted, env, entry_name)
}

/// Splits an additive/subtractive expression tree into `(sign, subexpr)` pairs, e.g.
/// `a - b + c` becomes `[(1, a), (-1, b), (1, c)]`.
fn flatten_additive<'e>(expr: &'e Expr, sign: i64, out: &mut Vec<(i64, &'e Expr)>) {
    match expr {
        Expr::Add(a, b) => {
            flatten_additive(a, sign, out);
            flatten_additive(b, sign, out);
        }
        Expr::Sub(a, b) => {
            flatten_additive(a, sign, out);
            flatten_additive(b, -sign, out);
        }
        other => out.push((sign, other)),
    }
}

/// Peels multiplicative/divisive factors off `term` until `unknown` is isolated, returning its
/// solved value.
fn invert_factor(term: &Expr, unknown: EntryId, target: i64, env: &Env, entry_name: &str) -> Result<i64> {
    match term {
        Expr::Ref(id) if *id == unknown => Ok(target),
        Expr::Mul(a, b) => {
            if a.references(unknown) && !b.references(unknown) {
                let k = eval(b, env, entry_name)?;
                if k == 0 || target % k != 0 {
                    return errors::unsolvable(entry_name);
                }
                invert_factor(a, unknown, target / k, env, entry_name)
            }
            else if b.references(unknown) && !a.references(unknown) {
                let k = eval(a, env, entry_name)?;
                if k == 0 || target % k != 0 {
                    return errors::unsolvable(entry_name);
                }
                invert_factor(b, unknown, target / k, env, entry_name)
            }
            else {
                errors::unsolvable(entry_name)
            }
        }
        Expr::Div(a, b) => {
            if a.references(unknown) && !b.references(unknown) {
                let k = eval(b, env, entry_name)?;
                invert_factor(a, unknown, target * k, env, entry_name)
            }
            else {
                errors::unsolvable(entry_name)
            }
        }
        Expr::Sub(a, b) => {
            if a.references(unknown) && !b.references(unknown) {
                let k = eval(b, env, entry_name)?;
                invert_factor(a, unknown, target + k, env, entry_name)
            }
            else if b.references(unknown) && !a.references(unknown) {
                let k = eval(a, env, entry_name)?;
                invert_factor(b, unknown, k - target, env, entry_name)
            }
            else {
                errors::unsolvable(entry_name)
            }
        }
        _ => errors::unsolvable(entry_name),
    }
}

/// A closed integer interval, used by range analysis to bound an expression's possible values
/// (§4.3). `min`/`max` are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub min: i64,
    pub max: i64,
}

impl Range {
    pub const fn exact(v: i64) -> Self {
        Range { min: v, max: v }
    }

    pub const fn unsigned(bits: u32) -> Self {
        if bits >= 63 {
            Range { min: 0, max: i64::MAX }
        }
        else {
            Range { min: 0, max: (1i64 << bits) - 1 }
        }
    }

    pub fn contains(&self, v: i64) -> bool {
        v >= self.min && v <= self.max
    }

    fn add(self, other: Range) -> Range {
        Range { min: self.min + other.min, max: self.max + other.max }
    }

    fn sub(self, other: Range) -> Range {
        Range { min: self.min - other.max, max: self.max - other.min }
    }

    fn mul(self, other: Range) -> Range {
        let candidates =
            [self.min * other.min, self.min * other.max, self.max * other.min, self.max * other.max];
        Range {
            min: *candidates.iter().min().unwrap(),
            max: *candidates.iter().max().unwrap(),
        }
    }
}

/// Computes an interval bound for `expr`, looking up referenced entries' ranges in `ranges`.
/// Unknown references default to the full `i64` range, which degrades gracefully to "no useful
/// bound" rather than failing.
pub fn range_of(expr: &Expr, ranges: &HashMap<EntryId, Range>) -> Range {
    match expr {
        Expr::Const(v) => Range::exact(*v),
        Expr::Ref(id) => ranges.get(id).copied().unwrap_or(Range { min: i64::MIN, max: i64::MAX }),
        Expr::Add(a, b) => range_of(a, ranges).add(range_of(b, ranges)),
        Expr::Sub(a, b) => range_of(a, ranges).sub(range_of(b, ranges)),
        Expr::Mul(a, b) => range_of(a, ranges).mul(range_of(b, ranges)),
        Expr::Div(a, b) => {
            // Division's range is only meaningful when the divisor doesn't straddle zero; fall
            // back to an unbounded range otherwise rather than divide by zero.
            let rb = range_of(b, ranges);
            if rb.min <= 0 && rb.max >= 0 {
                Range { min: i64::MIN, max: i64::MAX }
            }
            else {
                let ra = range_of(a, ranges);
                let candidates = [
                    divide_with_rounding(ra.min, rb.min, false),
                    divide_with_rounding(ra.min, rb.max, false),
                    divide_with_rounding(ra.max, rb.min, false),
                    divide_with_rounding(ra.max, rb.max, false),
                ];
                Range {
                    min: *candidates.iter().min().unwrap(),
                    max: *candidates.iter().max().unwrap(),
                }
            }
        }
        Expr::Mod(_, b) => {
            let rb = range_of(b, ranges);
            let bound = rb.min.unsigned_abs().max(rb.max.unsigned_abs()) as i64;
            Range { min: -(bound.saturating_sub(1)), max: bound.saturating_sub(1) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divide_with_rounding_floors_towards_negative_infinity() {
        assert_eq!(divide_with_rounding(7, 2, false), 3);
        assert_eq!(divide_with_rounding(-7, 2, false), -4);
        assert_eq!(divide_with_rounding(7, -2, false), -4);
        assert_eq!(divide_with_rounding(-7, -2, false), 3);
        assert_eq!(divide_with_rounding(7, 2, true), 4);
    }

    #[test]
    fn eval_arithmetic() {
        let env = Env::new();
        let e = Expr::add(Expr::Const(2), Expr::mul(Expr::Const(3), Expr::Const(4)));
        assert_eq!(eval(&e, &env, "test").unwrap(), 14);
    }

    #[test]
    fn solve_simple_affine() {
        // length = len * 8, solve len given length = 16.
        let len_id: EntryId = 0;
        let env = Env::new();
        let expr = Expr::mul(Expr::Ref(len_id), Expr::Const(8));
        assert_eq!(solve(&expr, len_id, 16, &env, "len").unwrap(), 2);
    }

    #[test]
    fn solve_with_known_sibling_term() {
        // total = header + payload, solve payload given total and header.
        let header_id: EntryId = 0;
        let payload_id: EntryId = 1;
        let mut env = Env::new();
        env.set(header_id, 4);
        let expr = Expr::add(Expr::Ref(header_id), Expr::Ref(payload_id));
        assert_eq!(solve(&expr, payload_id, 10, &env, "payload").unwrap(), 6);
    }

    #[test]
    fn solve_rejects_mod_of_unknown() {
        let x: EntryId = 0;
        let env = Env::new();
        let expr = Expr::Mod(Box::new(Expr::Ref(x)), Box::new(Expr::Const(8)));
        assert!(solve(&expr, x, 3, &env, "x").is_err());
    }

    #[test]
    fn range_analysis_bounds_unsigned_field_sum() {
        let a: EntryId = 0;
        let b: EntryId = 1;
        let mut ranges = HashMap::new();
        ranges.insert(a, Range::unsigned(4));
        ranges.insert(b, Range::unsigned(4));
        let expr = Expr::add(Expr::Ref(a), Expr::Ref(b));
        let r = range_of(&expr, &ranges);
        assert_eq!(r, Range { min: 0, max: 30 });
    }
}
