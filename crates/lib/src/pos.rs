//! Fractional position keys for ordering list children.
//!
//! A [`Position`] is an opaque string over a base-62 digit alphabet, totally
//! ordered by plain byte comparison. Generating a key after or between
//! existing keys never requires touching those keys, so dense concurrent
//! insertion never renumbers siblings. Repeated insertion at the same point
//! grows the key by at most one digit per exhausted gap (amortized growth).
//!
//! Generation is a pure, comparison-only operation: no coordination with
//! other nodes is needed. When two actors may generate the same bare key
//! concurrently, [`Position::with_actor`] appends a deterministic tie-break
//! suffix so the results still order consistently.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Digit alphabet for position strings, in ascending byte order.
///
/// Generated positions never *end* in the lowest digit (`0`), which keeps
/// room below every key for future `between` calls.
const DIGITS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// A fractional list position.
///
/// Positions compare lexicographically by byte, which is also how storage
/// drivers order sibling keys. The inner string is opaque to callers.
///
/// # Examples
///
/// ```
/// use livetree::pos::Position;
///
/// let first = Position::first();
/// let second = first.after();
/// let wedged = Position::between(&first, &second).unwrap();
///
/// assert!(first < wedged);
/// assert!(wedged < second);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(String);

impl Position {
    /// Returns the initial position for an empty list.
    ///
    /// Sorts after any key `between` could later produce below it and before
    /// any key produced by [`Position::after`] on it.
    pub fn first() -> Self {
        Position(ascii(vec![DIGITS[DIGITS.len() / 2]]))
    }

    /// Returns a position sorting strictly after `self`.
    ///
    /// Successive calls chained off prior results yield a strictly increasing
    /// sequence, and every generated key leaves room for later `between`
    /// insertions on both sides.
    pub fn after(&self) -> Self {
        let mut out = self.0.clone().into_bytes();
        if let Some(last) = out.last_mut() {
            let idx = digit_index(*last);
            if idx < DIGITS.len() - 1 {
                *last = DIGITS[idx + 1];
                return Position(ascii(out));
            }
        }
        // Last digit is already the maximum; extend instead of carrying.
        out.push(DIGITS[DIGITS.len() / 2]);
        Position(ascii(out))
    }

    /// Returns a position strictly between `lo` and `hi`, or `None` when
    /// `lo >= hi` or no key fits the gap.
    ///
    /// Neither input is ever modified; the result is always strictly ordered
    /// between the two.
    pub fn between(lo: &Position, hi: &Position) -> Option<Self> {
        if lo >= hi {
            return None;
        }
        // Foreign keys (via `From`) may end in the reserved lowest digit.
        // When `hi` is `lo` plus a run of them, the only keys below `hi` are
        // the shorter runs, and between "x" and "x0" there is nothing at all.
        if let Some(rest) = hi.0.strip_prefix(lo.0.as_str())
            && rest.bytes().all(|b| b == DIGITS[0])
        {
            if rest.len() == 1 {
                return None;
            }
            return Some(Position(format!("{}{}", lo.0, &rest[..rest.len() - 1])));
        }
        let mid = midpoint(lo.0.as_bytes(), Some(hi.0.as_bytes()));
        debug_assert!(mid.as_slice() > lo.0.as_bytes() && mid.as_slice() < hi.0.as_bytes());
        Some(Position(ascii(mid)))
    }

    /// Appends a deterministic actor suffix as a tie-break.
    ///
    /// Two actors generating the same bare position concurrently produce
    /// distinct, consistently ordered keys after suffixing. The suffix digits
    /// exclude `0` so the result never ends in the lowest digit.
    pub fn with_actor(&self, actor: u64) -> Self {
        let mut out = self.0.clone().into_bytes();
        let mut n = actor;
        loop {
            out.push(DIGITS[1 + (n % 61) as usize]);
            n /= 61;
            if n == 0 {
                break;
            }
        }
        Position(ascii(out))
    }

    /// The raw key string, as stored and compared by drivers.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Spec-shaped constructor: `make_position()` starts a list,
/// `make_position(Some(prev))` appends after `prev`.
pub fn make_position(after: Option<&Position>) -> Position {
    match after {
        Some(prev) => prev.after(),
        None => Position::first(),
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Position {
    fn from(s: &str) -> Self {
        Position(s.to_string())
    }
}

impl From<Position> for String {
    fn from(p: Position) -> String {
        p.0
    }
}

fn ascii(bytes: Vec<u8>) -> String {
    // The alphabet is pure ASCII.
    bytes.into_iter().map(char::from).collect()
}

fn digit_index(d: u8) -> usize {
    DIGITS.iter().position(|&c| c == d).unwrap_or(0)
}

/// Midpoint of two digit strings, `b = None` meaning "positive infinity".
///
/// Requires `a < b` when `b` is present. Adapted from the standard
/// fractional-indexing construction: recurse past the shared prefix, then
/// either split a gap of two or more digits or descend one level.
fn midpoint(a: &[u8], b: Option<&[u8]>) -> Vec<u8> {
    if let Some(bb) = b {
        let mut n = 0;
        while n < bb.len() && a.get(n).copied().unwrap_or(DIGITS[0]) == bb[n] {
            n += 1;
        }
        if n > 0 {
            let mut out = bb[..n].to_vec();
            out.extend(midpoint(a.get(n..).unwrap_or(&[]), Some(&bb[n..])));
            return out;
        }
    }
    let da = a.first().map(|&c| digit_index(c)).unwrap_or(0);
    let db = b
        .and_then(|bb| bb.first())
        .map(|&c| digit_index(c))
        .unwrap_or(DIGITS.len());
    if db - da > 1 {
        vec![DIGITS[(da + db) / 2]]
    } else if b.is_some_and(|bb| bb.len() > 1) {
        // Digits are adjacent but `b` continues, so `b`'s first digit alone
        // already sorts strictly between the two.
        vec![b.unwrap()[0]]
    } else {
        // Adjacent digits with nothing to split: keep `a`'s digit and open a
        // fresh level bounded only from below.
        let mut out = vec![DIGITS[da]];
        out.extend(midpoint(a.get(1..).unwrap_or(&[]), None));
        out
    }
}
