//! Foundational data types shared across the link.
//!
//! This module defines the named-vector representation used on both sides of
//! the wire, the fixed-precision text codec for parameter and result vectors,
//! the tolerance comparison that stands in for request identifiers, and the
//! single-item mailbox cell the protocol state machine hands experiments
//! through.
//!
//! # Matching tolerance
//!
//! The wire protocol carries no request identifiers; results are routed back
//! to pending requests by numeric closeness. [`all_close`] is deliberately
//! symmetric (relative tolerance checked against both operands, plus an
//! absolute floor) and treats NaN as equal to NaN, so a vector survives the
//! encode/decode round trip and still matches itself.

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, LinkResult};

/// Relative tolerance for request/result matching.
pub const MATCH_RTOL: f64 = 1e-8;
/// Absolute tolerance for request/result matching.
pub const MATCH_ATOL: f64 = 1e-8;
/// Digits after the decimal point in wire text vectors.
pub const WIRE_DECIMALS: usize = 12;

// =============================================================================
// Header
// =============================================================================

/// Ordered column names for a parameter or result vector.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header(Vec<String>);

impl Header {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Header(names.into_iter().map(Into::into).collect())
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Index of a column by name, if present.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|n| n == name)
    }

    /// Parses a tab-separated header line. An empty line decodes to a single
    /// empty column name, mirroring the wire behavior of splitting "".
    pub fn from_wire(text: &str) -> Self {
        Header(text.split('\t').map(str::to_string).collect())
    }

    /// Encodes as a tab-separated header line.
    pub fn to_wire(&self) -> String {
        self.0.join("\t")
    }
}

// =============================================================================
// Series
// =============================================================================

/// A named vector of `f64` values: the in-memory form of one parameter or
/// result set, in either learner or sequencer space.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Series {
    header: Header,
    values: Vec<f64>,
}

impl Series {
    /// Builds a series, checking that values and columns line up.
    pub fn new(header: Header, values: Vec<f64>) -> LinkResult<Self> {
        if header.len() != values.len() {
            return Err(LinkError::LengthMismatch(values.len(), header.len()));
        }
        Ok(Series { header, values })
    }

    /// Convenience constructor from `(name, value)` pairs.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let (names, values): (Vec<String>, Vec<f64>) =
            pairs.into_iter().map(|(n, v)| (n.into(), v)).unzip();
        Series {
            header: Header(names),
            values,
        }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.header.position(name).map(|i| self.values[i])
    }

    pub fn set(&mut self, name: &str, value: f64) -> bool {
        match self.header.position(name) {
            Some(i) => {
                self.values[i] = value;
                true
            }
            None => false,
        }
    }

    /// Copies this series and replaces every column that also appears in
    /// `partial` with the partial's value. Columns unique to `partial` are
    /// dropped; columns unique to `self` carry forward unchanged.
    pub fn overlay(&self, partial: &Series) -> Series {
        let mut merged = self.clone();
        for (name, value) in partial.header.names().iter().zip(&partial.values) {
            merged.set(name, *value);
        }
        merged
    }

    /// Selects the named columns, in the target header's order.
    pub fn project(&self, header: &Header) -> LinkResult<Series> {
        let values = header
            .names()
            .iter()
            .map(|name| {
                self.get(name)
                    .ok_or_else(|| LinkError::MissingColumn(name.clone()))
            })
            .collect::<LinkResult<Vec<f64>>>()?;
        Ok(Series {
            header: header.clone(),
            values,
        })
    }

    /// Returns a copy with one extra column prepended.
    pub fn with_prefixed(&self, name: &str, value: f64) -> Series {
        let mut names = Vec::with_capacity(self.len() + 1);
        names.push(name.to_string());
        names.extend(self.header.names().iter().cloned());
        let mut values = Vec::with_capacity(self.len() + 1);
        values.push(value);
        values.extend(&self.values);
        Series {
            header: Header(names),
            values,
        }
    }

    /// Encodes the values as fixed-precision tab-separated wire text.
    pub fn to_wire(&self) -> String {
        encode_values(&self.values)
    }

    /// Decodes wire text against a known header.
    pub fn from_wire(header: Header, text: &str) -> LinkResult<Series> {
        Series::new(header, decode_values(text))
    }

    /// Tolerance comparison of the value vectors (headers not consulted).
    pub fn all_close(&self, other: &[f64]) -> bool {
        all_close(&self.values, other)
    }
}

/// Encodes a raw value vector as fixed-precision tab-separated text.
pub fn encode_values(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| format!("{:.*}", WIRE_DECIMALS, v))
        .collect::<Vec<_>>()
        .join("\t")
}

/// Decodes tab-separated text into values; unparsable entries become NaN.
pub fn decode_values(text: &str) -> Vec<f64> {
    text.split('\t')
        .map(|entry| entry.trim().parse::<f64>().unwrap_or(f64::NAN))
        .collect()
}

// =============================================================================
// Tolerance comparison
// =============================================================================

fn close(x: f64, y: f64, rtol: f64, atol: f64) -> bool {
    if x.is_nan() && y.is_nan() {
        return true;
    }
    (x - y).abs() <= atol + rtol * y.abs()
}

/// Symmetric elementwise closeness of two vectors, NaN equal to NaN.
///
/// Both relative checks must pass (so the comparison does not depend on
/// operand order) and the absolute check bounds the difference near zero.
pub fn all_close(a: &[f64], b: &[f64]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(&x, &y)| {
            close(x, y, MATCH_RTOL, 0.0)
                && close(y, x, MATCH_RTOL, 0.0)
                && close(x, y, 0.0, MATCH_ATOL)
        })
}

// =============================================================================
// Mailbox slot
// =============================================================================

/// Single-item cell with an unread flag, used to pass one pending experiment
/// between the protocol state machine and its peer.
///
/// Storing over an unread item replaces it without complaint: the overwritten
/// item is an undetected loss, not an error. Owners are expected to check
/// [`Slot::is_unread`] before storing.
#[derive(Clone, Debug)]
pub struct Slot<T> {
    value: T,
    unread: bool,
}

impl<T> Slot<T> {
    pub fn new(initial: T) -> Self {
        Slot {
            value: initial,
            unread: false,
        }
    }

    pub fn store(&mut self, value: T) {
        self.value = value;
        self.unread = true;
    }

    /// Reads without consuming the unread flag.
    pub fn peek(&self) -> &T {
        &self.value
    }

    /// Reads and clears the unread flag.
    pub fn take(&mut self) -> &T {
        self.unread = false;
        &self.value
    }

    pub fn is_unread(&self) -> bool {
        self.unread
    }
}
