//! Per-joint screw/backlash compensation table.
//!
//! Entries are kept sorted by nominal position and sentinelled with
//! ∓∞ at both ends, so every commanded position falls inside exactly
//! one segment and lookup never branches on table edges. Trims are
//! direction-dependent: the forward column applies while commanded
//! velocity is non-negative, the reverse column otherwise.

use std::fs;
use std::path::Path;

use crate::error::CommandReject;
use rmc_common::error::CommonError;

/// Most entries a table can carry (excluding sentinels).
pub const MAX_COMP_ENTRIES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq)]
struct CompEntry {
    nominal: f64,
    fwd_trim: f64,
    rev_trim: f64,
    fwd_slope: f64,
    rev_slope: f64,
}

impl CompEntry {
    const fn sentinel(nominal: f64) -> Self {
        Self {
            nominal,
            fwd_trim: 0.0,
            rev_trim: 0.0,
            fwd_slope: 0.0,
            rev_slope: 0.0,
        }
    }
}

/// Compensation file column meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompFileType {
    /// Columns are trims: `nominal fwd_trim rev_trim`.
    Trims = 0,
    /// Columns are measured positions: `nominal fwd_pos rev_pos`,
    /// trim = measured − nominal.
    Positions = 1,
}

impl CompFileType {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Trims),
            1 => Some(Self::Positions),
            _ => None,
        }
    }
}

/// The table. Starts empty (sentinels only), which compensates
/// everything to zero.
#[derive(Debug, Clone)]
pub struct CompTable {
    entries: Vec<CompEntry>,
}

impl Default for CompTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CompTable {
    pub fn new() -> Self {
        let mut entries = Vec::with_capacity(MAX_COMP_ENTRIES + 2);
        entries.push(CompEntry::sentinel(f64::NEG_INFINITY));
        entries.push(CompEntry::sentinel(f64::INFINITY));
        Self { entries }
    }

    /// Real (non-sentinel) entry count.
    pub fn len(&self) -> usize {
        self.entries.len() - 2
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append an entry. Nominals must arrive in strictly ascending
    /// order; out-of-order insertion is rejected.
    pub fn insert(
        &mut self,
        nominal: f64,
        fwd_trim: f64,
        rev_trim: f64,
    ) -> Result<(), CommandReject> {
        if self.len() >= MAX_COMP_ENTRIES {
            return Err(CommandReject::OutOfRange);
        }
        let last_real = self.entries[self.entries.len() - 2];
        if self.len() > 0 && nominal <= last_real.nominal {
            return Err(CommandReject::CompOutOfOrder);
        }
        let entry = CompEntry {
            nominal,
            fwd_trim,
            rev_trim,
            fwd_slope: 0.0,
            rev_slope: 0.0,
        };
        let end = self.entries.len() - 1;
        self.entries.insert(end, entry);
        self.recompute_slopes();
        Ok(())
    }

    fn recompute_slopes(&mut self) {
        // Slopes connect consecutive real entries; the segment past
        // the last real entry extends its trim flat, as does the
        // segment before the first.
        let n = self.entries.len();
        for i in 1..n - 2 {
            let next = self.entries[i + 1];
            let cur = &mut self.entries[i];
            if next.nominal.is_finite() && cur.nominal.is_finite() {
                let dx = next.nominal - cur.nominal;
                cur.fwd_slope = (next.fwd_trim - cur.fwd_trim) / dx;
                cur.rev_slope = (next.rev_trim - cur.rev_trim) / dx;
            } else {
                cur.fwd_slope = 0.0;
                cur.rev_slope = 0.0;
            }
        }
    }

    /// Trim for commanded position `pos` moving with velocity sign
    /// `forward`.
    pub fn lookup(&self, pos: f64, forward: bool) -> f64 {
        // Find the segment [e, e+1) with e.nominal <= pos. The
        // sentinels guarantee one exists.
        let mut idx = 0;
        for (i, e) in self.entries.iter().enumerate() {
            if e.nominal <= pos {
                idx = i;
            } else {
                break;
            }
        }
        let e = &self.entries[idx];
        let base = if e.nominal.is_finite() {
            pos - e.nominal
        } else {
            0.0
        };
        if forward {
            e.fwd_trim + base * e.fwd_slope
        } else {
            e.rev_trim + base * e.rev_slope
        }
    }

    /// Load a table from a compensation file, replacing any existing
    /// entries. Blank lines are skipped; a malformed line is an error.
    pub fn load(&mut self, path: &Path, file_type: CompFileType) -> Result<usize, CommonError> {
        let text = fs::read_to_string(path)?;
        let mut fresh = Self::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(a), Some(b), Some(c)) = (fields.next(), fields.next(), fields.next()) else {
                return Err(CommonError::Config(format!(
                    "{}:{}: expected 'nominal forward reverse'",
                    path.display(),
                    lineno + 1
                )));
            };
            let parse = |s: &str| -> Result<f64, CommonError> {
                s.parse().map_err(|_| {
                    CommonError::Config(format!(
                        "{}:{}: bad number '{s}'",
                        path.display(),
                        lineno + 1
                    ))
                })
            };
            let nominal = parse(a)?;
            let (fwd, rev) = match file_type {
                CompFileType::Trims => (parse(b)?, parse(c)?),
                CompFileType::Positions => (parse(b)? - nominal, parse(c)? - nominal),
            };
            fresh.insert(nominal, fwd, rev).map_err(|_| {
                CommonError::Config(format!(
                    "{}:{}: nominals must ascend",
                    path.display(),
                    lineno + 1
                ))
            })?;
        }
        let count = fresh.len();
        *self = fresh;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_table_compensates_zero() {
        let table = CompTable::new();
        assert_eq!(table.lookup(-1e9, true), 0.0);
        assert_eq!(table.lookup(0.0, false), 0.0);
        assert_eq!(table.lookup(1e9, true), 0.0);
    }

    #[test]
    fn interpolates_between_entries() {
        let mut table = CompTable::new();
        table.insert(0.0, 0.0, 0.0).unwrap();
        table.insert(10.0, 0.1, -0.1).unwrap();
        // Midpoint, forward and reverse.
        assert!((table.lookup(5.0, true) - 0.05).abs() < 1e-12);
        assert!((table.lookup(5.0, false) + 0.05).abs() < 1e-12);
        // On an entry exactly.
        assert_eq!(table.lookup(10.0, true), 0.1);
    }

    #[test]
    fn extends_flat_past_the_ends() {
        let mut table = CompTable::new();
        table.insert(0.0, 0.02, -0.02).unwrap();
        table.insert(10.0, 0.1, -0.1).unwrap();
        // Before the first entry: the −∞ sentinel segment, zero trim.
        assert_eq!(table.lookup(-5.0, true), 0.0);
        // Past the last: last entry's trim, flat.
        assert_eq!(table.lookup(50.0, true), 0.1);
        assert_eq!(table.lookup(50.0, false), -0.1);
    }

    #[test]
    fn rejects_out_of_order_nominals() {
        let mut table = CompTable::new();
        table.insert(5.0, 0.0, 0.0).unwrap();
        assert_eq!(
            table.insert(5.0, 0.1, 0.1).unwrap_err(),
            CommandReject::CompOutOfOrder
        );
        assert_eq!(
            table.insert(1.0, 0.1, 0.1).unwrap_err(),
            CommandReject::CompOutOfOrder
        );
        table.insert(6.0, 0.1, 0.1).unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn loads_trim_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0.0 0.00 0.00").unwrap();
        writeln!(file, "25.0 0.03 -0.01").unwrap();
        writeln!(file, "50.0 0.05 -0.02").unwrap();
        let mut table = CompTable::new();
        let n = table.load(file.path(), CompFileType::Trims).unwrap();
        assert_eq!(n, 3);
        assert!((table.lookup(37.5, true) - 0.04).abs() < 1e-12);
    }

    #[test]
    fn loads_position_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "10.0 10.02 9.98").unwrap();
        let mut table = CompTable::new();
        table.load(file.path(), CompFileType::Positions).unwrap();
        assert!((table.lookup(10.0, true) - 0.02).abs() < 1e-12);
        assert!((table.lookup(10.0, false) + 0.02).abs() < 1e-12);
    }

    #[test]
    fn bad_file_line_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0.0 0.0").unwrap();
        let mut table = CompTable::new();
        assert!(table.load(file.path(), CompFileType::Trims).is_err());
    }
}
