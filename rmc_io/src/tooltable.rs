//! Tool table file.
//!
//! ASCII, one tool per line, header line discarded. Two dialects:
//! the mill form `pocket id zoff diameter` (4 fields) and the lathe
//! form `pocket id zoff xoff diameter frontangle backangle
//! orientation` (8 fields). Pockets index a fixed-size array;
//! out-of-range pockets are a parse error.

use std::fs;
use std::io::Write;
use std::path::Path;

use rmc_common::error::CommonError;

/// Pockets addressable by the changer (pocket 0 is the spindle).
pub const MAX_POCKETS: usize = 56;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ToolEntry {
    /// Tool number (0 = empty pocket).
    pub id: u16,
    pub zoffset: f64,
    pub xoffset: f64,
    pub diameter: f64,
    pub frontangle: f64,
    pub backangle: f64,
    pub orientation: u8,
}

/// The in-memory table, indexed by pocket.
#[derive(Debug, Clone)]
pub struct ToolTable {
    pockets: [ToolEntry; MAX_POCKETS],
    /// Lathe-form file (8 fields) on the last load; preserved on save.
    lathe: bool,
}

impl Default for ToolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolTable {
    pub fn new() -> Self {
        Self {
            pockets: [ToolEntry::default(); MAX_POCKETS],
            lathe: false,
        }
    }

    pub fn entry(&self, pocket: usize) -> Option<&ToolEntry> {
        self.pockets.get(pocket)
    }

    pub fn entry_mut(&mut self, pocket: usize) -> Option<&mut ToolEntry> {
        self.pockets.get_mut(pocket)
    }

    /// Pocket currently holding tool `id`, if any.
    pub fn pocket_of(&self, id: u16) -> Option<usize> {
        if id == 0 {
            return None;
        }
        self.pockets.iter().position(|e| e.id == id)
    }

    /// Load from file, replacing the table. The first line is a
    /// header and is discarded.
    pub fn load(path: &Path) -> Result<Self, CommonError> {
        let text = fs::read_to_string(path)?;
        let mut table = Self::new();
        let mut lathe_seen = false;

        for (lineno, raw) in text.lines().enumerate().skip(1) {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            let bad = |what: &str| {
                CommonError::Config(format!("{}:{}: {what}", path.display(), lineno + 1))
            };
            let parse_f = |s: &str, what: &str| -> Result<f64, CommonError> {
                s.parse().map_err(|_| bad(&format!("bad {what} '{s}'")))
            };

            let entry;
            let pocket: usize;
            match fields.len() {
                4 => {
                    pocket = fields[0].parse().map_err(|_| bad("bad pocket"))?;
                    entry = ToolEntry {
                        id: fields[1].parse().map_err(|_| bad("bad tool id"))?,
                        zoffset: parse_f(fields[2], "z offset")?,
                        diameter: parse_f(fields[3], "diameter")?,
                        ..ToolEntry::default()
                    };
                }
                8 => {
                    lathe_seen = true;
                    pocket = fields[0].parse().map_err(|_| bad("bad pocket"))?;
                    entry = ToolEntry {
                        id: fields[1].parse().map_err(|_| bad("bad tool id"))?,
                        zoffset: parse_f(fields[2], "z offset")?,
                        xoffset: parse_f(fields[3], "x offset")?,
                        diameter: parse_f(fields[4], "diameter")?,
                        frontangle: parse_f(fields[5], "front angle")?,
                        backangle: parse_f(fields[6], "back angle")?,
                        orientation: fields[7].parse().map_err(|_| bad("bad orientation"))?,
                    };
                }
                n => return Err(bad(&format!("expected 4 or 8 fields, found {n}"))),
            }
            if pocket >= MAX_POCKETS {
                return Err(bad(&format!("pocket {pocket} out of range 0..{MAX_POCKETS}")));
            }
            table.pockets[pocket] = entry;
        }
        table.lathe = lathe_seen;
        Ok(table)
    }

    /// Write the table back in the dialect it was loaded in.
    pub fn save(&self, path: &Path) -> Result<(), CommonError> {
        let mut out = fs::File::create(path)?;
        if self.lathe {
            writeln!(
                out,
                "POC   FMS      LENGTH   XOFFSET  DIAMETER  FRONT BACK ORIENT"
            )?;
        } else {
            writeln!(out, "POC   FMS      LENGTH   DIAMETER")?;
        }
        for (pocket, e) in self.pockets.iter().enumerate() {
            if e.id == 0 {
                continue;
            }
            if self.lathe {
                writeln!(
                    out,
                    "{pocket}  {}  {:.6}  {:.6}  {:.6}  {:.1}  {:.1}  {}",
                    e.id, e.zoffset, e.xoffset, e.diameter, e.frontangle, e.backangle, e.orientation
                )?;
            } else {
                writeln!(out, "{pocket}  {}  {:.6}  {:.6}", e.id, e.zoffset, e.diameter)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_file(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "{content}").unwrap();
        f
    }

    #[test]
    fn mill_table_loads() {
        let f = write_file("POC FMS LENGTH DIAMETER\n1 11 1.5 0.25\n2 22 -0.5 0.125\n");
        let table = ToolTable::load(f.path()).unwrap();
        let t1 = table.entry(1).unwrap();
        assert_eq!(t1.id, 11);
        assert_eq!(t1.zoffset, 1.5);
        assert_eq!(t1.diameter, 0.25);
        assert_eq!(table.entry(2).unwrap().id, 22);
        assert_eq!(table.entry(3).unwrap().id, 0);
    }

    #[test]
    fn lathe_table_loads() {
        let f = write_file("POC FMS LEN X DIA FA BA OR\n3 7 0.1 0.2 0.5 93.0 62.0 6\n");
        let table = ToolTable::load(f.path()).unwrap();
        let t = table.entry(3).unwrap();
        assert_eq!(t.id, 7);
        assert_eq!(t.xoffset, 0.2);
        assert_eq!(t.frontangle, 93.0);
        assert_eq!(t.orientation, 6);
    }

    #[test]
    fn header_line_is_discarded() {
        // Header would be unparsable as data; load must succeed.
        let f = write_file("this is a header, not a tool\n1 5 0.0 0.0\n");
        let table = ToolTable::load(f.path()).unwrap();
        assert_eq!(table.entry(1).unwrap().id, 5);
    }

    #[test]
    fn wrong_field_count_is_an_error() {
        let f = write_file("HEADER\n1 5 0.0\n");
        assert!(ToolTable::load(f.path()).is_err());
    }

    #[test]
    fn out_of_range_pocket_is_an_error() {
        let f = write_file(&format!("HEADER\n{MAX_POCKETS} 5 0.0 0.0\n"));
        assert!(ToolTable::load(f.path()).is_err());
    }

    #[test]
    fn save_load_roundtrip() {
        let mut table = ToolTable::new();
        *table.entry_mut(4).unwrap() = ToolEntry {
            id: 40,
            zoffset: 2.0,
            diameter: 0.375,
            ..ToolEntry::default()
        };
        let f = tempfile::NamedTempFile::new().unwrap();
        table.save(f.path()).unwrap();
        let loaded = ToolTable::load(f.path()).unwrap();
        assert_eq!(loaded.entry(4).unwrap().id, 40);
        assert_eq!(loaded.entry(4).unwrap().zoffset, 2.0);
    }

    #[test]
    fn pocket_of_finds_tools() {
        let mut table = ToolTable::new();
        table.entry_mut(2).unwrap().id = 9;
        assert_eq!(table.pocket_of(9), Some(2));
        assert_eq!(table.pocket_of(1), None);
        assert_eq!(table.pocket_of(0), None);
    }
}
