//! G-code persistent parameter file.
//!
//! Flat ASCII `index value` pairs, one per line. Read once at init,
//! written back on clean shutdown. The well-known index ranges:
//! 5161–5169 the G28 home, 5181–5189 the G30 home, 5211–5219 the G92
//! offset, and 5221–5390 the nine work coordinate systems in groups
//! of twenty (G54 at 5221).

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::CommonError;
use crate::pose::{Pose, MAX_JOINTS};

pub const G28_BASE: u32 = 5161;
pub const G30_BASE: u32 = 5181;
pub const G92_BASE: u32 = 5211;
/// G54 pose base; systems step by 20 (G55 at 5241, … G59.3 at 5381).
pub const COORD_SYSTEM_BASE: u32 = 5221;
pub const COORD_SYSTEM_STRIDE: u32 = 20;
pub const COORD_SYSTEM_COUNT: u32 = 9;

/// In-memory parameter store.
#[derive(Debug, Clone, Default)]
pub struct ParamFile {
    values: BTreeMap<u32, f64>,
}

impl ParamFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from disk. A missing file is an empty store, not an error;
    /// a malformed line is.
    pub fn load(path: &Path) -> Result<Self, CommonError> {
        let mut values = BTreeMap::new();
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self { values });
            }
            Err(e) => return Err(CommonError::Io(e)),
        };
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(idx), Some(val)) = (fields.next(), fields.next()) else {
                return Err(CommonError::Config(format!(
                    "{}:{}: expected 'index value'",
                    path.display(),
                    lineno + 1
                )));
            };
            let idx: u32 = idx.parse().map_err(|_| {
                CommonError::Config(format!(
                    "{}:{}: bad parameter index '{idx}'",
                    path.display(),
                    lineno + 1
                ))
            })?;
            let val: f64 = val.parse().map_err(|_| {
                CommonError::Config(format!(
                    "{}:{}: bad parameter value '{val}'",
                    path.display(),
                    lineno + 1
                ))
            })?;
            values.insert(idx, val);
        }
        Ok(Self { values })
    }

    /// Write all parameters back, sorted by index.
    pub fn save(&self, path: &Path) -> Result<(), CommonError> {
        let mut out = fs::File::create(path)?;
        for (idx, val) in &self.values {
            writeln!(out, "{idx}\t{val:.6}")?;
        }
        Ok(())
    }

    #[inline]
    pub fn get(&self, index: u32) -> f64 {
        self.values.get(&index).copied().unwrap_or(0.0)
    }

    #[inline]
    pub fn set(&mut self, index: u32, value: f64) {
        self.values.insert(index, value);
    }

    /// Read nine consecutive parameters as a pose.
    pub fn pose_at(&self, base: u32) -> Pose {
        let mut p = Pose::ZERO;
        for i in 0..MAX_JOINTS as u32 {
            p.set(i as usize, self.get(base + i));
        }
        p
    }

    /// Store a pose into nine consecutive parameters.
    pub fn set_pose_at(&mut self, base: u32, pose: &Pose) {
        for i in 0..MAX_JOINTS as u32 {
            self.set(base + i, pose.get(i as usize));
        }
    }

    pub fn g28_home(&self) -> Pose {
        self.pose_at(G28_BASE)
    }

    pub fn g30_home(&self) -> Pose {
        self.pose_at(G30_BASE)
    }

    pub fn g92_offset(&self) -> Pose {
        self.pose_at(G92_BASE)
    }

    /// Work coordinate system origin, `system` in 0..9 (0 = G54).
    pub fn coord_system(&self, system: u32) -> Option<Pose> {
        if system >= COORD_SYSTEM_COUNT {
            return None;
        }
        Some(self.pose_at(COORD_SYSTEM_BASE + system * COORD_SYSTEM_STRIDE))
    }

    pub fn set_coord_system(&mut self, system: u32, pose: &Pose) -> bool {
        if system >= COORD_SYSTEM_COUNT {
            return false;
        }
        self.set_pose_at(COORD_SYSTEM_BASE + system * COORD_SYSTEM_STRIDE, pose);
        true
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_save_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rmc.var");

        let mut params = ParamFile::new();
        params.set(5161, 1.5);
        params.set(5162, -2.25);
        params.set(5220, 1.0);
        params.save(&path).unwrap();

        let loaded = ParamFile::load(&path).unwrap();
        assert_eq!(loaded.get(5161), 1.5);
        assert_eq!(loaded.get(5162), -2.25);
        assert_eq!(loaded.get(5163), 0.0);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let params = ParamFile::load(&dir.path().join("nope.var")).unwrap();
        assert!(params.is_empty());
    }

    #[test]
    fn malformed_line_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.var");
        std::fs::write(&path, "5161 1.0\nnot-a-param\n").unwrap();
        assert!(ParamFile::load(&path).is_err());
    }

    #[test]
    fn pose_ranges() {
        let mut params = ParamFile::new();
        let home = Pose {
            x: 10.0,
            z: -5.0,
            ..Pose::ZERO
        };
        params.set_pose_at(G28_BASE, &home);
        assert_eq!(params.g28_home(), home);
        assert_eq!(params.g30_home(), Pose::ZERO);
    }

    #[test]
    fn coord_systems_step_by_twenty() {
        let mut params = ParamFile::new();
        let g55 = Pose {
            y: 7.0,
            ..Pose::ZERO
        };
        assert!(params.set_coord_system(1, &g55));
        assert_eq!(params.get(COORD_SYSTEM_BASE + COORD_SYSTEM_STRIDE + 1), 7.0);
        assert_eq!(params.coord_system(1).unwrap(), g55);
        assert!(params.coord_system(9).is_none());
        assert!(!params.set_coord_system(9, &g55));
    }
}
