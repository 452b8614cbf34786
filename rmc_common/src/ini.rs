//! Minimal INI reader for the startup configuration.
//!
//! The format is the classic machine-config dialect: `[SECTION]`
//! headers, `KEY = VALUE` entries, `#` and `;` comments, values taken
//! verbatim to end of line. Sections may repeat; later entries shadow
//! earlier ones on lookup.

use std::fs;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IniError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: std::string::String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: malformed entry (expected KEY = VALUE)")]
    Malformed {
        path: std::string::String,
        line: usize,
    },
}

/// Parsed INI file with ordered sections.
#[derive(Debug, Clone, Default)]
pub struct IniFile {
    path: String,
    sections: Vec<(String, Vec<(String, String)>)>,
}

impl IniFile {
    /// Read and parse an INI file.
    pub fn load(path: &Path) -> Result<Self, IniError> {
        let text = fs::read_to_string(path).map_err(|source| IniError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&path.display().to_string(), &text)
    }

    /// Parse from text, `origin` only used for error messages.
    pub fn parse(origin: &str, text: &str) -> Result<Self, IniError> {
        let mut sections: Vec<(String, Vec<(String, String)>)> = Vec::new();

        for (lineno, raw) in text.lines().enumerate() {
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }
            if let Some(name) = line.strip_prefix('[') {
                let name = name
                    .strip_suffix(']')
                    .ok_or(IniError::Malformed {
                        path: origin.to_string(),
                        line: lineno + 1,
                    })?
                    .trim();
                sections.push((name.to_string(), Vec::new()));
                continue;
            }
            let (key, value) = line.split_once('=').ok_or(IniError::Malformed {
                path: origin.to_string(),
                line: lineno + 1,
            })?;
            let Some((_, entries)) = sections.last_mut() else {
                // Entry before any section header.
                return Err(IniError::Malformed {
                    path: origin.to_string(),
                    line: lineno + 1,
                });
            };
            entries.push((key.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            path: origin.to_string(),
            sections,
        })
    }

    /// Last value of `key` in `section`, if present.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .iter()
            .filter(|(name, _)| name == section)
            .flat_map(|(_, entries)| entries.iter())
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .next_back()
    }

    /// Typed lookup with a default for missing keys.
    pub fn get_or<T: std::str::FromStr>(&self, section: &str, key: &str, default: T) -> T {
        self.get(section, key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Typed lookup; `None` when missing or unparsable.
    pub fn get_parsed<T: std::str::FromStr>(&self, section: &str, key: &str) -> Option<T> {
        self.get(section, key).and_then(|v| v.parse().ok())
    }

    /// Whether a section exists at all.
    pub fn has_section(&self, section: &str) -> bool {
        self.sections.iter().any(|(name, _)| name == section)
    }

    pub fn origin(&self) -> &str {
        &self.path
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find(['#', ';']) {
        Some(pos) => &line[..pos],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# machine config
[TRAJ]
AXES = 3
MAX_VELOCITY = 30.0   ; units/s

[AXIS_0]
TYPE = LINEAR
MAX_VELOCITY = 10
MAX_VELOCITY = 12     # later entry shadows

[AXIS_1]
TYPE = ANGULAR
"#;

    #[test]
    fn parses_sections_and_keys() {
        let ini = IniFile::parse("test.ini", SAMPLE).unwrap();
        assert_eq!(ini.get("TRAJ", "AXES"), Some("3"));
        assert_eq!(ini.get("AXIS_1", "TYPE"), Some("ANGULAR"));
        assert!(ini.has_section("AXIS_0"));
        assert!(!ini.has_section("AXIS_7"));
    }

    #[test]
    fn comments_are_stripped() {
        let ini = IniFile::parse("test.ini", SAMPLE).unwrap();
        assert_eq!(ini.get("TRAJ", "MAX_VELOCITY"), Some("30.0"));
    }

    #[test]
    fn later_entry_shadows() {
        let ini = IniFile::parse("test.ini", SAMPLE).unwrap();
        assert_eq!(ini.get_or("AXIS_0", "MAX_VELOCITY", 0.0), 12.0);
    }

    #[test]
    fn typed_lookup_defaults() {
        let ini = IniFile::parse("test.ini", SAMPLE).unwrap();
        assert_eq!(ini.get_or("TRAJ", "AXES", 1u8), 3);
        assert_eq!(ini.get_or("TRAJ", "MISSING", 7i32), 7);
        assert!(ini.get_parsed::<f64>("AXIS_1", "TYPE").is_none());
    }

    #[test]
    fn entry_before_section_is_rejected() {
        assert!(IniFile::parse("x.ini", "KEY = VALUE\n").is_err());
    }

    #[test]
    fn unterminated_section_is_rejected() {
        assert!(IniFile::parse("x.ini", "[TRAJ\nAXES = 3\n").is_err());
    }
}
