//! Action label map parser.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use crate::{Error, Result};

/// Lookup table compacting category-based action ids into sequential ids.
///
/// Label map files list one action per line as `<id> <name>` or
/// `<id>: <name>`:
/// ```text
/// 1: normal_walk
/// 7: multiple_items
/// 12: slow_walk
/// ```
/// Original ids are sorted and renumbered from 0, so the example maps
/// `1 -> 0`, `7 -> 1`, `12 -> 2`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelMap {
    to_compact: BTreeMap<u32, u32>,
    names: BTreeMap<u32, String>,
}

impl LabelMap {
    /// Build a map from `(original_id, name)` pairs.
    pub fn from_entries<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (u32, S)>,
        S: Into<String>,
    {
        let mut by_original: BTreeMap<u32, String> = BTreeMap::new();
        for (id, name) in entries {
            if by_original.insert(id, name.into()).is_some() {
                return Err(Error::LabelMap(format!("duplicate label id {}", id)));
            }
        }

        let mut map = LabelMap::default();
        for (compact, (original, name)) in by_original.into_iter().enumerate() {
            let compact = compact as u32;
            map.to_compact.insert(original, compact);
            map.names.insert(compact, name);
        }
        Ok(map)
    }

    /// Parse label map text.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut entries = Vec::new();
        for (line_no, line) in BufReader::new(reader).lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (id, name) = match line.split_once(':') {
                Some((id, name)) => (id, name),
                None => line.split_once(char::is_whitespace).ok_or_else(|| {
                    Error::LabelMap(format!("line {}: expected '<id> <name>'", line_no + 1))
                })?,
            };
            let id: u32 = id.trim().parse().map_err(|e| {
                Error::LabelMap(format!(
                    "line {}: label id '{}' is not an integer: {}",
                    line_no + 1,
                    id.trim(),
                    e
                ))
            })?;
            entries.push((id, name.trim().to_string()));
        }

        if entries.is_empty() {
            return Err(Error::LabelMap("label map contains no entries".to_string()));
        }
        Self::from_entries(entries)
    }

    /// Read a label map file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path).map_err(|e| {
            Error::IoError(std::io::Error::new(
                e.kind(),
                format!(
                    "failed to open label map '{}': {}",
                    path.as_ref().display(),
                    e
                ),
            ))
        })?;
        Self::from_reader(file)
    }

    /// Compact id for an original action id, if the action is known.
    pub fn remap(&self, original: u32) -> Option<u32> {
        self.to_compact.get(&original).copied()
    }

    /// Name of a compact id.
    pub fn name(&self, compact: u32) -> Option<&str> {
        self.names.get(&compact).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.to_compact.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_compact.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_compacts_sorted_ids() {
        let text = "12: slow_walk\n1: normal_walk\n7: multiple_items\n";
        let map = LabelMap::from_reader(text.as_bytes()).unwrap();

        assert_eq!(map.len(), 3);
        assert_eq!(map.remap(1), Some(0));
        assert_eq!(map.remap(7), Some(1));
        assert_eq!(map.remap(12), Some(2));
        assert_eq!(map.remap(2), None);
        assert_eq!(map.name(2), Some("slow_walk"));
    }

    #[test]
    fn test_space_separated_lines() {
        let text = "18 talking_phone\n\n25 listening_music\n";
        let map = LabelMap::from_reader(text.as_bytes()).unwrap();
        assert_eq!(map.remap(18), Some(0));
        assert_eq!(map.name(1), Some("listening_music"));
    }

    #[test]
    fn test_malformed_line() {
        assert!(LabelMap::from_reader("walk: 3\n".as_bytes()).is_err());
        assert!(LabelMap::from_reader("justaword\n".as_bytes()).is_err());
        assert!(LabelMap::from_reader("".as_bytes()).is_err());
    }

    #[test]
    fn test_duplicate_id() {
        assert!(LabelMap::from_reader("1: a\n1: b\n".as_bytes()).is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "32: group_walking").unwrap();
        writeln!(file, "39: empty_hands").unwrap();

        let map = LabelMap::from_file(file.path()).unwrap();
        assert_eq!(map.remap(39), Some(1));
        assert!(LabelMap::from_file("/nonexistent/label_map.txt").is_err());
    }
}
