use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{DedupeError, Result};
use crate::models::Record;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledPair {
    pub left: Record,
    pub right: Record,
}

/// Labelled example pairs. Read once before training, rewritten whole after.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingSet {
    #[serde(default, rename = "match")]
    pub matches: Vec<LabeledPair>,
    #[serde(default)]
    pub distinct: Vec<LabeledPair>,
}

impl TrainingSet {
    pub fn is_empty(&self) -> bool {
        self.matches.is_empty() && self.distinct.is_empty()
    }

    pub fn len(&self) -> usize {
        self.matches.len() + self.distinct.len()
    }
}

pub fn load(path: &Path) -> Result<TrainingSet> {
    if !path.exists() {
        return Err(DedupeError::MissingArtifact(path.to_path_buf()));
    }
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Loads the artifact, falling back to an empty label set when it does not
/// exist yet.
pub fn load_or_empty(path: &Path) -> Result<TrainingSet> {
    match load(path) {
        Ok(set) => {
            log::debug!("Loaded {} labelled pairs from {}", set.len(), path.display());
            Ok(set)
        }
        Err(DedupeError::MissingArtifact(p)) => {
            log::warn!("No training file at {}; starting with no labels", p.display());
            Ok(TrainingSet::default())
        }
        Err(e) => Err(e),
    }
}

/// Writes the whole artifact atomically: tmp file then rename.
pub fn save(path: &Path, set: &TrainingSet) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let body = serde_json::to_string_pretty(set)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    fs::write(&tmp, body.as_bytes())?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(a: &str, b: &str) -> LabeledPair {
        LabeledPair {
            left: Record::new(a, vec![Some("acme".into()), None]),
            right: Record::new(b, vec![Some("acme inc".into()), Some("02139".into())]),
        }
    }

    #[test]
    fn missing_file_is_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("training.json");
        let err = load(&path).unwrap_err();
        assert!(err.is_recoverable());
        assert!(load_or_empty(&path).unwrap().is_empty());
    }

    #[test]
    fn round_trip_reproduces_labels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("training.json");
        let set = TrainingSet {
            matches: vec![pair("1", "2")],
            distinct: vec![pair("3", "4"), pair("5", "6")],
        };
        save(&path, &set).unwrap();
        assert_eq!(load(&path).unwrap(), set);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn overwrite_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.json");
        save(
            &path,
            &TrainingSet {
                matches: vec![pair("1", "2")],
                distinct: vec![],
            },
        )
        .unwrap();
        save(&path, &TrainingSet::default()).unwrap();
        assert!(load(&path).unwrap().is_empty());
    }

    #[test]
    fn corrupt_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.json");
        fs::write(&path, "{not json").unwrap();
        let err = load_or_empty(&path).unwrap_err();
        assert!(matches!(err, DedupeError::Artifact(_)));
    }
}
