use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};

/// Structured metadata attached to a milestone commit. Supplied by the
/// caller; extraction from project files happens elsewhere.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MilestoneMetadata {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tempo_bpm: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate_hz: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl MilestoneMetadata {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    /// Trailer pairs rendered as `Key: value` lines under the message.
    pub fn to_pairs(&self) -> BTreeMap<String, String> {
        let mut pairs = BTreeMap::new();
        if let Some(bpm) = self.tempo_bpm {
            pairs.insert("BPM".to_string(), format_bpm(bpm));
        }
        if let Some(rate) = self.sample_rate_hz {
            pairs.insert("Sample-Rate".to_string(), format!("{rate} Hz"));
        }
        if let Some(key) = &self.key_signature {
            pairs.insert("Key".to_string(), key.clone());
        }
        if !self.tags.is_empty() {
            pairs.insert("Tags".to_string(), self.tags.join(", "));
        }
        pairs
    }
}

fn format_bpm(bpm: f32) -> String {
    if bpm.fract() == 0.0 {
        format!("{bpm:.0}")
    } else {
        format!("{bpm:.1}")
    }
}

/// Removes regenerable artifacts (render caches, peak files) before a
/// milestone commit. Returns the paths it removed.
pub trait ArtifactCleaner: Send + Sync + Debug {
    fn clean(&self, repo: &Path) -> std::io::Result<Vec<PathBuf>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_only_include_present_fields() {
        let meta = MilestoneMetadata {
            message: "Chorus vocals comped".into(),
            tempo_bpm: Some(128.0),
            sample_rate_hz: Some(48_000),
            key_signature: Some("A minor".into()),
            tags: vec!["vocals".into(), "v2".into()],
        };
        let pairs = meta.to_pairs();
        assert_eq!(pairs["BPM"], "128");
        assert_eq!(pairs["Sample-Rate"], "48000 Hz");
        assert_eq!(pairs["Key"], "A minor");
        assert_eq!(pairs["Tags"], "vocals, v2");

        assert!(MilestoneMetadata::new("plain").to_pairs().is_empty());
    }

    #[test]
    fn fractional_tempo_keeps_one_decimal() {
        let meta = MilestoneMetadata {
            tempo_bpm: Some(92.5),
            ..MilestoneMetadata::new("x")
        };
        assert_eq!(meta.to_pairs()["BPM"], "92.5");
    }
}
