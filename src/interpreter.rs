//! Turns raw per-class scores into a labeled, confidence-scored decision.

use crate::error::{Result, ScanError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Scores within this distance of 1.0 are treated as an existing distribution.
const DISTRIBUTION_TOLERANCE: f32 = 1e-6;

/// Confidence above which disposal advice is stated firmly.
const HIGH_CONFIDENCE: f32 = 0.7;

/// Waste category. Declaration order is the backend score order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WasteLabel {
    Biodegradable,
    NonBiodegradable,
    Toxic,
}

/// The fixed, ordered label set every backend must score against.
pub const LABEL_SET: [WasteLabel; 3] = [
    WasteLabel::Biodegradable,
    WasteLabel::NonBiodegradable,
    WasteLabel::Toxic,
];

impl WasteLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            WasteLabel::Biodegradable => "biodegradable",
            WasteLabel::NonBiodegradable => "non_biodegradable",
            WasteLabel::Toxic => "toxic",
        }
    }

    /// Position in [`LABEL_SET`]
    pub fn index(&self) -> usize {
        match self {
            WasteLabel::Biodegradable => 0,
            WasteLabel::NonBiodegradable => 1,
            WasteLabel::Toxic => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        LABEL_SET.get(index).copied()
    }

    /// Disposal guidance shown next to a detection
    pub fn advice(&self, confidence: f32) -> &'static str {
        let confident = confidence > HIGH_CONFIDENCE;
        match (self, confident) {
            (WasteLabel::Biodegradable, true) => {
                "Safe to compost! This waste will decompose naturally."
            }
            (WasteLabel::Biodegradable, false) => {
                "Likely biodegradable - consider composting if possible."
            }
            (WasteLabel::NonBiodegradable, true) => {
                "Non-biodegradable waste! Please dispose in appropriate recycling bin."
            }
            (WasteLabel::NonBiodegradable, false) => {
                "Likely non-biodegradable - check your local recycling guidelines."
            }
            (WasteLabel::Toxic, true) => {
                "TOXIC WASTE! Requires special disposal - contact local hazardous waste facility."
            }
            (WasteLabel::Toxic, false) => "Potentially toxic - handle with care and dispose safely.",
        }
    }
}

impl fmt::Display for WasteLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WasteLabel {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "biodegradable" => Ok(WasteLabel::Biodegradable),
            "non_biodegradable" | "non-biodegradable" => Ok(WasteLabel::NonBiodegradable),
            "toxic" => Ok(WasteLabel::Toxic),
            other => Err(ScanError::backend(
                None,
                format!("unknown class label '{}'", other),
            )),
        }
    }
}

/// Per-class scores in [`LABEL_SET`] order, as produced by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassScores(Vec<f32>);

impl ClassScores {
    pub fn new(scores: Vec<f32>) -> Self {
        Self(scores)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Build ordered scores from a `label -> score` map.
    ///
    /// Every label in the set must be present exactly once; label names match
    /// case-insensitively.
    pub fn from_label_map(map: &HashMap<String, f32>) -> Result<Self> {
        if map.len() != LABEL_SET.len() {
            return Err(ScanError::ScoreCardinalityMismatch {
                expected: LABEL_SET.len(),
                actual: map.len(),
            });
        }

        let mut scores = [None; LABEL_SET.len()];
        for (name, score) in map {
            let label: WasteLabel = name.parse()?;
            scores[label.index()] = Some(*score);
        }

        let present = scores.iter().filter(|s| s.is_some()).count();
        // Case-folded duplicates leave a label unset
        if present != LABEL_SET.len() {
            return Err(ScanError::ScoreCardinalityMismatch {
                expected: LABEL_SET.len(),
                actual: map.len(),
            });
        }

        Ok(Self(scores.iter().map(|s| s.unwrap_or_default()).collect()))
    }

    /// Build scores when a backend only reports its top class.
    ///
    /// The remaining probability mass is spread evenly over the other labels.
    /// A top-1 confidence that does not beat that share would hand the
    /// arg-max to another label, so it is rejected as a backend error.
    pub fn from_top(label: WasteLabel, confidence: f32) -> Result<Self> {
        if !confidence.is_finite() {
            return Err(ScanError::backend(
                None,
                format!("non-finite confidence {} for {}", confidence, label),
            ));
        }
        let confidence = confidence.clamp(0.0, 1.0);
        let rest = (1.0 - confidence) / (LABEL_SET.len() - 1) as f32;
        if rest >= confidence {
            return Err(ScanError::backend(
                None,
                format!(
                    "top class {} reported with confidence {:.3}, not above the other labels",
                    label, confidence
                ),
            ));
        }
        Ok(Self(
            LABEL_SET
                .iter()
                .map(|l| if *l == label { confidence } else { rest })
                .collect(),
        ))
    }
}

impl From<Vec<f32>> for ClassScores {
    fn from(scores: Vec<f32>) -> Self {
        Self(scores)
    }
}

/// One label with its normalized score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabelScore {
    pub label: WasteLabel,
    pub score: f32,
}

/// Interpreted outcome of one inference cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: WasteLabel,
    /// Normalized score of the selected label, within [0, 1]
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
    /// All labels, highest score first
    pub ranked: Vec<LabelScore>,
    /// Whether confidence met the display threshold
    pub actionable: bool,
}

impl Prediction {
    pub fn class_name(&self) -> &'static str {
        self.label.as_str()
    }

    pub fn advice(&self) -> &'static str {
        self.label.advice(self.confidence)
    }
}

#[derive(Debug, Clone)]
pub struct ResultInterpreter {
    min_confidence: f32,
}

impl ResultInterpreter {
    pub fn new(min_confidence: f32) -> Self {
        Self {
            min_confidence: min_confidence.clamp(0.0, 1.0),
        }
    }

    pub fn min_confidence(&self) -> f32 {
        self.min_confidence
    }

    /// Map scores to a prediction.
    ///
    /// Scores that do not already sum to 1 are divided by their sum. The
    /// selected class is the first index holding the maximum value.
    pub fn interpret(&self, scores: &ClassScores) -> Result<Prediction> {
        let raw = scores.as_slice();
        if raw.len() != LABEL_SET.len() {
            return Err(ScanError::ScoreCardinalityMismatch {
                expected: LABEL_SET.len(),
                actual: raw.len(),
            });
        }

        if let Some(bad) = raw.iter().find(|v| !v.is_finite()) {
            return Err(ScanError::DegenerateScores {
                details: format!("non-finite score {}", bad),
            });
        }

        let sum: f32 = raw.iter().sum();
        // A non-positive sum would flip or erase the ordering on division.
        if sum <= 0.0 {
            return Err(ScanError::DegenerateScores {
                details: format!("scores sum to {}", sum),
            });
        }

        let normalized: Vec<f32> = if (sum - 1.0).abs() > DISTRIBUTION_TOLERANCE {
            raw.iter().map(|v| v / sum).collect()
        } else {
            raw.to_vec()
        };

        let mut best = 0;
        for (index, value) in normalized.iter().enumerate().skip(1) {
            if *value > normalized[best] {
                best = index;
            }
        }

        let label = LABEL_SET[best];
        let confidence = normalized[best].clamp(0.0, 1.0);

        let mut ranked: Vec<LabelScore> = LABEL_SET
            .iter()
            .zip(normalized.iter())
            .map(|(label, score)| LabelScore {
                label: *label,
                score: *score,
            })
            .collect();
        // Stable sort keeps label order among equal scores
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));

        Ok(Prediction {
            label,
            confidence,
            timestamp: Utc::now(),
            ranked,
            actionable: confidence >= self.min_confidence,
        })
    }
}

impl Default for ResultInterpreter {
    fn default() -> Self {
        Self::new(0.3)
    }
}
