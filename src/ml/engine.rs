use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use image::DynamicImage;
use ort::session::Session;
use ort::value::Value;
use tracing::debug;

use super::pipeline::{prepare_batch, DEFAULT_INPUT_SIZE};
use crate::error::{EngineError, Result};
use crate::models::{RatingScores, TagId, TagType};
use crate::vocabulary::Vocabulary;

/// Classifier output for one image.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub ratings: RatingScores,
    /// General labels at or above the general floor.
    pub general: BTreeMap<TagId, f32>,
    /// Character labels at or above the character floor.
    pub character: BTreeMap<TagId, f32>,
}

impl Classification {
    /// Character and general labels as one edge map.
    pub fn tag_probabilities(&self) -> BTreeMap<TagId, f32> {
        let mut merged = self.character.clone();
        merged.extend(self.general.iter().map(|(k, v)| (*k, *v)));
        merged
    }
}

/// Turns images into label probabilities.
pub trait Classifier: Send + Sync {
    /// One result per path, in the same order.
    fn classify(&self, paths: &[PathBuf]) -> Result<Vec<Classification>>;
}

/// Per-category probability floors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Floors {
    pub general: f32,
    pub character: f32,
}

/// Splits one model output row by vocabulary category.
///
/// The first four rating labels, in vocabulary order, are read as general,
/// sensitive, questionable and explicit.
pub fn split_scores(
    scores: &[f32],
    vocabulary: &Vocabulary,
    floors: Floors,
) -> Result<Classification> {
    if scores.len() != vocabulary.len() {
        return Err(EngineError::Classifier(format!(
            "model produced {} scores, vocabulary has {} labels",
            scores.len(),
            vocabulary.len()
        )));
    }

    let mut ratings = Vec::with_capacity(4);
    let mut general = BTreeMap::new();
    let mut character = BTreeMap::new();
    for ((tag_id, entry), &p) in vocabulary.iter().zip(scores) {
        let p = p.clamp(0.0, 1.0);
        match entry.tag_type {
            TagType::Rating => ratings.push(p),
            TagType::General if p >= floors.general => {
                general.insert(tag_id, p);
            }
            TagType::Character if p >= floors.character => {
                character.insert(tag_id, p);
            }
            _ => {}
        }
    }

    let [g, s, q, e, ..] = ratings.as_slice() else {
        return Err(EngineError::Classifier(format!(
            "expected at least 4 rating labels, vocabulary has {}",
            ratings.len()
        )));
    };
    Ok(Classification {
        ratings: RatingScores::new(*g, *s, *q, *e),
        general,
        character,
    })
}

/// WD-style ONNX tagger.
///
/// Uses a `Mutex` because `Session::run` requires `&mut self`.
pub struct OnnxTagger {
    session: Mutex<Session>,
    input_name: String,
    input_size: u32,
    vocabulary: Vocabulary,
    floors: Floors,
}

impl OnnxTagger {
    pub fn load(model_path: &Path, vocabulary: Vocabulary, floors: Floors) -> Result<Self> {
        let session = Session::builder()
            .map_err(|e| {
                EngineError::Classifier(format!("failed to create ONNX session builder: {e}"))
            })?
            .commit_from_file(model_path)
            .map_err(|e| {
                EngineError::Classifier(format!("failed to load model {:?}: {e}", model_path))
            })?;

        let input_name = session
            .inputs()
            .first()
            .map(|i| i.name().to_string())
            .unwrap_or_else(|| "input_1:0".to_string());

        debug!(
            "Loaded tagger from {:?} (input: {:?}, {} labels)",
            model_path,
            input_name,
            vocabulary.len()
        );

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            input_size: DEFAULT_INPUT_SIZE,
            vocabulary,
            floors,
        })
    }

    fn run(&self, images: &[DynamicImage]) -> Result<Vec<Vec<f32>>> {
        let batch = prepare_batch(images, self.input_size);
        let shape: Vec<i64> = batch.shape().iter().map(|&d| d as i64).collect();
        let flat: Vec<f32> = batch.iter().copied().collect();

        let input = Value::from_array((shape, flat))
            .map_err(|e| EngineError::Classifier(format!("failed to create input tensor: {e}")))?;
        let inputs = ort::inputs![self.input_name.as_str() => input];

        let mut session = self
            .session
            .lock()
            .map_err(|e| EngineError::Classifier(format!("session lock poisoned: {e}")))?;
        let outputs = session
            .run(inputs)
            .map_err(|e| EngineError::Classifier(format!("inference failed: {e}")))?;

        let (_, output) = outputs
            .iter()
            .next()
            .ok_or_else(|| EngineError::Classifier("model produced no output".into()))?;
        let (shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| EngineError::Classifier(format!("failed to read output: {e}")))?;

        let labels = match shape.len() {
            2 => shape[1] as usize,
            _ => {
                return Err(EngineError::Classifier(format!(
                    "unexpected output shape {:?}",
                    shape
                )))
            }
        };
        let rows = data
            .chunks(labels.max(1))
            .take(images.len())
            .map(<[f32]>::to_vec)
            .collect();
        Ok(rows)
    }
}

impl Classifier for OnnxTagger {
    fn classify(&self, paths: &[PathBuf]) -> Result<Vec<Classification>> {
        let images = paths
            .iter()
            .map(|path| {
                image::open(path).map_err(|e| {
                    EngineError::Classifier(format!("failed to decode {:?}: {e}", path))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        self.run(&images)?
            .iter()
            .map(|row| split_scores(row, &self.vocabulary, self.floors))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> Vocabulary {
        Vocabulary::from_entries([
            ("general", TagType::Rating),
            ("sensitive", TagType::Rating),
            ("questionable", TagType::Rating),
            ("explicit", TagType::Rating),
            ("1girl", TagType::General),
            ("sky", TagType::General),
            ("miku", TagType::Character),
        ])
    }

    const FLOORS: Floors = Floors {
        general: 0.35,
        character: 0.8,
    };

    #[test]
    fn scores_are_split_by_category_and_floor() {
        let scores = [0.7, 0.2, 0.05, 0.05, 0.9, 0.3, 0.85];
        let c = split_scores(&scores, &vocab(), FLOORS).unwrap();

        assert_eq!(c.ratings, RatingScores::new(0.7, 0.2, 0.05, 0.05));
        assert_eq!(c.general, BTreeMap::from([(4, 0.9)]));
        assert_eq!(c.character, BTreeMap::from([(6, 0.85)]));
        assert_eq!(c.tag_probabilities().len(), 2);
    }

    #[test]
    fn length_mismatch_is_a_classifier_error() {
        let err = split_scores(&[0.1; 3], &vocab(), FLOORS).unwrap_err();
        assert!(matches!(err, EngineError::Classifier(_)));
    }

    #[test]
    fn vocabulary_needs_four_ratings() {
        let short = Vocabulary::from_entries([("general", TagType::Rating), ("x", TagType::General)]);
        assert!(split_scores(&[0.5, 0.5], &short, FLOORS).is_err());
    }
}
