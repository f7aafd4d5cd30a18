use std::{fmt::Display, fs, path::PathBuf};

use burn::{config::Config, data::dataset::Dataset, module::Module, record::CompactRecorder, tensor::backend::Backend};
use log::{info, warn};

use crate::{data::CompatibilityDataset, error::{Error, Result}, evaluation::{CompatibilityConfig, Evaluator}, model::OutfitEncoder};

/// Writes `config.json` and a freshly initialised `model.mpk` into
/// `artifact_dir`.
pub fn init_artifacts<B: Backend>(artifact_dir: &str, config: &CompatibilityConfig, device: &B::Device) -> Result<()> {
    config.model.validate()?;
    fs::create_dir_all(artifact_dir)?;
    config.save(format!("{artifact_dir}/config.json"))?;

    let weights = format!("{artifact_dir}/model");
    config
        .model
        .init::<B>(device)
        .save_file(weights.clone(), &CompactRecorder::new())
        .map_err(|err| Error::Weights {
            path: PathBuf::from(weights),
            reason: format!("{err:?}"),
        })?;

    info!("initialised model in {artifact_dir}");
    Ok(())
}

pub fn load_evaluator<B: Backend>(artifact_dir: &str, image_dir: &str, device: B::Device) -> Result<Evaluator<B>> {
    let config_path = format!("{artifact_dir}/config.json");
    let config = CompatibilityConfig::load(&config_path).map_err(|err| Error::Config {
        path: PathBuf::from(&config_path),
        reason: format!("{err:?}"),
    })?;

    Evaluator::new(&config, format!("{artifact_dir}/model"), image_dir, device)
}

/// Scores up to `limit` labelled outfits. Outfits left with fewer than two
/// usable images are skipped; any other failure stops the run.
pub fn evaluate<B: Backend, M: OutfitEncoder<B>>(
    evaluator: &Evaluator<B, M>,
    dataset: &CompatibilityDataset,
    limit: Option<usize>,
) -> Result<EvaluationSummary> {
    let mut summary = EvaluationSummary::default();

    for (index, item) in dataset.iter().take(limit.unwrap_or(usize::MAX)).enumerate() {
        match evaluator.compatibility(item.sequence.as_slice()) {
            Ok(score) => {
                info!("[{index}] label {} score {score:.4}", item.label);
                summary.record(item.compatible, score);
            }
            Err(Error::TooFewImages { retained, .. }) => {
                warn!("[{index}] skipped, only {retained} usable images");
                summary.skipped += 1;
            }
            Err(err) => return Err(err),
        }
    }

    Ok(summary)
}

#[derive(Debug, Default, Clone)]
pub struct EvaluationSummary {
    pub positives: Vec<f32>,
    pub negatives: Vec<f32>,
    pub skipped: usize,
}

impl EvaluationSummary {
    pub fn record(&mut self, compatible: bool, score: f32) {
        if compatible {
            self.positives.push(score);
        } else {
            self.negatives.push(score);
        }
    }

    pub fn mean_positive(&self) -> Option<f32> {
        mean(&self.positives)
    }

    pub fn mean_negative(&self) -> Option<f32> {
        mean(&self.negatives)
    }

    /// Probability that a compatible outfit scores a lower loss than an
    /// incompatible one, ties counting half.
    pub fn auc(&self) -> Option<f64> {
        if self.positives.is_empty() || self.negatives.is_empty() {
            return None;
        }

        let mut wins = 0f64;
        for positive in &self.positives {
            for negative in &self.negatives {
                if positive < negative {
                    wins += 1.0;
                } else if positive == negative {
                    wins += 0.5;
                }
            }
        }
        Some(wins / (self.positives.len() * self.negatives.len()) as f64)
    }
}

fn mean(scores: &[f32]) -> Option<f32> {
    if scores.is_empty() {
        None
    } else {
        Some(scores.iter().sum::<f32>() / scores.len() as f32)
    }
}

fn or_dash<T: Display>(value: Option<T>) -> String {
    value.map_or_else(|| String::from("-"), |value| format!("{value:.4}"))
}

impl Display for EvaluationSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "compatible:   {} outfits, mean loss {}", self.positives.len(), or_dash(self.mean_positive()))?;
        writeln!(f, "incompatible: {} outfits, mean loss {}", self.negatives.len(), or_dash(self.mean_negative()))?;
        writeln!(f, "skipped:      {}", self.skipped)?;
        write!(f, "auc:          {}", or_dash(self.auc()))
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::{ndarray::NdArrayDevice, NdArray};
    use tempfile::TempDir;

    use super::*;
    use crate::{data::tests::{write_gray, write_rgb}, model::FullBiLstmConfig};

    type TestBackend = NdArray<f32>;

    fn summary(positives: &[f32], negatives: &[f32]) -> EvaluationSummary {
        EvaluationSummary {
            positives: positives.to_vec(),
            negatives: negatives.to_vec(),
            skipped: 0,
        }
    }

    #[test]
    fn auc_of_separated_scores() {
        assert_eq!(summary(&[0.5, 1.0], &[2.0, 3.0]).auc(), Some(1.0));
        assert_eq!(summary(&[2.0, 3.0], &[0.5, 1.0]).auc(), Some(0.0));
        assert_eq!(summary(&[1.0], &[1.0]).auc(), Some(0.5));
        assert_eq!(summary(&[1.0, 3.0], &[2.0]).auc(), Some(0.5));
    }

    #[test]
    fn auc_needs_both_groups() {
        assert_eq!(summary(&[1.0], &[]).auc(), None);
        assert_eq!(summary(&[], &[]).mean_positive(), None);
        assert_eq!(summary(&[1.0, 2.0], &[]).mean_positive(), Some(1.5));
    }

    #[test]
    fn artifacts_round_trip_into_an_evaluation() {
        let dir = TempDir::new().unwrap();
        let artifact_dir = dir.path().join("model");
        let artifact_dir = artifact_dir.to_str().unwrap();
        let image_dir = dir.path().join("images");
        let image_dir = image_dir.to_str().unwrap();

        let model = FullBiLstmConfig::new()
            .with_embed_dim(8)
            .with_hidden_dim(8)
            .with_base_channels(4)
            .with_num_blocks(2);
        let config = CompatibilityConfig::new(model).with_image_size(16);
        init_artifacts::<TestBackend>(artifact_dir, &config, &NdArrayDevice::Cpu).unwrap();

        let evaluator = load_evaluator::<TestBackend>(artifact_dir, image_dir, NdArrayDevice::Cpu).unwrap();
        for id in ["000_a", "000_b", "000_c", "001_a", "001_b"] {
            write_rgb(evaluator.image_store(), id, 12, 12);
        }
        write_gray(evaluator.image_store(), "002_a", 12, 12);

        let labels = "1 000_a 000_b 000_c\n0 001_a 001_b\n0 002_a 001_a\n";
        let dataset = CompatibilityDataset::parse(labels).unwrap();

        let summary = evaluate(&evaluator, &dataset, None).unwrap();
        assert_eq!(summary.positives.len(), 1);
        assert_eq!(summary.negatives.len(), 1);
        assert_eq!(summary.skipped, 1);
        assert!(summary.auc().is_some());

        let limited = evaluate(&evaluator, &dataset, Some(1)).unwrap();
        assert_eq!(limited.positives.len(), 1);
        assert!(limited.negatives.is_empty());
    }

    #[test]
    fn missing_config_is_reported() {
        let dir = TempDir::new().unwrap();
        let artifact_dir = dir.path().to_str().unwrap();
        let result = load_evaluator::<TestBackend>(artifact_dir, artifact_dir, NdArrayDevice::Cpu);
        assert!(matches!(result, Err(Error::Config { .. })));
    }
}
