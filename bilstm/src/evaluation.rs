use std::path::{Path, PathBuf};

use burn::{config::Config, data::dataloader::batcher::Batcher, record::{CompactRecorder, Recorder}, tensor::{backend::Backend, ElementConversion}};
use image::DynamicImage;
use log::debug;

use crate::{data::{ImageStore, OutfitBatcher, IMAGE_SIZE}, error::{Error, Result}, model::{FullBiLstm, FullBiLstmConfig, FullBiLstmRecord, OutfitEncoder}, score::{compatibility_loss, MIN_SEQUENCE_LEN}};

/// Stored as `config.json` next to the weights.
#[derive(Config, Debug)]
pub struct CompatibilityConfig {
    pub model: FullBiLstmConfig,
    #[config(default = "IMAGE_SIZE")]
    pub image_size: usize,
}

/// Scores outfits with a loaded model. Holds no state besides the model, so
/// repeated calls on the same sequence give the same result.
pub struct Evaluator<B: Backend, M = FullBiLstm<B>> {
    model: M,
    store: ImageStore,
    batcher: OutfitBatcher<B>,
}

impl<B: Backend> Evaluator<B> {
    /// Builds the model described by `config` from the record at `weights`.
    /// Use a backend without autodiff so batch norm runs on its running
    /// statistics.
    pub fn new<P: AsRef<Path>, Q: Into<PathBuf>>(
        config: &CompatibilityConfig,
        weights: P,
        image_dir: Q,
        device: B::Device,
    ) -> Result<Self> {
        config.model.validate()?;

        let weights = weights.as_ref().to_path_buf();
        let record: FullBiLstmRecord<B> = CompactRecorder::new()
            .load(weights.clone(), &device)
            .map_err(|err| Error::Weights {
                path: weights.clone(),
                reason: format!("{err:?}"),
            })?;

        config
            .model
            .check_record(&record)
            .map_err(|reason| Error::IncompatibleWeights { path: weights, reason })?;

        let model = config.model.init_with::<B>(record);
        Ok(Self::from_model(model, image_dir, config.image_size, device))
    }
}

impl<B: Backend, M: OutfitEncoder<B>> Evaluator<B, M> {
    pub fn from_model<Q: Into<PathBuf>>(model: M, image_dir: Q, image_size: usize, device: B::Device) -> Self {
        Self {
            model,
            store: ImageStore::new(image_dir.into()),
            batcher: OutfitBatcher::new(device, image_size),
        }
    }

    #[cfg(test)]
    pub fn image_store(&self) -> &ImageStore {
        &self.store
    }

    /// Loads the images of `sequence` in order, skipping single-channel and
    /// size-1 images.
    pub fn get_images<S: AsRef<str> + Sync>(&self, sequence: &[S]) -> Result<Vec<DynamicImage>> {
        self.store.load_outfit(sequence)
    }

    /// Compatibility loss of an outfit; lower means more compatible.
    pub fn compatibility<S: AsRef<str> + Sync>(&self, sequence: &[S]) -> Result<f32> {
        let images = self.get_images(sequence)?;
        debug!("retained {}/{} images", images.len(), sequence.len());
        self.score_images(images)
    }

    pub fn score_images(&self, images: Vec<DynamicImage>) -> Result<f32> {
        if images.len() < MIN_SEQUENCE_LEN {
            return Err(Error::TooFewImages {
                retained: images.len(),
                required: MIN_SEQUENCE_LEN,
            });
        }

        let batch = self.batcher.batch(images);
        let features = self.model.encode(batch.images);
        let [n, d] = features.dims();

        // one outfit is a batch of one sequence of n items
        let hiddens = self.model.sequence_hiddens(features.clone().reshape([1, n, d]));
        let [_, steps, width] = hiddens.dims();
        let hiddens = hiddens.reshape([steps, width]);

        let loss = compatibility_loss(features, hiddens)?;
        Ok(loss.into_scalar().elem::<f32>())
    }
}
