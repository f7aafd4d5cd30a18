use burn::{config::Config, module::Module, nn::{conv::{Conv2d, Conv2dConfig}, lstm::{Lstm, LstmConfig}, pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig}, BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d, ReLU}, tensor::{backend::Backend, Data, Int, Shape, Tensor}};
use derive_new::new;

use crate::error::{Error, Result};

/// Deeper encoders would shrink a 299 pixel image below one pixel long before this.
const MAX_BLOCKS: usize = 16;

/// What the evaluator needs from a network: an image embedding and a
/// bidirectional pass over the embeddings of one outfit.
pub trait OutfitEncoder<B: Backend> {
    /// `[n, 3, size, size]` -> `[n, d]`
    fn encode(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;

    /// `[1, n, d]` -> `[1, n, 2h]`, forward states in the first half of the
    /// last dimension and backward states in the second.
    fn sequence_hiddens(&self, features: Tensor<B, 3>) -> Tensor<B, 3>;
}

#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    batch_norm: BatchNorm<B, 2>,
    activation: ReLU,
}

#[derive(Debug, Clone, new)]
pub struct ConvBlockConfig {
    d_input: usize,
    d_output: usize,
}

impl ConvBlockConfig {
    // 3x3 stride 2 halves the spatial size: N = (W − 3 + 2) / 2 + 1
    fn conv(&self) -> Conv2dConfig {
        Conv2dConfig::new([self.d_input, self.d_output], [3, 3])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvBlock<B> {
        ConvBlock {
            conv: self.conv().init(device),
            batch_norm: BatchNormConfig::new(self.d_output).init(device),
            activation: ReLU::new(),
        }
    }

    pub fn init_with<B: Backend>(&self, record: ConvBlockRecord<B>) -> ConvBlock<B> {
        ConvBlock {
            conv: self.conv().init_with(record.conv),
            batch_norm: BatchNormConfig::new(self.d_output).init_with(record.batch_norm),
            activation: ReLU::new(),
        }
    }
}

impl<B: Backend> ConvBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.batch_norm.forward(x);
        self.activation.forward(x)
    }
}

#[derive(Module, Debug)]
pub struct ImageEncoder<B: Backend> {
    blocks: Vec<ConvBlock<B>>,
    pool: AdaptiveAvgPool2d,
    projection: Linear<B>,
}

impl<B: Backend> ImageEncoder<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.blocks.iter().fold(images, |x, block| block.forward(x));

        // global average pool to [n, c, 1, 1]
        let x = self.pool.forward(x);
        let [batch_size, channels, _, _] = x.dims();
        let x = x.reshape([batch_size, channels]);

        self.projection.forward(x)
    }
}

#[derive(Config, Debug)]
pub struct FullBiLstmConfig {
    /// Size of the image embedding fed to the recurrent layer.
    #[config(default = 512)]
    pub embed_dim: usize,
    /// Hidden size of each direction.
    #[config(default = 512)]
    pub hidden_dim: usize,
    #[config(default = 32)]
    pub base_channels: usize,
    #[config(default = 4)]
    pub num_blocks: usize,
}

impl FullBiLstmConfig {
    /// The score multiplies hidden states with image embeddings, so both
    /// sides must have the same width.
    pub fn validate(&self) -> Result<()> {
        if self.hidden_dim != self.embed_dim {
            return Err(Error::InvalidModelConfig(format!(
                "hidden_dim ({}) must equal embed_dim ({})",
                self.hidden_dim, self.embed_dim
            )));
        }
        if self.num_blocks == 0 || self.base_channels == 0 {
            return Err(Error::InvalidModelConfig(String::from(
                "the image encoder needs at least one block with a non-zero width",
            )));
        }
        if self.num_blocks > MAX_BLOCKS {
            return Err(Error::InvalidModelConfig(format!(
                "num_blocks ({}) must not exceed {MAX_BLOCKS}",
                self.num_blocks
            )));
        }
        if self.base_channels.checked_mul(1 << (self.num_blocks - 1)).is_none() {
            return Err(Error::InvalidModelConfig(format!(
                "base_channels ({}) overflows after {} doublings",
                self.base_channels,
                self.num_blocks - 1
            )));
        }
        Ok(())
    }

    /// Channel count of the last conv block, i.e. the projection's input width.
    pub fn feature_channels(&self) -> usize {
        self.base_channels << (self.num_blocks - 1)
    }

    /// Compares a loaded record with the shapes this config builds. Records
    /// carry their own tensor shapes, so a mismatch would otherwise only show
    /// up mid-forward.
    pub fn check_record<B: Backend>(&self, record: &FullBiLstmRecord<B>) -> std::result::Result<(), String> {
        if record.encoder.blocks.len() != self.num_blocks {
            return Err(format!(
                "expected {} conv blocks, record has {}",
                self.num_blocks,
                record.encoder.blocks.len()
            ));
        }
        expect_dims(
            "projection",
            record.encoder.projection.weight.dims(),
            [self.feature_channels(), self.embed_dim],
        )?;

        for (direction, lstm) in [("forward", &record.forward_lstm), ("backward", &record.backward_lstm)] {
            let gates = [
                ("input", &lstm.input_gate),
                ("forget", &lstm.forget_gate),
                ("output", &lstm.output_gate),
                ("cell", &lstm.cell_gate),
            ];
            for (gate, controller) in gates {
                expect_dims(
                    &format!("{direction} lstm {gate} gate input transform"),
                    controller.input_transform.weight.dims(),
                    [self.embed_dim, self.hidden_dim],
                )?;
                expect_dims(
                    &format!("{direction} lstm {gate} gate hidden transform"),
                    controller.hidden_transform.weight.dims(),
                    [self.hidden_dim, self.hidden_dim],
                )?;
            }
        }
        Ok(())
    }

    fn block_configs(&self) -> Vec<ConvBlockConfig> {
        (0..self.num_blocks)
            .map(|i| {
                let d_input = if i == 0 { 3 } else { self.base_channels << (i - 1) };
                ConvBlockConfig::new(d_input, self.base_channels << i)
            })
            .collect()
    }

    fn lstm(&self) -> LstmConfig {
        LstmConfig::new(self.embed_dim, self.hidden_dim, true)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> FullBiLstm<B> {
        let encoder = ImageEncoder {
            blocks: self.block_configs().iter().map(|block| block.init(device)).collect(),
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            projection: LinearConfig::new(self.feature_channels(), self.embed_dim).init(device),
        };

        FullBiLstm {
            encoder,
            forward_lstm: self.lstm().init(device),
            backward_lstm: self.lstm().init(device),
        }
    }

    pub fn init_with<B: Backend>(&self, record: FullBiLstmRecord<B>) -> FullBiLstm<B> {
        let blocks = self
            .block_configs()
            .iter()
            .zip(record.encoder.blocks)
            .map(|(block, record)| block.init_with(record))
            .collect();
        let encoder = ImageEncoder {
            blocks,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            projection: LinearConfig::new(self.feature_channels(), self.embed_dim)
                .init_with(record.encoder.projection),
        };

        FullBiLstm {
            encoder,
            forward_lstm: self.lstm().init_with(record.forward_lstm),
            backward_lstm: self.lstm().init_with(record.backward_lstm),
        }
    }
}

/// CNN image encoder followed by a bidirectional LSTM over the outfit.
#[derive(Module, Debug)]
pub struct FullBiLstm<B: Backend> {
    encoder: ImageEncoder<B>,
    forward_lstm: Lstm<B>,
    backward_lstm: Lstm<B>,
}

fn expect_dims(name: &str, actual: [usize; 2], expected: [usize; 2]) -> std::result::Result<(), String> {
    if actual == expected {
        Ok(())
    } else {
        Err(format!("{name} weight is {actual:?}, expected {expected:?}"))
    }
}

impl<B: Backend> OutfitEncoder<B> for FullBiLstm<B> {
    fn encode(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.encoder.forward(images)
    }

    fn sequence_hiddens(&self, features: Tensor<B, 3>) -> Tensor<B, 3> {
        let (_, forward) = self.forward_lstm.forward(features.clone(), None);
        let (_, backward) = self.backward_lstm.forward(reverse_time(features), None);

        Tensor::cat(vec![forward, reverse_time(backward)], 2)
    }
}

/// Reverses a batch-first sequence along its time axis.
fn reverse_time<B: Backend>(x: Tensor<B, 3>) -> Tensor<B, 3> {
    let [_, seq_len, _] = x.dims();
    let indices: Vec<i64> = (0..seq_len as i64).rev().collect();
    let indices = Tensor::<B, 1, Int>::from_data(
        Data::new(indices, Shape::new([seq_len])).convert(),
        &x.device(),
    );
    x.select(1, indices)
}

#[cfg(test)]
mod tests {
    use burn::backend::{ndarray::NdArrayDevice, NdArray};

    use super::*;

    type TestBackend = NdArray<f32>;

    fn small_config() -> FullBiLstmConfig {
        FullBiLstmConfig::new()
            .with_embed_dim(8)
            .with_hidden_dim(8)
            .with_base_channels(4)
            .with_num_blocks(2)
    }

    #[test]
    fn default_config_matches_reference_model() {
        let config = FullBiLstmConfig::new();
        assert_eq!(config.embed_dim, 512);
        assert_eq!(config.hidden_dim, 512);
        assert_eq!(config.feature_channels(), 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_hidden_size_different_from_embedding() {
        let config = small_config().with_hidden_dim(16);
        assert!(matches!(config.validate(), Err(Error::InvalidModelConfig(_))));
    }

    #[test]
    fn block_channels_double() {
        let channels: Vec<_> = small_config()
            .with_num_blocks(3)
            .block_configs()
            .into_iter()
            .map(|block| (block.d_input, block.d_output))
            .collect();
        assert_eq!(channels, vec![(3, 4), (4, 8), (8, 16)]);
    }

    #[test]
    fn encoder_and_sequence_shapes() {
        let device = NdArrayDevice::Cpu;
        let model = small_config().init::<TestBackend>(&device);

        let images = Tensor::<TestBackend, 4>::zeros([3, 3, 16, 16], &device);
        let features = model.encode(images);
        assert_eq!(features.dims(), [3, 8]);

        let hiddens = model.sequence_hiddens(features.reshape([1, 3, 8]));
        assert_eq!(hiddens.dims(), [1, 3, 16]);
    }

    #[test]
    fn reverse_time_flips_only_the_sequence_axis() {
        let device = NdArrayDevice::Cpu;
        let x = Tensor::<TestBackend, 3>::from_floats([[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]], &device);
        let reversed = reverse_time(x);
        assert_eq!(reversed.dims(), [1, 3, 2]);
        assert_eq!(reversed.to_data().value, vec![5.0, 6.0, 3.0, 4.0, 1.0, 2.0]);
    }

    #[test]
    fn rejects_encoders_that_overflow() {
        let too_deep = small_config().with_num_blocks(64);
        assert!(matches!(too_deep.validate(), Err(Error::InvalidModelConfig(_))));

        let too_wide = small_config().with_base_channels(usize::MAX / 2).with_num_blocks(3);
        assert!(matches!(too_wide.validate(), Err(Error::InvalidModelConfig(_))));

        assert!(small_config().with_num_blocks(MAX_BLOCKS).validate().is_ok());
    }

    #[test]
    fn record_shapes_are_checked_against_config() {
        let device = NdArrayDevice::Cpu;
        let config = small_config();
        let record = config.init::<TestBackend>(&device).into_record();
        assert!(config.check_record(&record).is_ok());
        assert!(small_config().with_embed_dim(4).check_record(&record).is_err());
        assert!(small_config().with_num_blocks(3).check_record(&record).is_err());

        let narrow_lstm = small_config().with_hidden_dim(4).init::<TestBackend>(&device).into_record();
        let err = config.check_record(&narrow_lstm).unwrap_err();
        assert!(err.contains("lstm"), "{err}");

        let reloaded = config.init_with(record);
        let features = reloaded.encode(Tensor::zeros([2, 3, 16, 16], &device));
        assert_eq!(features.dims(), [2, 8]);
    }

    fn sequence(offset_of_item: Option<(usize, f32)>) -> Tensor<TestBackend, 3> {
        let mut values: Vec<f32> = (0..24).map(|i| (i as f32 * 0.37).sin()).collect();
        if let Some((item, offset)) = offset_of_item {
            for value in &mut values[item * 8..(item + 1) * 8] {
                *value += offset;
            }
        }
        Tensor::from_floats(Data::new(values, Shape::new([1, 3, 8])), &NdArrayDevice::Cpu)
    }

    fn state_at(hiddens: &Tensor<TestBackend, 3>, step: usize, half: std::ops::Range<usize>) -> Vec<f32> {
        hiddens.clone().slice([0..1, step..step + 1, half]).to_data().value
    }

    #[test]
    fn forward_half_reads_left_to_right_and_backward_half_right_to_left() {
        let model = small_config().init::<TestBackend>(&NdArrayDevice::Cpu);
        let (forward, backward) = (0..8, 8..16);

        let base = model.sequence_hiddens(sequence(None));
        let last_changed = model.sequence_hiddens(sequence(Some((2, 1.5))));
        let first_changed = model.sequence_hiddens(sequence(Some((0, 1.5))));

        // the forward state of the first item has not seen the last one
        assert_eq!(state_at(&base, 0, forward.clone()), state_at(&last_changed, 0, forward.clone()));
        assert_ne!(state_at(&base, 2, forward.clone()), state_at(&last_changed, 2, forward));

        // the backward state of the last item has not seen the first one
        assert_eq!(state_at(&base, 2, backward.clone()), state_at(&first_changed, 2, backward.clone()));
        // while the backward state of the first item has seen the last one
        assert_ne!(state_at(&base, 0, backward.clone()), state_at(&last_changed, 0, backward));
    }
}
