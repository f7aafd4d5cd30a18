use std::{fs, path::{Path, PathBuf}};

use burn::{data::{dataloader::batcher::Batcher, dataset::{Dataset, InMemDataset}}, tensor::{backend::Backend, Data, Shape, Tensor}};
use derive_new::new;
use image::{imageops::FilterType, io::Reader as ImageReader, DynamicImage, GenericImageView};
use log::debug;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::error::{Error, Result};

/// Side of the square every image is resized to before encoding.
pub const IMAGE_SIZE: usize = 299;

const CHANNELS: usize = 3;

/// Directory tree of catalogue images, where item `A_B` is stored as `A/B.jpg`.
#[derive(Debug, Clone, new)]
pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    pub fn image_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.jpg", id.replace('_', "/")))
    }

    pub fn open(&self, id: &str) -> Result<DynamicImage> {
        let path = self.image_path(id);
        let reader = ImageReader::open(&path)
            .map_err(|source| Error::ImageOpen { path: path.clone(), source })?;
        reader
            .decode()
            .map_err(|source| Error::ImageDecode { path, source })
    }

    /// Opens every image of an outfit, keeping sequence order and dropping
    /// the degenerate ones. Files that are missing or do not decode are errors.
    pub fn load_outfit<S: AsRef<str> + Sync>(&self, sequence: &[S]) -> Result<Vec<DynamicImage>> {
        let images = sequence
            .par_iter()
            .map(|id| self.open(id.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        Ok(images
            .into_iter()
            .zip(sequence)
            .filter_map(|(image, id)| {
                if is_degenerate(&image) {
                    debug!("skipping degenerate image {}", id.as_ref());
                    None
                } else {
                    Some(image)
                }
            })
            .collect())
    }
}

/// Single-channel images in the catalogue are mostly noise, and an axis of
/// size 1 leaves nothing to embed.
pub fn is_degenerate(image: &DynamicImage) -> bool {
    let (width, height) = image.dimensions();
    image.color().channel_count() == 1 || width == 1 || height == 1
}

/// Resizes to `size` x `size`, forces RGB and lays the pixels out as CHW
/// floats in [0, 1].
fn to_chw(image: &DynamicImage, size: usize) -> Vec<f32> {
    let rgb = image
        .resize_exact(size as u32, size as u32, FilterType::Triangle)
        .to_rgb8();

    let plane = size * size;
    let mut chw = vec![0f32; CHANNELS * plane];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let offset = y as usize * size + x as usize;
        for (c, value) in pixel.0.iter().enumerate() {
            chw[c * plane + offset] = *value as f32 / 255.0;
        }
    }
    chw
}

#[derive(new)]
pub struct OutfitBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
}

#[derive(Clone, Debug)]
pub struct OutfitBatch<B: Backend> {
    /// `[n, 3, size, size]`
    pub images: Tensor<B, 4>,
}

impl<B: Backend> Batcher<DynamicImage, OutfitBatch<B>> for OutfitBatcher<B> {
    fn batch(&self, items: Vec<DynamicImage>) -> OutfitBatch<B> {
        let size = self.image_size;
        let images = items
            .par_iter()
            .map(|image| to_chw(image, size))
            .collect::<Vec<Vec<f32>>>()
            .into_iter()
            .map(|pixels| Data::new(pixels, Shape::new([CHANNELS, size, size])))
            .map(|data| Tensor::<B, 3>::from_data(data.convert(), &self.device))
            .collect::<Vec<Tensor<B, 3>>>();

        OutfitBatch {
            images: Tensor::stack(images, 0),
        }
    }
}

/// One line of the compatibility label file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatibilityItem {
    /// The label token as written.
    pub label: String,
    pub compatible: bool,
    pub sequence: Vec<String>,
}

impl CompatibilityItem {
    /// Parses `<label> <id> <id> ...`. Blank lines yield `None`.
    pub fn parse(line: &str, line_number: usize) -> Result<Option<Self>> {
        let mut tokens = line.split_whitespace();
        let Some(label) = tokens.next() else {
            return Ok(None);
        };

        let compatible = match label.to_ascii_lowercase().as_str() {
            "1" | "true" => true,
            "0" | "false" => false,
            _ => {
                return Err(Error::InvalidLabel {
                    line: line_number,
                    token: label.to_string(),
                })
            }
        };

        Ok(Some(Self {
            label: label.to_string(),
            compatible,
            sequence: tokens.map(String::from).collect(),
        }))
    }
}

pub struct CompatibilityDataset {
    dataset: InMemDataset<CompatibilityItem>,
}

impl Dataset<CompatibilityItem> for CompatibilityDataset {
    fn get(&self, index: usize) -> Option<CompatibilityItem> {
        self.dataset.get(index)
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}

impl CompatibilityDataset {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let items = contents
            .lines()
            .enumerate()
            .filter_map(|(i, line)| CompatibilityItem::parse(line, i + 1).transpose())
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            dataset: InMemDataset::new(items),
        })
    }
}
