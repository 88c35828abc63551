//! # Batched input pipeline
//!
//! Each epoch a worker thread shuffles the samples through a bounded buffer,
//! decodes and augments the images and groups them in batches. Batches are
//! handed over through a bounded channel so that image decoding overlaps
//! with the training step. The text conditioning is computed on the
//! consumer side, next to the CLIP model.
use crate::augment::{load_image, Augmenter};
use crate::dataset::{Sample, MAX_PROMPT_LENGTH};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::{mpsc, Arc};
use tch::{nn::Module, Device, Tensor};

/// Streams items in a randomized order using a buffer of `capacity` items,
/// the larger the buffer the closer the result is to a full shuffle.
pub struct ShuffleBuffer<I: Iterator, R> {
    source: I,
    buffer: Vec<I::Item>,
    rng: R,
}

impl<I: Iterator, R: Rng> ShuffleBuffer<I, R> {
    pub fn new(mut source: I, capacity: usize, rng: R) -> Self {
        let buffer: Vec<_> = source.by_ref().take(capacity.max(1)).collect();
        Self { source, buffer, rng }
    }
}

impl<I: Iterator, R: Rng> Iterator for ShuffleBuffer<I, R> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() {
            return None;
        }
        let index = self.rng.gen_range(0..self.buffer.len());
        match self.source.next() {
            Some(item) => Some(std::mem::replace(&mut self.buffer[index], item)),
            None => Some(self.buffer.swap_remove(index)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub shuffle_buffer: usize,
    /// Number of batches prepared ahead of the consumer.
    pub prefetch: usize,
    pub resolution: u32,
    pub random_flip: bool,
    pub seed: u64,
}

impl LoaderConfig {
    pub fn new(batch_size: usize, resolution: u32, seed: u64) -> Self {
        Self {
            batch_size,
            shuffle_buffer: batch_size * 10,
            prefetch: 2,
            resolution,
            random_flip: true,
            seed,
        }
    }
}

/// A batch of decoded images and token ids, still on the CPU.
#[derive(Debug)]
pub struct RawBatch {
    pub images: Vec<f32>,
    pub tokens: Vec<i64>,
    pub size: usize,
    resolution: u32,
}

impl RawBatch {
    pub fn images(&self, device: Device) -> Tensor {
        let res = self.resolution as i64;
        Tensor::from_slice(&self.images).view([self.size as i64, 3, res, res]).to(device)
    }

    pub fn tokens(&self, device: Device) -> Tensor {
        Tensor::from_slice(&self.tokens).view([self.size as i64, MAX_PROMPT_LENGTH as i64]).to(device)
    }

    /// Moves the batch to `device` and computes the text conditioning.
    pub fn into_batch<M: Module>(self, text_encoder: &M, device: Device) -> Batch {
        let tokens = self.tokens(Device::Cpu);
        let encoded_text = text_encoder.forward(&tokens).to(device);
        Batch { images: self.images(device), tokens: tokens.to(device), encoded_text }
    }
}

/// The model inputs for one step.
#[derive(Debug)]
pub struct Batch {
    /// `[batch, 3, resolution, resolution]` images in `[-1, 1]`.
    pub images: Tensor,
    /// `[batch, 77]` token ids.
    pub tokens: Tensor,
    /// `[batch, 77, hidden]` text embeddings.
    pub encoded_text: Tensor,
}

impl Batch {
    pub fn size(&self) -> i64 {
        self.images.size()[0]
    }
}

pub struct DataLoader {
    samples: Arc<Vec<Sample>>,
    config: LoaderConfig,
    /// Draws the seed of each epoch.
    seeds: StdRng,
}

impl DataLoader {
    pub fn new(samples: Vec<Sample>, config: LoaderConfig) -> anyhow::Result<Self> {
        if config.batch_size == 0 {
            anyhow::bail!("batch size must be positive")
        }
        if samples.is_empty() {
            anyhow::bail!("cannot build a data loader without samples")
        }
        let seeds = StdRng::seed_from_u64(config.seed);
        Ok(Self { samples: Arc::new(samples), config, seeds })
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    /// Number of batches per epoch, the last one may be partial.
    pub fn num_batches(&self) -> usize {
        (self.samples.len() + self.config.batch_size - 1) / self.config.batch_size
    }

    /// Starts a new pass over the samples, each pass uses a different order.
    pub fn epoch(&mut self) -> BatchIter {
        let seed: u64 = self.seeds.gen();
        let (sender, receiver) = mpsc::sync_channel(self.config.prefetch.max(1));
        let samples = self.samples.clone();
        let config = self.config;
        let worker = std::thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(seed);
            let order = ShuffleBuffer::new(
                samples.iter(),
                config.shuffle_buffer,
                StdRng::seed_from_u64(rng.gen()),
            );
            let augmenter = Augmenter { resolution: config.resolution, random_flip: config.random_flip };
            let mut batch = BatchBuilder::new(config.batch_size, config.resolution);
            for sample in order {
                let image = match load_image(&sample.image, config.resolution) {
                    Ok(image) => image,
                    Err(err) => {
                        let _ = sender.send(Err(err));
                        return;
                    }
                };
                batch.push(augmenter.apply(image, &mut rng), &sample.tokens);
                if batch.is_full() {
                    if sender.send(Ok(batch.take())).is_err() {
                        return;
                    }
                }
            }
            if !batch.is_empty() {
                let _ = sender.send(Ok(batch.take()));
            }
        });
        BatchIter { receiver, worker: Some(worker) }
    }
}

struct BatchBuilder {
    batch_size: usize,
    resolution: u32,
    images: Vec<f32>,
    tokens: Vec<i64>,
    size: usize,
}

impl BatchBuilder {
    fn new(batch_size: usize, resolution: u32) -> Self {
        Self { batch_size, resolution, images: vec![], tokens: vec![], size: 0 }
    }

    fn push(&mut self, image: Vec<f32>, tokens: &[i64]) {
        self.images.extend(image);
        self.tokens.extend_from_slice(tokens);
        self.size += 1
    }

    fn is_full(&self) -> bool {
        self.size >= self.batch_size
    }

    fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn take(&mut self) -> RawBatch {
        let batch = RawBatch {
            images: std::mem::take(&mut self.images),
            tokens: std::mem::take(&mut self.tokens),
            size: self.size,
            resolution: self.resolution,
        };
        self.size = 0;
        batch
    }
}

pub struct BatchIter {
    receiver: mpsc::Receiver<anyhow::Result<RawBatch>>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl Iterator for BatchIter {
    type Item = anyhow::Result<RawBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.receiver.recv() {
            Ok(batch) => Some(batch),
            Err(mpsc::RecvError) => {
                if let Some(worker) = self.worker.take() {
                    if worker.join().is_err() {
                        return Some(Err(anyhow::anyhow!("data loader worker panicked")));
                    }
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::tests::scratch_dir;
    use image::{Rgb, RgbImage};

    #[test]
    fn shuffle_buffer_is_a_permutation() {
        let rng = StdRng::seed_from_u64(3);
        let mut items: Vec<usize> = ShuffleBuffer::new(0..100, 10, rng).collect();
        assert_ne!(items, (0..100).collect::<Vec<_>>());
        items.sort();
        assert_eq!(items, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn small_buffer_keeps_items_close() {
        let rng = StdRng::seed_from_u64(5);
        let items: Vec<usize> = ShuffleBuffer::new(0..50, 1, rng).collect();
        assert_eq!(items, (0..50).collect::<Vec<_>>());
        let rng = StdRng::seed_from_u64(5);
        // An item cannot be emitted before the buffer has reached it.
        for (position, item) in ShuffleBuffer::new(0..50, 4, rng).enumerate() {
            assert!(item < position + 4);
        }
    }

    fn write_samples(name: &str, n: usize) -> Vec<Sample> {
        let dir = scratch_dir(name);
        (0..n)
            .map(|i| {
                let path = dir.join(format!("spec_{i}.png"));
                RgbImage::from_pixel(12, 12, Rgb([i as u8, 0, 255])).save(&path).unwrap();
                Sample { image: path, tokens: vec![i as i64; MAX_PROMPT_LENGTH] }
            })
            .collect()
    }

    #[test]
    fn batches_cover_the_epoch() {
        let samples = write_samples("loader-epoch", 7);
        let config = LoaderConfig::new(3, 8, 42);
        let mut loader = DataLoader::new(samples, config).unwrap();
        assert_eq!(loader.num_batches(), 3);
        let batches: Vec<RawBatch> = loader.epoch().map(|b| b.unwrap()).collect();
        let sizes: Vec<usize> = batches.iter().map(|b| b.size).collect();
        assert_eq!(sizes, [3, 3, 1]);
        let mut ids: Vec<i64> =
            batches.iter().flat_map(|b| b.tokens.chunks(MAX_PROMPT_LENGTH).map(|t| t[0])).collect();
        ids.sort();
        assert_eq!(ids, (0..7).collect::<Vec<_>>());

        let first = &batches[0];
        assert_eq!(first.images.len(), 3 * 3 * 8 * 8);
        assert_eq!(first.images(Device::Cpu).size(), [3, 3, 8, 8]);
        assert_eq!(first.tokens(Device::Cpu).size(), [3, MAX_PROMPT_LENGTH as i64]);
        // The blue channel is saturated in every sample.
        let blue = first.images(Device::Cpu).double_value(&[0, 2, 4, 4]);
        assert!(blue > 0.98, "{blue}");
    }

    #[test]
    fn epochs_use_different_orders() {
        let samples = write_samples("loader-order", 12);
        let mut config = LoaderConfig::new(12, 8, 1);
        config.random_flip = false;
        let mut loader = DataLoader::new(samples, config).unwrap();
        let order = |batch: RawBatch| -> Vec<i64> {
            batch.tokens.chunks(MAX_PROMPT_LENGTH).map(|t| t[0]).collect()
        };
        let first: Vec<_> = loader.epoch().map(|b| order(b.unwrap())).collect();
        let second: Vec<_> = loader.epoch().map(|b| order(b.unwrap())).collect();
        assert_eq!(first.len(), 1);
        assert_ne!(first, second);
    }

    #[test]
    fn neighbouring_seeds_do_not_share_epochs() {
        let samples = write_samples("loader-seeds", 12);
        let orders = |seed: u64, epochs: usize| -> Vec<Vec<i64>> {
            let mut config = LoaderConfig::new(12, 8, seed);
            config.random_flip = false;
            let mut loader = DataLoader::new(samples.clone(), config).unwrap();
            assert_eq!(loader.num_samples(), 12);
            (0..epochs)
                .map(|_| {
                    let batch = loader.epoch().next().unwrap().unwrap();
                    batch.tokens.chunks(MAX_PROMPT_LENGTH).map(|t| t[0]).collect()
                })
                .collect()
        };
        let a = orders(0, 2);
        let b = orders(1, 1);
        // The second epoch of one loader is not the first epoch of the next seed.
        assert_ne!(a[1], b[0]);
        assert_eq!(orders(0, 2), a);
    }

    #[test]
    fn decode_errors_are_forwarded() {
        let mut samples = write_samples("loader-error", 2);
        samples.push(Sample { image: "/no/such/spec.png".into(), tokens: vec![0; MAX_PROMPT_LENGTH] });
        let mut config = LoaderConfig::new(1, 8, 0);
        config.shuffle_buffer = 1;
        let mut loader = DataLoader::new(samples, config).unwrap();
        let results: Vec<_> = loader.epoch().collect();
        assert_eq!(results.len(), 3);
        assert!(results[2].is_err());
    }

    #[test]
    fn rejects_empty_inputs() {
        assert!(DataLoader::new(vec![], LoaderConfig::new(2, 8, 0)).is_err());
        let samples = vec![Sample { image: "a.png".into(), tokens: vec![] }];
        assert!(DataLoader::new(samples, LoaderConfig::new(0, 8, 0)).is_err());
    }
}
