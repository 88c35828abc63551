//! # Image/caption datasets
//!
//! Loads the caption csv, tokenizes the captions for the CLIP text encoder
//! and splits the samples into a training and a validation set.
use diffusers::transformers::clip;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::path::{Path, PathBuf};

/// The maximum prompt length supported by the CLIP text encoder.
pub const MAX_PROMPT_LENGTH: usize = 77;
/// The CLIP end of text token, also used for padding.
pub const PADDING_TOKEN: i64 = 49407;

#[derive(thiserror::Error, Debug)]
pub enum DatasetError {
    #[error("column {column:?} not found in {file:?}, available columns: {available:?}")]
    MissingColumn { column: String, file: PathBuf, available: Vec<String> },

    #[error("no sample found in {0:?}")]
    Empty(PathBuf),

    #[error("invalid test fraction {0}, expected a value in (0, 1)")]
    InvalidFraction(f64),

    #[error("splitting {len} samples with a test fraction of {fraction} leaves an empty set")]
    EmptySplit { len: usize, fraction: f64 },
}

/// A single training example: an image file and its caption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCaption {
    pub image: PathBuf,
    pub caption: String,
}

/// Reads the captions csv, image paths are relative to `data_dir`.
pub fn load_records<P: AsRef<Path>>(
    data_dir: P,
    csv_name: &str,
    image_column: &str,
    caption_column: &str,
) -> anyhow::Result<Vec<ImageCaption>> {
    let data_dir = data_dir.as_ref();
    let csv_path = data_dir.join(csv_name);
    let file = crate::utils::file_open(&csv_path)?;
    let mut reader = csv::Reader::from_reader(file);
    let headers = reader.headers()?.clone();
    let column_index = |column: &str| {
        headers.iter().position(|h| h == column).ok_or_else(|| DatasetError::MissingColumn {
            column: column.to_string(),
            file: csv_path.clone(),
            available: headers.iter().map(|h| h.to_string()).collect(),
        })
    };
    let image_index = column_index(image_column)?;
    let caption_index = column_index(caption_column)?;
    let mut records = vec![];
    for row in reader.records() {
        let row = row?;
        let (image, caption) = match (row.get(image_index), row.get(caption_index)) {
            (Some(image), Some(caption)) => (image, caption),
            _ => anyhow::bail!("short row {:?} in {:?}", row, csv_path),
        };
        records.push(ImageCaption { image: data_dir.join(image), caption: caption.to_string() })
    }
    if records.is_empty() {
        return Err(DatasetError::Empty(csv_path).into());
    }
    tracing::info!("loaded {} records from {:?}", records.len(), csv_path.to_string_lossy());
    Ok(records)
}

/// Brings a token sequence to exactly `length` ids. Sequences that are too
/// long are cut and keep their last id (the end of text token).
pub fn fit_to_length(mut tokens: Vec<i64>, length: usize, pad: i64) -> Vec<i64> {
    if tokens.len() > length {
        let last = tokens[tokens.len() - 1];
        tokens.truncate(length);
        if let Some(l) = tokens.last_mut() {
            *l = last
        }
    }
    tokens.resize(length, pad);
    tokens
}

/// Turns captions into fixed size CLIP token sequences.
pub struct PromptTokenizer {
    tokenizer: clip::Tokenizer,
}

impl PromptTokenizer {
    pub fn create<P: AsRef<Path> + std::fmt::Debug>(
        vocab_file: P,
        config: &clip::Config,
    ) -> anyhow::Result<Self> {
        let tokenizer = clip::Tokenizer::create(vocab_file, config)?;
        Ok(Self { tokenizer })
    }

    pub fn encode(&self, caption: &str) -> anyhow::Result<Vec<i64>> {
        let tokens = self.tokenizer.encode(caption)?;
        let tokens = tokens.into_iter().map(|t| t as i64).collect();
        Ok(fit_to_length(tokens, MAX_PROMPT_LENGTH, PADDING_TOKEN))
    }
}

/// A record with its tokenized caption.
#[derive(Debug, Clone)]
pub struct Sample {
    pub image: PathBuf,
    pub tokens: Vec<i64>,
}

pub fn tokenize_records(
    tokenizer: &PromptTokenizer,
    records: &[ImageCaption],
) -> anyhow::Result<Vec<Sample>> {
    records
        .iter()
        .map(|r| Ok(Sample { image: r.image.clone(), tokens: tokenizer.encode(&r.caption)? }))
        .collect()
}

/// Shuffles the items with a seeded generator and splits them, the first
/// `ceil(test_fraction * len)` shuffled items form the test set.
/// Returns `(train, test)`.
pub fn train_test_split<T>(
    items: Vec<T>,
    test_fraction: f64,
    seed: u64,
) -> Result<(Vec<T>, Vec<T>), DatasetError> {
    if !(test_fraction > 0. && test_fraction < 1.) {
        return Err(DatasetError::InvalidFraction(test_fraction));
    }
    let len = items.len();
    let n_test = (test_fraction * len as f64).ceil() as usize;
    if n_test == 0 || n_test >= len {
        return Err(DatasetError::EmptySplit { len, fraction: test_fraction });
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut indexes: Vec<usize> = (0..len).collect();
    indexes.shuffle(&mut rng);
    let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
    let mut take = |i: &usize| slots[*i].take();
    let test: Vec<T> = indexes[..n_test].iter().filter_map(&mut take).collect();
    let train: Vec<T> = indexes[n_test..].iter().filter_map(&mut take).collect();
    Ok((train, test))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::tests::scratch_dir;

    #[test]
    fn pads_and_truncates() {
        let tokens = fit_to_length(vec![49406, 320, 49407], 6, PADDING_TOKEN);
        assert_eq!(tokens, [49406, 320, 49407, 49407, 49407, 49407]);
        let tokens = fit_to_length(vec![49406, 1, 2, 3, 4, 49407], 4, PADDING_TOKEN);
        assert_eq!(tokens, [49406, 1, 2, 49407]);
        let tokens = fit_to_length(vec![1, 2], 2, PADDING_TOKEN);
        assert_eq!(tokens, [1, 2]);
    }

    #[test]
    fn split_sizes_follow_the_fraction() {
        let items: Vec<usize> = (0..25).collect();
        let (train, test) = train_test_split(items, 0.1, 42).unwrap();
        assert_eq!(test.len(), 3);
        assert_eq!(train.len(), 22);
        let mut all: Vec<_> = train.iter().chain(test.iter()).copied().collect();
        all.sort();
        assert_eq!(all, (0..25).collect::<Vec<_>>());
    }

    #[test]
    fn split_is_deterministic() {
        let items: Vec<usize> = (0..50).collect();
        let a = train_test_split(items.clone(), 0.2, 7).unwrap();
        let b = train_test_split(items.clone(), 0.2, 7).unwrap();
        let c = train_test_split(items, 0.2, 8).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn split_rejects_degenerate_inputs() {
        assert!(matches!(
            train_test_split(vec![1, 2, 3], 0.0, 0),
            Err(DatasetError::InvalidFraction(_))
        ));
        assert!(matches!(
            train_test_split(vec![1], 0.1, 0),
            Err(DatasetError::EmptySplit { len: 1, .. })
        ));
        assert!(matches!(
            train_test_split(Vec::<u8>::new(), 0.5, 0),
            Err(DatasetError::EmptySplit { len: 0, .. })
        ));
    }

    #[test]
    fn loads_records_relative_to_the_data_dir() {
        let dir = scratch_dir("dataset-load");
        std::fs::write(
            dir.join("data_1.csv"),
            "image,caption,extra\nspec_0.png,\"A reel, fast\",1\nspec_1.png,A jig,2\n",
        )
        .unwrap();
        let records = load_records(&dir, "data_1.csv", "image", "caption").unwrap();
        assert_eq!(
            records,
            [
                ImageCaption { image: dir.join("spec_0.png"), caption: "A reel, fast".into() },
                ImageCaption { image: dir.join("spec_1.png"), caption: "A jig".into() },
            ]
        );
    }

    #[test]
    fn missing_column_is_reported() {
        let dir = scratch_dir("dataset-column");
        std::fs::write(dir.join("metadata.csv"), "file_name,text\na.png,x\n").unwrap();
        let err = load_records(&dir, "metadata.csv", "image", "caption").unwrap_err();
        match err.downcast_ref::<DatasetError>() {
            Some(DatasetError::MissingColumn { column, .. }) => assert_eq!(column, "image"),
            _ => panic!("unexpected error {err:?}"),
        }
        let records = load_records(&dir, "metadata.csv", "file_name", "text").unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn header_only_csv_is_empty() {
        let dir = scratch_dir("dataset-empty");
        std::fs::write(dir.join("data.csv"), "image,caption\n").unwrap();
        let err = load_records(&dir, "data.csv", "image", "caption").unwrap_err();
        assert!(matches!(err.downcast_ref::<DatasetError>(), Some(DatasetError::Empty(_))));
    }
}
