// Fine-tunes the Riffusion UNet on a directory of captioned spectrograms.
//
// The dataset directory holds a csv file with an `image` column (paths
// relative to the directory) and a `caption` column, see the
// `build-metadata` binary to generate one.
//
// The CLIP vocabulary has to be available locally:
//
// mkdir -p data && cd data
// wget https://github.com/openai/CLIP/raw/main/clip/bpe_simple_vocab_16e6.txt.gz
// gunzip bpe_simple_vocab_16e6.txt.gz
//
// The pretrained weights are fetched from the hub unless local files are
// passed with --clip-weights, --vae-weights and --unet-weights.
//
//   cargo run --release --bin finetune -- --epochs 20 --batch-size 6
use clap::Parser;
use riffusion_finetune::{
    config::FinetuneConfig,
    dataset,
    fit::{self, Callback, CsvLogger, ModelCheckpoint, Monitor},
    loader::DataLoader,
    models::StableDiffusionConfig,
    noise_scheduler::{BetaSchedule, NoiseScheduler},
    plot::LossCurve,
    text_encoder::TextEncoder,
    trainer::Trainer,
    utils::DeviceSetup,
    weights::ModelFile,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// A TOML file with the run settings, the flags below take precedence.
    #[arg(long, value_name = "FILE")]
    config: Option<String>,

    /// Run on cpu rather than on an accelerator.
    #[arg(long, value_delimiter = ',')]
    cpu: Vec<String>,

    /// The directory holding the captions csv and the images.
    #[arg(long)]
    data_dir: Option<String>,

    /// The captions csv file, relative to the data directory.
    #[arg(long)]
    csv_name: Option<String>,

    #[arg(long)]
    image_column: Option<String>,

    #[arg(long)]
    caption_column: Option<String>,

    #[arg(long)]
    vocab_file: Option<String>,

    /// The hub repository to fetch the pretrained weights from.
    #[arg(long)]
    repo: Option<String>,

    #[arg(long, value_name = "FILE")]
    clip_weights: Option<String>,

    #[arg(long, value_name = "FILE")]
    vae_weights: Option<String>,

    #[arg(long, value_name = "FILE")]
    unet_weights: Option<String>,

    /// The size of the sliced attention or 0 for automatic slicing (disabled by default)
    #[arg(long)]
    sliced_attention_size: Option<i64>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    resolution: Option<u32>,

    /// Randomly flip the training images horizontally.
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_name = "BOOL")]
    random_flip: Option<bool>,

    /// Randomly flip the validation images horizontally.
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_name = "BOOL")]
    val_random_flip: Option<bool>,

    /// Share of the records held out for validation.
    #[arg(long)]
    test_fraction: Option<f64>,

    #[arg(long)]
    split_seed: Option<u64>,

    #[arg(long)]
    seed: Option<u64>,

    /// Number of samples in the shuffle buffer, ten batches by default.
    #[arg(long)]
    shuffle_buffer: Option<usize>,

    /// Number of batches prepared ahead of the training step.
    #[arg(long)]
    prefetch: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    #[arg(long)]
    adam_beta1: Option<f64>,

    #[arg(long)]
    adam_beta2: Option<f64>,

    #[arg(long)]
    adam_epsilon: Option<f64>,

    #[arg(long)]
    weight_decay: Option<f64>,

    /// Each gradient tensor is clipped to this norm.
    #[arg(long)]
    max_grad_norm: Option<f64>,

    /// Forward passes under autocast with dynamic loss scaling.
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_name = "BOOL")]
    mixed_precision: Option<bool>,

    #[arg(long)]
    beta_start: Option<f64>,

    #[arg(long)]
    beta_end: Option<f64>,

    #[arg(long, value_enum)]
    beta_schedule: Option<BetaSchedule>,

    /// Number of diffusion steps of the noise schedule.
    #[arg(long)]
    train_timesteps: Option<usize>,

    /// Where to save the fine-tuned UNet weights.
    #[arg(long, value_name = "FILE")]
    checkpoint: Option<String>,

    /// The loss deciding whether a checkpoint improves on the previous ones.
    #[arg(long, value_enum)]
    monitor: Option<Monitor>,

    /// Only save the weights when the monitored loss improves.
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_name = "BOOL")]
    save_best_only: Option<bool>,

    /// The csv file receiving the per-epoch losses.
    #[arg(long, value_name = "FILE")]
    metrics: Option<String>,

    #[arg(long, value_name = "FILE")]
    loss_curve: Option<String>,

    /// Log every batch.
    #[arg(long, short)]
    verbose: bool,
}

fn merge<T: Clone>(target: &mut T, value: &Option<T>) {
    if let Some(value) = value {
        *target = value.clone()
    }
}

fn merge_some<T: Clone>(target: &mut Option<T>, value: &Option<T>) {
    if value.is_some() {
        *target = value.clone()
    }
}

impl Args {
    fn finetune_config(&self) -> anyhow::Result<FinetuneConfig> {
        let mut cfg = match &self.config {
            Some(path) => FinetuneConfig::from_file(path)?,
            None => FinetuneConfig::default(),
        };
        let data = &mut cfg.data;
        merge(&mut data.data_dir, &self.data_dir);
        merge(&mut data.csv_name, &self.csv_name);
        merge(&mut data.image_column, &self.image_column);
        merge(&mut data.caption_column, &self.caption_column);
        merge(&mut data.vocab_file, &self.vocab_file);

        let weights = &mut cfg.weights;
        merge(&mut weights.repo, &self.repo);
        merge_some(&mut weights.clip_weights, &self.clip_weights);
        merge_some(&mut weights.vae_weights, &self.vae_weights);
        merge_some(&mut weights.unet_weights, &self.unet_weights);
        merge_some(&mut weights.sliced_attention_size, &self.sliced_attention_size);

        let training = &mut cfg.training;
        merge(&mut training.epochs, &self.epochs);
        merge(&mut training.batch_size, &self.batch_size);
        merge(&mut training.resolution, &self.resolution);
        merge(&mut training.random_flip, &self.random_flip);
        merge(&mut training.val_random_flip, &self.val_random_flip);
        merge(&mut training.test_fraction, &self.test_fraction);
        merge(&mut training.split_seed, &self.split_seed);
        merge(&mut training.seed, &self.seed);
        merge_some(&mut training.shuffle_buffer, &self.shuffle_buffer);
        merge(&mut training.prefetch, &self.prefetch);

        let trainer = &mut cfg.trainer;
        merge(&mut trainer.learning_rate, &self.learning_rate);
        merge(&mut trainer.beta1, &self.adam_beta1);
        merge(&mut trainer.beta2, &self.adam_beta2);
        merge(&mut trainer.epsilon, &self.adam_epsilon);
        merge(&mut trainer.weight_decay, &self.weight_decay);
        merge(&mut trainer.max_grad_norm, &self.max_grad_norm);
        merge(&mut trainer.use_mixed_precision, &self.mixed_precision);

        let scheduler = &mut cfg.noise_scheduler;
        merge(&mut scheduler.beta_start, &self.beta_start);
        merge(&mut scheduler.beta_end, &self.beta_end);
        merge(&mut scheduler.beta_schedule, &self.beta_schedule);
        merge(&mut scheduler.train_timesteps, &self.train_timesteps);

        let output = &mut cfg.output;
        merge(&mut output.checkpoint, &self.checkpoint);
        merge(&mut output.monitor, &self.monitor);
        merge(&mut output.save_best_only, &self.save_best_only);
        merge(&mut output.metrics, &self.metrics);
        merge(&mut output.loss_curve, &self.loss_curve);
        cfg.validate()?;
        Ok(cfg)
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let cfg = args.finetune_config()?;
    tch::maybe_init_cuda();
    tracing::info!("Cuda available: {}", tch::Cuda::is_available());
    tracing::info!("Cudnn available: {}", tch::Cuda::cudnn_is_available());
    let devices = DeviceSetup::new(args.cpu);
    tch::manual_seed(cfg.training.seed as i64);

    let sd_config = StableDiffusionConfig::v1_5(cfg.weights.sliced_attention_size);
    let records = dataset::load_records(
        &cfg.data.data_dir,
        &cfg.data.csv_name,
        &cfg.data.image_column,
        &cfg.data.caption_column,
    )?;
    let tokenizer = dataset::PromptTokenizer::create(&cfg.data.vocab_file, &sd_config.clip)?;
    let samples = dataset::tokenize_records(&tokenizer, &records)?;
    let (train, val) =
        dataset::train_test_split(samples, cfg.training.test_fraction, cfg.training.split_seed)?;
    let (train_seed, val_seed) = cfg.training.loader_seeds();
    let mut train_loader = DataLoader::new(train, cfg.training.loader_config(train_seed))?;
    let mut val_loader = DataLoader::new(val, cfg.training.val_loader_config(val_seed))?;
    tracing::info!(
        "{} training samples in {} batches, {} validation samples in {} batches",
        train_loader.num_samples(),
        train_loader.num_batches(),
        val_loader.num_samples(),
        val_loader.num_batches()
    );

    let clip_weights = ModelFile::Clip.get(cfg.weights.clip_weights.clone(), &cfg.weights.repo)?;
    let vae_weights = ModelFile::Vae.get(cfg.weights.vae_weights.clone(), &cfg.weights.repo)?;
    let unet_weights = ModelFile::Unet.get(cfg.weights.unet_weights.clone(), &cfg.weights.repo)?;
    let text_encoder = TextEncoder::new(&sd_config, clip_weights, devices.get("clip"))?;
    tracing::info!("building the autoencoder");
    let vae = sd_config.build_vae(vae_weights, devices.get("vae"))?;
    tracing::info!("building the unet");
    let (unet, unet_vs) = sd_config.build_unet(unet_weights, devices.get("unet"))?;
    let noise_scheduler = NoiseScheduler::new(cfg.noise_scheduler, devices.get("unet"));
    let mut trainer =
        Trainer::new(unet, unet_vs, vae, noise_scheduler, cfg.trainer, cfg.training.seed)?;

    let mut callbacks: Vec<Box<dyn Callback>> = vec![
        Box::new(ModelCheckpoint::new(
            cfg.output.checkpoint.clone(),
            cfg.output.monitor,
            cfg.output.save_best_only,
        )),
        Box::new(CsvLogger::new(&cfg.output.metrics)?),
    ];
    let history = fit::fit(
        &mut trainer,
        &text_encoder,
        &mut train_loader,
        &mut val_loader,
        cfg.training.epochs,
        &mut callbacks,
    )?;
    LossCurve::default().save(
        &cfg.output.loss_curve,
        &history.train_losses(),
        &history.val_losses(),
    )?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let level = if args.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();
    run(args)
}
