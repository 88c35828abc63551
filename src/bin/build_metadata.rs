// Writes the caption metadata of a directory of spectrogram images, one
// `file_name,text` row per image, all sharing the same caption.
//
//   cargo run --bin build-metadata -- --dir new_itt_spec_3c --output metadata.csv
use clap::Parser;
use riffusion_finetune::metadata;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The directory holding the images.
    #[arg(long, default_value = "new_itt_spec_3c")]
    dir: String,

    /// Extension of the image files.
    #[arg(long, default_value = "png")]
    extension: String,

    /// The caption given to every image.
    #[arg(long, default_value = metadata::DEFAULT_CAPTION)]
    caption: String,

    #[arg(long, value_name = "FILE", default_value = "metadata.csv")]
    output: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();
    let records = metadata::collect_records(&args.dir, &args.extension, &args.caption)?;
    metadata::write_records(&args.output, &records)?;
    Ok(())
}
