use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;

use maxwell_filter::calibration::FineCalibration;
use maxwell_filter::crosstalk::CrossTalk;
use maxwell_filter::pose::HeadPosition;
use maxwell_filter::{maxwell_filter, Destination, MaxwellParams, Origin, Recording};

#[derive(Parser, Debug)]
#[command(name = "maxwell_filter")]
#[command(about = "Maxwell filter (SSS / tSSS) for MEG recordings", long_about = None)]
struct Args {
    /// Recording, *.json[.gz]
    #[arg(long)]
    input: PathBuf,

    /// Filtered recording, *.json[.gz]
    #[arg(long)]
    output: PathBuf,

    /// Base options (MaxwellParams as JSON); flags below override it
    #[arg(long)]
    params: Option<PathBuf>,

    /// Expansion origin: "auto" or "x,y,z" in meters
    #[arg(long)]
    origin: Option<String>,

    /// Order of the internal expansion
    #[arg(long)]
    int_order: Option<usize>,

    /// Order of the external expansion
    #[arg(long)]
    ext_order: Option<usize>,

    /// Fine-calibration text file
    #[arg(long)]
    calibration: Option<PathBuf>,

    /// Cross-talk matrix, *.json[.gz]
    #[arg(long)]
    cross_talk: Option<PathBuf>,

    /// tSSS buffer length in seconds
    #[arg(long)]
    st_duration: Option<f64>,

    /// tSSS subspace correlation limit
    #[arg(long)]
    st_correlation: Option<f64>,

    /// Coordinate frame (head, meg)
    #[arg(long)]
    coord_frame: Option<String>,

    /// Destination device -> head translation "x,y,z" in meters
    #[arg(long)]
    destination: Option<String>,

    /// Regularization (in, none)
    #[arg(long)]
    regularize: Option<String>,

    /// Leave reference channels out of the expansion
    #[arg(long, default_value_t = false)]
    ignore_ref: bool,

    /// Ill-conditioning policy (error, warning, ignore)
    #[arg(long)]
    bad_condition: Option<String>,

    /// Head positions, (N, 10) rows as *.json[.gz]
    #[arg(long)]
    head_pos: Option<PathBuf>,

    /// Run tSSS per head position segment, after movement compensation
    #[arg(long, default_value_t = false)]
    st_moving: bool,

    /// Apply only the temporal projection
    #[arg(long, default_value_t = false)]
    st_only: bool,

    /// Magnetometer gain: a number or "auto"
    #[arg(long)]
    mag_scale: Option<String>,
}

fn open_maybe_gz(path: &Path) -> anyhow::Result<Box<dyn Read>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        Ok(Box::new(BufReader::new(GzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

fn load_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let reader = open_maybe_gz(path)?;
    serde_json::from_reader(reader).with_context(|| format!("parsing {}", path.display()))
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        let mut gz = GzEncoder::new(BufWriter::new(file), Compression::default());
        serde_json::to_writer(&mut gz, value)?;
        gz.finish()?.flush()?;
    } else {
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, value)?;
        writer.flush()?;
    }
    Ok(())
}

fn parse_vec3(text: &str) -> anyhow::Result<[f64; 3]> {
    let vals = text
        .split(',')
        .map(|tok| tok.trim().parse::<f64>())
        .collect::<Result<Vec<f64>, _>>()
        .with_context(|| format!("\"{text}\" is not a list of numbers"))?;
    match vals.as_slice() {
        [x, y, z] => Ok([*x, *y, *z]),
        _ => anyhow::bail!("expected 3 comma separated values, got \"{text}\""),
    }
}

fn build_params(args: &Args) -> anyhow::Result<MaxwellParams> {
    let mut params: MaxwellParams = match &args.params {
        Some(path) => load_json(path)?,
        None => MaxwellParams::default(),
    };
    if let Some(origin) = &args.origin {
        params.origin = match origin.as_str() {
            "auto" => Origin::Auto,
            other => Origin::Fixed(parse_vec3(other)?),
        };
    }
    if let Some(order) = args.int_order {
        params.int_order = order;
    }
    if let Some(order) = args.ext_order {
        params.ext_order = order;
    }
    if let Some(path) = &args.calibration {
        params.calibration = Some(FineCalibration::read(path)?);
    }
    if let Some(path) = &args.cross_talk {
        let ctc: CrossTalk = load_json(path)?;
        ctc.check_shape()?;
        params.cross_talk = Some(ctc);
    }
    if args.st_duration.is_some() {
        params.st_duration = args.st_duration;
    }
    if let Some(corr) = args.st_correlation {
        params.st_correlation = corr;
    }
    if let Some(frame) = &args.coord_frame {
        params.coord_frame = frame.parse()?;
    }
    if let Some(dest) = &args.destination {
        params.destination = Some(Destination::Translation(parse_vec3(dest)?));
    }
    if let Some(mode) = &args.regularize {
        params.regularize = mode.parse()?;
    }
    if let Some(policy) = &args.bad_condition {
        params.bad_condition = policy.parse()?;
    }
    if let Some(path) = &args.head_pos {
        let rows: Vec<Vec<f64>> = load_json(path)?;
        params.head_pos = Some(HeadPosition::from_rows(&rows)?);
    }
    if let Some(scale) = &args.mag_scale {
        params.mag_scale = scale.parse()?;
    }
    params.ignore_ref |= args.ignore_ref;
    params.st_fixed &= !args.st_moving;
    params.st_only |= args.st_only;
    Ok(params)
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let params = build_params(&args)?;
    let raw: Recording = load_json(&args.input)?;
    raw.check_consistency()?;

    let out = maxwell_filter(&raw, &params)?;
    save_json(&args.output, &out.raw)?;
    println!("{}", serde_json::to_string_pretty(&out.report)?);
    Ok(())
}
