use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser, Subcommand};
use log::LevelFilter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use neardup::config::{Config, EncoderKind};
use neardup::core::clip::{ClipConfig, load_encoder};
use neardup::core::duplicate::{DuplicateDetector, MatchOptions, group_pairs};
use neardup::core::embedding::{EmbeddingExtractor, EncoderHandle, ThumbnailEncoder};
use neardup::core::fingerprint::{DuplicateReport, FingerprintRecord, HashKind};
use neardup::core::hash::HashExtractor;
use neardup::core::similarity::{
    ComparisonMode, HashAggregate, SimilarityEngine, cosine_similarity, hash_similarity,
};
use neardup::services::scanner::{Fingerprinter, Ingestor, discover_images};
use neardup::services::store::FingerprintStore;

#[derive(Parser, Debug)]
#[command(
    name = "neardup",
    version,
    about = "Find near-duplicate images by perceptual hash and embedding similarity"
)]
struct Cli {
    /// Config file (default: `<config_dir>/neardup/config.json`)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Fingerprint store file
    #[arg(long, global = true, value_name = "FILE")]
    store: Option<PathBuf>,

    /// Embedding encoder: clip, thumbnail or none
    #[arg(long, global = true)]
    encoder: Option<EncoderKind>,

    /// ONNX vision model for the clip encoder
    #[arg(long, global = true, value_name = "FILE")]
    model: Option<PathBuf>,

    /// Increase log verbosity (default info, -v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fingerprint every image under a directory and store the results
    Ingest {
        /// Directory to scan
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        /// Re-fingerprint files whose content has not changed
        #[arg(long)]
        force: bool,
    },

    /// List near-duplicate pairs among stored fingerprints
    Duplicates {
        /// Minimum similarity in [0, 1]
        #[arg(short, long)]
        threshold: Option<f64>,
        /// Signal to compare: auto, embedding or hash
        #[arg(long)]
        mode: Option<ComparisonMode>,
        /// How hash kinds are combined: mean or best
        #[arg(long)]
        aggregate: Option<HashAggregate>,
        /// Give up after this many seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
        /// Print `{"duplicates": [...]}` JSON
        #[arg(long, conflicts_with = "groups")]
        json: bool,
        /// Merge pairs into connected groups
        #[arg(long)]
        groups: bool,
    },

    /// Show stored fingerprints
    List {
        #[arg(long)]
        json: bool,
    },

    /// Fingerprint two images and print how similar they are
    Compare { first: PathBuf, second: PathBuf },

    /// Show store location, record count and encoder status
    Info,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = resolve_config(&cli)?;

    match cli.command {
        Commands::Ingest { path, force } => ingest(&config, &path, force),

        Commands::Duplicates {
            threshold,
            mode,
            aggregate,
            timeout,
            json,
            groups,
        } => {
            let mut config = config;
            if let Some(t) = threshold {
                config.threshold = t;
            }
            if let Some(m) = mode {
                config.mode = m;
            }
            if let Some(a) = aggregate {
                config.hash_aggregate = a;
            }
            if timeout.is_some() {
                config.timeout_secs = timeout;
            }
            config.validate()?;
            duplicates(&config, json, groups)
        }

        Commands::List { json } => list(&config, json),
        Commands::Compare { first, second } => compare(&config, &first, &second),
        Commands::Info => info(&config),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.as_str()))
        .format_timestamp(None)
        .init();
}

/// Config file first, then global flags on top.
fn resolve_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(store) = &cli.store {
        config.store_path = Some(store.clone());
    }
    if let Some(encoder) = cli.encoder {
        config.encoder = encoder;
    }
    if let Some(model) = &cli.model {
        config.model_path = Some(model.clone());
    }
    config.validate()?;
    Ok(config)
}

fn open_store(config: &Config) -> Result<FingerprintStore> {
    let path = match &config.store_path {
        Some(p) => p.clone(),
        None => FingerprintStore::default_path()?,
    };
    FingerprintStore::open(&path)
        .with_context(|| format!("Failed to open fingerprint store {:?}", path))
}

fn encoder_handle(config: &Config) -> Option<Arc<EncoderHandle>> {
    match config.encoder {
        EncoderKind::None => None,
        EncoderKind::Thumbnail => Some(Arc::new(EncoderHandle::ready(ThumbnailEncoder::new()))),
        EncoderKind::Clip => {
            let clip = ClipConfig::new(config.model_path.clone().unwrap_or_default());
            Some(Arc::new(EncoderHandle::lazy(move || load_encoder(&clip))))
        }
    }
}

fn fingerprinter(config: &Config) -> Fingerprinter {
    Fingerprinter::new(
        HashExtractor::new(config.hash_size),
        encoder_handle(config).map(EmbeddingExtractor::new),
    )
}

fn ingest(config: &Config, dir: &Path, force: bool) -> Result<()> {
    println!("▶ Scanning for images in: {}", dir.display());
    let paths = discover_images(dir, &config.extensions)
        .with_context(|| format!("Failed to scan {:?}", dir))?;
    if paths.is_empty() {
        println!("No images found.");
        return Ok(());
    }

    let store = open_store(config)?;
    let existing = store.load()?;

    let ingestor = Ingestor::new(fingerprinter(config))
        .with_progress(true)
        .with_force(force);
    let outcome = benchmark("fingerprinting", || ingestor.ingest(&paths, &existing))
        .context("Ingestion aborted")?;

    let summary = store
        .upsert_all(outcome.records)
        .with_context(|| format!("Failed to write {:?}", store.path()))?;

    println!(
        "✅ {} new, {} updated, {} unchanged, {} rejected → {}",
        summary.inserted,
        summary.replaced,
        outcome.unchanged,
        outcome.rejected.len(),
        store.path().display()
    );
    for rejection in &outcome.rejected {
        eprintln!("⚠️  {}", rejection.error);
    }
    Ok(())
}

fn duplicates(config: &Config, json: bool, groups: bool) -> Result<()> {
    let store = open_store(config)?;
    let records = store.load()?;

    let detector = DuplicateDetector::new(MatchOptions {
        threshold: config.threshold,
        engine: SimilarityEngine::new(config.mode, config.hash_aggregate),
        deadline: config.timeout_secs.map(Duration::from_secs),
        ..MatchOptions::default()
    });
    let pairs = benchmark("matching", || detector.find_duplicates(&records))?;

    if json {
        let report = DuplicateReport { duplicates: pairs };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if pairs.is_empty() {
        println!("No duplicates found.");
        return Ok(());
    }

    if groups {
        let groups = group_pairs(&pairs);
        println!("Found {} duplicate group(s):", groups.len());
        for (i, group) in groups.iter().enumerate() {
            println!(" Group {}:", i + 1);
            for file in group {
                println!("   ▶ {}", file);
            }
        }
    } else {
        println!("Found {} duplicate pair(s):", pairs.len());
        for pair in &pairs {
            println!("  {:.4}  {}  ↔  {}", pair.score, pair.image1, pair.image2);
        }
    }
    Ok(())
}

fn list(config: &Config, json: bool) -> Result<()> {
    let records = open_store(config)?.load()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    println!("🗂️  {} fingerprint(s):", records.len());
    for record in &records {
        let hashes: Vec<&str> = HashKind::ALL
            .iter()
            .filter(|kind| record.hash(**kind).is_some())
            .map(|kind| kind.short_name())
            .collect();
        let embedding = record
            .embedding()
            .map(|e| format!("{}-d", e.len()))
            .unwrap_or_else(|| "none".to_string());
        println!(
            "[{}] {}\n     hashes: {}\n     embedding: {}\n     added: {}\n",
            record.id,
            record.filename,
            if hashes.is_empty() { "none".to_string() } else { hashes.join(", ") },
            embedding,
            record.created_at.to_rfc3339()
        );
    }
    Ok(())
}

fn compare(config: &Config, first: &Path, second: &Path) -> Result<()> {
    let fingerprinter = fingerprinter(config);
    let a = fingerprinter.fingerprint_file(first)?;
    let b = fingerprinter.fingerprint_file(second)?;

    let engine = SimilarityEngine::new(config.mode, config.hash_aggregate);
    print_signals(&a, &b)?;
    match engine.compare(&a, &b)? {
        Some(score) => {
            let verdict = if score >= config.threshold { "duplicate" } else { "distinct" };
            println!(
                "score ({}): {:.4} → {} at threshold {}",
                config.mode, score, verdict, config.threshold
            );
        }
        None => bail!("The two images share no comparable signal in {} mode", config.mode),
    }
    Ok(())
}

fn print_signals(a: &FingerprintRecord, b: &FingerprintRecord) -> Result<()> {
    if let (Some(x), Some(y)) = (a.embedding(), b.embedding()) {
        println!("  embedding: {:.4}", cosine_similarity(x, y)?);
    }
    for kind in HashKind::ALL {
        if let (Some(x), Some(y)) = (a.hash(kind), b.hash(kind)) {
            println!("  {}: {:.4}", kind, hash_similarity(kind, x, y)?);
        }
    }
    Ok(())
}

fn info(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    println!("store:     {}", store.path().display());
    println!("records:   {}", store.len()?);
    println!("threshold: {}", config.threshold);
    println!("mode:      {}", config.mode);

    match encoder_handle(config) {
        None => println!("encoder:   disabled (hash-only)"),
        Some(handle) => match handle.name() {
            Ok(name) => println!("encoder:   {} (ready)", name),
            Err(e) => println!("encoder:   {} unavailable: {}", config.encoder, e),
        },
    }
    Ok(())
}

/// Run `f()`, log how long it took (with `label`), and return its result.
fn benchmark<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    log::info!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}
