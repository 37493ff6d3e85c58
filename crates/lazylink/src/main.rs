use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use lazylink_host::{BundleDir, HostSurface};
use lazylink_runtime::config::parse_timeout_ms;
use lazylink_runtime::{HostCapabilities, Runtime, RuntimeConfig};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lazylink")]
#[command(about = "Boot a lazily linked bundle against a headless host.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load the bundle's entry unit, then advance host intervals.
    Run(RunArgs),
    /// Print the bundle manifest's chunks and binary modules as JSON.
    Inspect(InspectArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, value_name = "DIR")]
    bundle: PathBuf,

    /// URL prefix of every resource (overrides LAZYLINK_PUBLIC_PATH).
    #[arg(long)]
    public_path: Option<String>,

    /// Chunk script timeout (overrides LAZYLINK_CHUNK_TIMEOUT_MS).
    #[arg(long, value_name = "MS", value_parser = timeout_arg)]
    timeout_ms: Option<u64>,

    /// Content-security nonce for injected scripts (overrides LAZYLINK_SCRIPT_NONCE).
    #[arg(long)]
    nonce: Option<String>,

    /// Interval ticks to run after the entry loaded.
    #[arg(long, default_value_t = 0)]
    ticks: u32,

    #[arg(long, default_value_t = 16)]
    tick_ms: u64,

    /// Buffer binary payloads instead of streaming them into the compiler.
    #[arg(long)]
    buffered: bool,

    /// Seed the document with an element before booting, e.g. `canvas#canvas`.
    #[arg(long = "element", value_name = "TAG#ID")]
    elements: Vec<String>,
}

#[derive(Args)]
struct InspectArgs {
    #[arg(long, value_name = "DIR")]
    bundle: PathBuf,

    #[arg(long, default_value = "")]
    public_path: String,
}

fn timeout_arg(raw: &str) -> std::result::Result<u64, String> {
    parse_timeout_ms(raw).map_err(|err| format!("{err:#}"))
}

fn main() -> ExitCode {
    init_tracing();
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args),
        Command::Inspect(args) => inspect(args),
    }
}

fn parse_element(raw: &str) -> Result<(&str, &str)> {
    match raw.split_once('#') {
        Some((tag, id)) if !tag.is_empty() && !id.is_empty() => Ok((tag, id)),
        _ => anyhow::bail!("invalid --element {raw:?}: expected TAG#ID"),
    }
}

fn run(args: RunArgs) -> Result<ExitCode> {
    let mut config = RuntimeConfig::from_env()?;
    if let Some(public_path) = args.public_path {
        config = config.with_public_path(public_path);
    }
    if let Some(ms) = args.timeout_ms {
        config = config.with_chunk_timeout(Duration::from_millis(ms));
    }
    if let Some(nonce) = args.nonce {
        config = config.with_nonce(nonce);
    }

    let mut surface = HostSurface::new();
    for raw in &args.elements {
        let (tag, id) = parse_element(raw)?;
        surface = surface.with_element(tag, id);
    }
    let surface = Rc::new(surface);
    let capabilities = if args.buffered {
        HostCapabilities::BUFFERED_ONLY
    } else {
        HostCapabilities::FULL
    };
    let bundle = Rc::new(
        BundleDir::open(&args.bundle)?
            .with_public_path(&config.public_path)
            .with_surface(surface.clone())
            .with_capabilities(capabilities),
    );

    let runtime = Runtime::new(config, bundle.manifest().clone(), bundle.clone(), bundle);
    let executor = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .context("build tokio runtime")?;

    if executor.block_on(runtime.start()).is_none() {
        return Ok(ExitCode::from(1));
    }

    let mut callbacks = 0;
    for tick in 0..args.ticks {
        match surface.advance(args.tick_ms) {
            Ok(fired) => callbacks += fired,
            Err(err) => {
                tracing::error!(tick, "interval callback failed: {err:#}");
                return Ok(ExitCode::from(1));
            }
        }
    }
    tracing::debug!(ticks = args.ticks, callbacks, "run finished");

    let registry = runtime.registry();
    let summary = json!({
        "entry": "loaded",
        "units": registry.unit_ids(),
        "binary_modules": registry.binary_module_ids(),
        "strategy": runtime.strategy().as_str(),
        "ticks": args.ticks,
        "callbacks": callbacks,
        "now_ms": surface.now_ms(),
        "console": surface.console(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(ExitCode::SUCCESS)
}

fn inspect(args: InspectArgs) -> Result<ExitCode> {
    let bundle = BundleDir::open(&args.bundle)?;
    let manifest = bundle.manifest();
    let public_path = args.public_path.as_str();

    let chunks: Vec<_> = manifest
        .chunks
        .iter()
        .map(|(id, chunk)| {
            json!({
                "id": id,
                "src": manifest.chunk_script_src(public_path, id),
                "binary_modules": chunk.binary_modules,
            })
        })
        .collect();
    let modules: Vec<_> = manifest
        .binary_modules
        .iter()
        .map(|(id, module)| {
            json!({
                "id": id,
                "src": manifest.binary_module_src(public_path, id),
                "namespaces": module.imports.keys().collect::<Vec<_>>(),
                "imports": module.imports.values().map(|ns| ns.functions.len()).sum::<usize>(),
            })
        })
        .collect();

    let doc = json!({
        "entry": manifest.entry,
        "preloaded_chunks": manifest.preloaded_chunks,
        "chunks": chunks,
        "binary_modules": modules,
    });
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(ExitCode::SUCCESS)
}
