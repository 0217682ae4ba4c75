use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use pipeconfig::PipelineConfig;
use pipeline::{
    validate, CompileHandle, CompileOptions, Fingerprint, PipelineError, ResultCache,
    ShaderPipeline,
};
use renderer::{GpuEngine, LaunchFlags};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::{CacheAction, RenderArgs, ValidateArgs};
use crate::paths::AppPaths;

pub fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Explicit `--config` wins, then `pipeline.toml` in the config directory,
/// then built-in defaults. Relative cache roots are anchored in the cache dir.
pub fn load_config(explicit: Option<&Path>, paths: &AppPaths) -> Result<PipelineConfig> {
    let mut config = match explicit {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => {
            let candidate = paths.config_file();
            if candidate.is_file() {
                info!(path = %candidate.display(), "using pipeline configuration");
                PipelineConfig::load(&candidate)
                    .with_context(|| format!("failed to load {}", candidate.display()))?
            } else {
                PipelineConfig::default()
            }
        }
    };
    config.cache.root = paths.resolve_cache_root(&config.cache.root);
    if let Some(work_dir) = config.render.work_dir.take() {
        config.render.work_dir = Some(paths.resolve_cache_root(&work_dir));
    }
    Ok(config)
}

fn launch_flags(config: &PipelineConfig) -> LaunchFlags {
    LaunchFlags {
        software_rasterizer: config.pool.software_rasterizer,
        max_viewport: config.pool.max_viewport,
        debug_layers: false,
    }
}

fn compile_options(args: &RenderArgs) -> Result<CompileOptions> {
    let mut options = CompileOptions {
        kind: args.kind.clone(),
        resolution: args.size,
        pointer: args.pointer.unwrap_or([0.0; 4]),
        ..CompileOptions::default()
    };
    if let Some(requester) = &args.requester {
        options = options.requested_by(requester.clone());
    }
    for (index, path) in &args.channels {
        if !path.is_file() {
            bail!("texture for iChannel{index} not found at {}", path.display());
        }
        options.channels.set_texture(*index, path.clone())?;
    }
    Ok(options)
}

fn read_source(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read shader {}", path.display()))
}

pub async fn render(config: PipelineConfig, args: RenderArgs) -> Result<ExitCode> {
    let options = compile_options(&args)?;
    let engine = GpuEngine::new(launch_flags(&config));
    let pipeline = ShaderPipeline::new(engine, config)?;

    let mut failed = 0usize;
    let mut pending: Vec<(PathBuf, CompileHandle)> = Vec::new();
    for path in &args.files {
        let source = read_source(path)?;
        match pipeline.submit(source, options.clone(), args.priority) {
            Ok(handle) => {
                info!(job = handle.id(), file = %path.display(), "queued shader");
                pending.push((path.clone(), handle));
            }
            Err(PipelineError::Validation(errors)) => {
                failed += 1;
                println!("{}: rejected", path.display());
                for error in errors {
                    println!("  error: {error}");
                }
            }
            Err(err) => return Err(err.into()),
        }
    }

    for (path, handle) in pending {
        match handle.await {
            Ok(output) => {
                let origin = if output.from_cache {
                    "cache hit".to_string()
                } else {
                    format!("rendered in {}ms", output.metadata.compile_time_ms)
                };
                println!(
                    "{}: {} -> {} ({origin}, {} frames at {}x{})",
                    path.display(),
                    output.fingerprint.short(),
                    output.artifact.display(),
                    output.metadata.frame_count,
                    output.metadata.width,
                    output.metadata.height,
                );
                if !output.cached {
                    warn!(file = %path.display(), "artifact was not stored in the cache");
                }
                for warning in &output.warnings {
                    println!("  warning: {warning}");
                }
            }
            Err(err) => {
                failed += 1;
                println!("{}: failed: {err}", path.display());
            }
        }
    }

    if args.stats {
        println!("{}", serde_json::to_string_pretty(&pipeline.stats())?);
    }
    pipeline.shutdown().await;

    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ValidationSummary<'a> {
    file: &'a Path,
    fingerprint: Fingerprint,
    valid: bool,
    errors: &'a [String],
    warnings: &'a [String],
}

pub fn validate_files(config: &PipelineConfig, args: &ValidateArgs) -> Result<ExitCode> {
    let mut invalid = 0usize;
    for path in &args.files {
        let source = read_source(path)?;
        let report = validate(&source);
        let fingerprint = CompileOptions::default().fingerprint(&source, config.cache.key_scope);
        if !report.is_valid() {
            invalid += 1;
        }

        if args.json {
            let summary = ValidationSummary {
                file: path,
                fingerprint,
                valid: report.is_valid(),
                errors: &report.errors,
                warnings: &report.warnings,
            };
            println!("{}", serde_json::to_string(&summary)?);
            continue;
        }

        let verdict = if report.is_valid() { "ok" } else { "invalid" };
        println!("{}: {verdict} ({})", path.display(), fingerprint.short());
        for error in &report.errors {
            println!("  error: {error}");
        }
        for warning in &report.warnings {
            println!("  warning: {warning}");
        }
    }

    Ok(if invalid == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

pub fn cache(config: &PipelineConfig, action: CacheAction) -> Result<ExitCode> {
    let cache = ResultCache::open(config.cache.root.clone(), config.cache.max_age)?;
    match action {
        CacheAction::Sweep => {
            let removed = cache.sweep_expired()?;
            println!(
                "Removed {removed} expired entr{} from {}",
                if removed == 1 { "y" } else { "ies" },
                cache.root().display()
            );
            Ok(ExitCode::SUCCESS)
        }
        CacheAction::Invalidate { fingerprint } => {
            let fingerprint = Fingerprint::from_hex(&fingerprint)?;
            if cache.invalidate(&fingerprint)? {
                println!("Invalidated {fingerprint}");
            } else {
                println!("No cache entry for {fingerprint}");
            }
            Ok(ExitCode::SUCCESS)
        }
        CacheAction::Show { fingerprint } => {
            let fingerprint = Fingerprint::from_hex(&fingerprint)?;
            match cache.lookup(&fingerprint)? {
                Some(entry) => {
                    println!("{}", serde_json::to_string_pretty(&entry)?);
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    println!("No fresh cache entry for {fingerprint}");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}

pub fn describe_paths(paths: &AppPaths, config: &PipelineConfig) {
    let config_file = paths.config_file();
    println!("Directories:");
    println!("  config:     {}", paths.config_dir().display());
    println!(
        "  config file: {}{}",
        config_file.display(),
        if config_file.is_file() { "" } else { " (absent)" }
    );
    println!("  cache:      {}", config.cache.root.display());
    println!("  work:       {}", config.work_dir().display());
    println!("Pipeline:");
    println!("  sessions:   {}", config.pool.max_instances);
    println!("  concurrent: {}", config.queue.max_concurrent);
    println!("  attempts:   {}", config.queue.attempts);
}
