use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use renderer::CHANNEL_COUNT;
use scheduler::Priority;

#[derive(Parser, Debug)]
#[command(
    name = "shaderbot",
    author,
    version,
    about = "Render ShaderToy-style shaders into cached animated previews"
)]
pub struct Cli {
    /// Pipeline configuration (TOML). Defaults to `pipeline.toml` in the config directory.
    #[arg(long, global = true, value_name = "FILE", env = "SHADERBOT_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compile and render one or more shader files.
    Render(RenderArgs),
    /// Run the static checks on shader files without rendering them.
    Validate(ValidateArgs),
    /// Inspect or prune the result cache.
    Cache(CacheCommand),
    /// Print resolved configuration and cache directories.
    Where,
}

#[derive(Args, Debug)]
pub struct RenderArgs {
    /// Fragment shader sources defining `mainImage`.
    #[arg(value_name = "FILE", required = true)]
    pub files: Vec<PathBuf>,

    /// Queue priority: `high`, `normal` or `low`.
    #[arg(long, value_name = "LEVEL", default_value_t = Priority::Normal)]
    pub priority: Priority,

    /// Name recorded against the jobs in metrics and progress.
    #[arg(long, value_name = "NAME", env = "SHADERBOT_REQUESTER")]
    pub requester: Option<String>,

    /// Metrics bucket for the jobs (e.g. `preset`, `custom`).
    #[arg(long, value_name = "KIND", default_value = "custom")]
    pub kind: String,

    /// Override the configured render size (e.g. `640x360`).
    #[arg(long, value_name = "WIDTHxHEIGHT", value_parser = parse_size)]
    pub size: Option<(u32, u32)>,

    /// Bind a texture to `iChannelN` (e.g. `0=noise.png`). Repeatable.
    #[arg(long = "channel", value_name = "N=PATH", value_parser = parse_channel)]
    pub channels: Vec<(usize, PathBuf)>,

    /// Constant `iMouse` value as `x,y[,z,w]`.
    #[arg(long, value_name = "X,Y[,Z,W]", value_parser = parse_pointer)]
    pub pointer: Option<[f32; 4]>,

    /// Print the pipeline statistics snapshot as JSON once every job finishes.
    #[arg(long)]
    pub stats: bool,
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    #[arg(value_name = "FILE", required = true)]
    pub files: Vec<PathBuf>,

    /// Emit one JSON report per file instead of plain text.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct CacheCommand {
    #[command(subcommand)]
    pub action: CacheAction,
}

#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// Delete entries older than `cache.max_age`.
    Sweep,
    /// Drop one entry so the next request re-renders it.
    Invalidate {
        #[arg(value_name = "FINGERPRINT")]
        fingerprint: String,
    },
    /// Print the cached artifact for a fingerprint, if it is still fresh.
    Show {
        #[arg(value_name = "FINGERPRINT")]
        fingerprint: String,
    },
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn parse_size(value: &str) -> Result<(u32, u32), String> {
    let (w, h) = value
        .trim()
        .split_once(['x', 'X'])
        .ok_or_else(|| "expected WIDTHxHEIGHT".to_string())?;
    let width = w
        .trim()
        .parse::<u32>()
        .map_err(|_| format!("invalid width '{}'", w.trim()))?;
    let height = h
        .trim()
        .parse::<u32>()
        .map_err(|_| format!("invalid height '{}'", h.trim()))?;
    if width == 0 || height == 0 {
        return Err("render size must be greater than zero".into());
    }
    Ok((width, height))
}

pub fn parse_channel(value: &str) -> Result<(usize, PathBuf), String> {
    let (index, path) = value
        .split_once('=')
        .ok_or_else(|| "expected N=PATH (e.g. 0=noise.png)".to_string())?;
    let index = index
        .trim()
        .parse::<usize>()
        .map_err(|_| format!("invalid channel index '{}'", index.trim()))?;
    if index >= CHANNEL_COUNT {
        return Err(format!(
            "channel {index} out of range; expected 0-{}",
            CHANNEL_COUNT - 1
        ));
    }
    let path = path.trim();
    if path.is_empty() {
        return Err("channel texture path must not be empty".into());
    }
    Ok((index, PathBuf::from(path)))
}

pub fn parse_pointer(value: &str) -> Result<[f32; 4], String> {
    let parts = value
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<f32>()
                .map_err(|_| format!("invalid pointer component '{}'", part.trim()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    match parts.as_slice() {
        [x, y] => Ok([*x, *y, 0.0, 0.0]),
        [x, y, z, w] => Ok([*x, *y, *z, *w]),
        _ => Err("pointer expects two or four comma-separated numbers".into()),
    }
}
