use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "parallax")]
#[command(author, version, about = "Stereoscopic video transcoder and playback cache")]
pub struct Cli {
    /// Path to config file (JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the cache directory
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Conversion settings shared by `convert` and `play`.
#[derive(Args, Debug, Clone)]
pub struct SettingsArgs {
    /// Stereo layout of the source (sbs, ou, hsbs, hou)
    #[arg(long, default_value = "sbs")]
    pub format: String,

    /// Swap which region is treated as the left eye
    #[arg(long)]
    pub reversed: bool,

    /// Horizontal field of view in degrees
    #[arg(long, default_value_t = 90.0)]
    pub fov: f64,

    /// Horizontal disparity adjustment
    #[arg(long, default_value_t = 200.0)]
    pub disparity: f64,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Detect the stereo layout from catalog tags
    Detect {
        /// Free-text tags, e.g. "3D" "Half SBS"
        #[arg(required = true)]
        tags: Vec<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show per-eye output dimensions for a source size
    Dims {
        /// Stereo layout (sbs, ou, hsbs, hou)
        #[arg(long, default_value = "sbs")]
        format: String,

        width: u32,
        height: u32,
    },

    /// Convert a local combined stereo file into a two-layer output with ffmpeg
    Convert {
        #[arg(required = true)]
        input: PathBuf,

        #[arg(required = true)]
        output: PathBuf,

        #[command(flatten)]
        settings: SettingsArgs,
    },

    /// Run the full download, convert, and cache pipeline for a source
    Play {
        /// Source URL (http, https, or file)
        #[arg(required = true)]
        url: String,

        /// Catalog id of the source
        #[arg(long)]
        id: String,

        /// Combined source width, if known
        #[arg(long, default_value_t = 0)]
        width: u32,

        /// Combined source height, if known
        #[arg(long, default_value_t = 0)]
        height: u32,

        /// Bearer token sent with source requests
        #[arg(long, env = "PARALLAX_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Use the synthetic backend instead of ffmpeg
        #[arg(long)]
        synthetic: bool,

        #[command(flatten)]
        settings: SettingsArgs,
    },

    /// Probe a remote source for byte-range support and show its chunk plan
    ProbeStream {
        #[arg(required = true)]
        url: String,

        /// Bearer token sent with source requests
        #[arg(long, env = "PARALLAX_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Source duration in seconds, if known
        #[arg(long)]
        duration: Option<f64>,
    },

    /// Inspect or manage the stereo cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Check that required external tools are available
    CheckTools,

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses --config if not specified)
        config: Option<PathBuf>,
    },

    /// Run the pipeline end to end against the synthetic backend
    Selftest,
}

#[derive(Subcommand)]
pub enum CacheAction {
    /// Show entry count and disk usage
    Stats,
    /// List cached entries
    List,
    /// Evict least recently used entries until under budget
    Evict,
    /// Remove every entry
    Clear,
    /// Remove one entry
    Remove {
        /// Source id
        id: String,
        /// Settings key, e.g. sbs_n_90_200
        key: String,
    },
}
