mod cli;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{CacheAction, Cli, Commands, SettingsArgs};
use px_av::{
    detect, per_eye_dimensions, CodecBackend, EyeLayer, FfmpegBackend, SyntheticBackend, SyntheticOutput,
    SyntheticPattern, ToolRegistry, Transcoder,
};
use px_cache::DiskVideoCache;
use px_core::config::Config;
use px_core::{ConversionSettings, PlayerState, SourceDescriptor, StereoFormat};
use px_player::{HeadlessPlayerFactory, PlaybackCoordinator};
use px_stream::ChunkDownloader;
use tokio_util::sync::CancellationToken;

/// Chunks listed by `probe-stream` before eliding the rest.
const PLAN_PREVIEW: usize = 8;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG if set, otherwise pick a level from --verbose.
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "parallax=debug,px_core=debug,px_av=debug,px_cache=debug,px_stream=debug,px_player=debug".to_string()
        } else {
            "parallax=info,px_core=info,px_av=info,px_cache=info,px_stream=info,px_player=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load_or_default(cli.config.as_deref());
    if let Some(dir) = cli.cache_dir.clone() {
        config.cache.dir = dir;
    }
    for warning in config.validate() {
        tracing::warn!("Config: {warning}");
    }

    match cli.command {
        Commands::Detect { tags, json } => detect_tags(&tags, json),
        Commands::Dims { format, width, height } => dims(&format, width, height),
        Commands::Validate { config: path } => validate_config(path.or(cli.config).as_deref()),
        command => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_async(command, config))
        }
    }
}

async fn run_async(command: Commands, config: Config) -> Result<()> {
    match command {
        Commands::Convert { input, output, settings } => convert(&input, &output, &settings, &config).await,
        Commands::Play {
            url,
            id,
            width,
            height,
            token,
            synthetic,
            settings,
        } => {
            let mut source = SourceDescriptor::new(id, url, width, height);
            if let Some(token) = token {
                source = source.with_credential(token);
            }
            play(source, &settings, synthetic, &config).await
        }
        Commands::ProbeStream { url, token, duration } => probe_stream(url, token, duration, &config).await,
        Commands::Cache { action } => cache_command(action, &config).await,
        Commands::CheckTools => check_tools(&config).await,
        Commands::Selftest => selftest(&config).await,
        Commands::Detect { .. } | Commands::Dims { .. } | Commands::Validate { .. } => Ok(()),
    }
}

fn parse_settings(args: &SettingsArgs) -> Result<ConversionSettings> {
    let format: StereoFormat = args.format.parse()?;
    Ok(ConversionSettings::new(format, args.reversed, args.fov, args.disparity)?)
}

fn ffmpeg_backend(config: &Config) -> Arc<dyn CodecBackend> {
    let tools = ToolRegistry::discover(&config.tools);
    Arc::new(FfmpegBackend::new(tools, config.transcode.clone()))
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted; cancelling");
            token.cancel();
        }
    });
}

fn detect_tags(tags: &[String], json: bool) -> Result<()> {
    let detection = detect(tags);
    if json {
        println!("{}", serde_json::to_string_pretty(&detection)?);
        return Ok(());
    }
    match detection.format {
        Some(format) => println!("stereoscopic: yes ({format})"),
        None => println!("stereoscopic: no"),
    }
    Ok(())
}

fn dims(format: &str, width: u32, height: u32) -> Result<()> {
    let format: StereoFormat = format.parse()?;
    let (w, h) = per_eye_dimensions(format, width, height);
    println!("{w}x{h} per eye");
    Ok(())
}

async fn convert(input: &Path, output: &Path, args: &SettingsArgs, config: &Config) -> Result<()> {
    if !input.exists() {
        anyhow::bail!("Input file does not exist: {}", input.display());
    }
    let settings = parse_settings(args)?;
    let transcoder = Transcoder::new(ffmpeg_backend(config), config.transcode.clone());

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let written = transcoder
        .convert(
            input,
            &settings,
            output,
            |p| eprint!("\rconverting {:>5.1}%", p * 100.0),
            &cancel,
        )
        .await;
    eprintln!();

    let written = written.with_context(|| format!("converting {}", input.display()))?;
    println!("Output: {}", written.display());
    Ok(())
}

/// Drive a coordinator until it is playing or failed, printing progress.
async fn run_until_settled(coordinator: &PlaybackCoordinator) -> PlayerState {
    let mut rx = coordinator.subscribe_state();
    loop {
        let state = rx.borrow_and_update().clone();
        match &state {
            PlayerState::Playing | PlayerState::Error { .. } => return state,
            PlayerState::Downloading { .. } | PlayerState::Converting { .. } => eprint!("\r{state}    "),
            PlayerState::Idle | PlayerState::Paused => {}
        }
        if rx.changed().await.is_err() {
            return coordinator.state();
        }
    }
}

async fn build_coordinator(backend: Arc<dyn CodecBackend>, config: &Config) -> Result<PlaybackCoordinator> {
    let cache = DiskVideoCache::open(&config.cache, &config.transcode.container_extension).await?;
    let transcoder = Transcoder::new(backend, config.transcode.clone());
    Ok(PlaybackCoordinator::new(
        cache,
        transcoder,
        Arc::new(HeadlessPlayerFactory),
        config,
    )?)
}

async fn play(source: SourceDescriptor, args: &SettingsArgs, synthetic: bool, config: &Config) -> Result<()> {
    let settings = parse_settings(args)?;
    let backend: Arc<dyn CodecBackend> = if synthetic {
        Arc::new(SyntheticBackend::new())
    } else {
        ffmpeg_backend(config)
    };
    let coordinator = build_coordinator(backend, config).await?;

    let id = coordinator.play(source.clone(), settings).await;
    let state = tokio::select! {
        state = run_until_settled(&coordinator) => state,
        _ = tokio::signal::ctrl_c() => {
            coordinator.stop().await;
            eprintln!();
            anyhow::bail!("Interrupted");
        }
    };
    eprintln!();

    match state {
        PlayerState::Playing => {
            let player = coordinator.player().context("player missing after ready")?;
            println!("Session: {id}");
            println!("Key: {}_{}", source.id, settings.settings_key());
            println!("Output: {}", player.media_path().display());
            println!("Duration: {:.1}s", player.duration().as_secs_f64());
            coordinator.stop().await;
            Ok(())
        }
        PlayerState::Error { message } => {
            if let Some(failure) = coordinator.last_failure() {
                if failure.suggests_fallback {
                    eprintln!("Stereo playback is not possible for this source; play it in plain mode instead.");
                } else {
                    eprintln!("This failure may be temporary; try again.");
                }
            }
            coordinator.stop().await;
            anyhow::bail!("{message}")
        }
        other => anyhow::bail!("playback ended in unexpected state: {other}"),
    }
}

async fn probe_stream(url: String, token: Option<String>, duration: Option<f64>, config: &Config) -> Result<()> {
    let mut source = SourceDescriptor::new("probe", url, 0, 0);
    if let Some(token) = token {
        source = source.with_credential(token);
    }
    if let Some(secs) = duration.filter(|s| s.is_finite() && *s > 0.0) {
        source = source.with_duration(Duration::from_secs_f64(secs));
    }

    let chunker = ChunkDownloader::new(&config.download, config.chunked.clone())?;
    let info = chunker.probe(&source).await?;
    let count = chunker.chunk_count(&info);

    println!("Size: {} bytes", info.total_bytes);
    println!("Duration: {:.1}s (estimated)", info.estimated_duration.as_secs_f64());
    println!("Rate: {} bytes/s", info.estimated_bytes_per_second);
    println!("Chunks: {count} x {} bytes", chunker.bytes_per_chunk(&info));
    for index in 0..count.min(PLAN_PREVIEW) {
        if let Some(chunk) = chunker.byte_range_for_chunk(index, &info) {
            println!(
                "  [{index}] {} ({:.1}s){}",
                chunk.range_header(),
                chunk.estimated_duration.as_secs_f64(),
                if chunk.is_last { " last" } else { "" }
            );
        }
    }
    if count > PLAN_PREVIEW {
        println!("  ... {} more", count - PLAN_PREVIEW);
    }
    Ok(())
}

async fn cache_command(action: CacheAction, config: &Config) -> Result<()> {
    let cache = DiskVideoCache::open(&config.cache, &config.transcode.container_extension).await?;
    match action {
        CacheAction::Stats => {
            let stats = cache.stats().await?;
            println!("Cache: {}", cache.root().display());
            println!("Entries: {}", stats.entries);
            println!("Size: {} / {} bytes", stats.total_bytes, stats.max_bytes);
        }
        CacheAction::List => {
            for entry in cache.list().await? {
                println!(
                    "{}_{}  {} bytes  {}x{}  {:.1}s  cached {}",
                    entry.video_id,
                    entry.settings_key,
                    entry.file_size_bytes,
                    entry.source_width,
                    entry.source_height,
                    entry.duration_secs,
                    entry.cached_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        CacheAction::Evict => {
            let report = cache.evict_if_over_budget().await?;
            println!("Evicted {} entries ({} bytes)", report.removed.len(), report.freed_bytes);
        }
        CacheAction::Clear => {
            let removed = cache.clear().await?;
            println!("Removed {removed} entries");
        }
        CacheAction::Remove { id, key } => {
            if cache.remove(&id, &key).await? {
                println!("Removed {id}_{key}");
            } else {
                println!("No entry for {id}_{key}");
            }
        }
    }
    Ok(())
}

async fn check_tools(config: &Config) -> Result<()> {
    println!("Checking external tools...\n");

    let registry = ToolRegistry::discover(&config.tools);
    let mut all_ok = true;

    for tool in registry.check_all().await {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };
        print!("{} {}", status, tool.name);
        if let Some(ref version) = tool.version {
            print!(" ({version})");
        }
        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }
        println!();
    }

    let encoder = &config.transcode.video_encoder;
    match registry.has_encoder(encoder).await {
        Ok(true) => println!("✓ encoder {encoder}"),
        Ok(false) => {
            all_ok = false;
            println!("✗ encoder {encoder} (ffmpeg was built without it)");
        }
        Err(_) => {}
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. Stereo conversion needs ffmpeg, ffprobe, and the configured encoder.");
    }
    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {}", p.display());
            let contents = std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
            Config::from_json(&contents)?
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    let warnings = config.validate();
    if warnings.is_empty() {
        println!("✓ Configuration is valid");
    } else {
        for warning in &warnings {
            println!("! {warning}");
        }
    }
    println!("  Cache: {} ({} bytes)", config.cache.dir.display(), config.cache.max_bytes);
    println!("  Encoder: {} (crf {}, {})", config.transcode.video_encoder, config.transcode.crf, config.transcode.preset);
    println!("  Download strategy: {:?}", config.download.strategy);
    Ok(())
}

async fn selftest(config: &Config) -> Result<()> {
    let scratch = tempfile::tempdir()?;
    let mut config = config.clone();
    config.cache.dir = scratch.path().join("cache");

    let pattern = SyntheticPattern::new(640, 180, 30.0, 30);
    let source_path = scratch.path().join("selftest.json");
    pattern.write_to(&source_path)?;
    let source = SourceDescriptor::new(
        "selftest",
        format!("file://{}", source_path.display()),
        pattern.width,
        pattern.height,
    );

    let coordinator = build_coordinator(Arc::new(SyntheticBackend::new()), &config).await?;

    for reversed in [false, true] {
        let settings = ConversionSettings::new(StereoFormat::SideBySide, reversed, 90.0, 200.0)?;
        coordinator.play(source.clone(), settings).await;
        let state = run_until_settled(&coordinator).await;
        eprintln!();
        if let PlayerState::Error { message } = state {
            anyhow::bail!("selftest failed: {message}");
        }

        let path = coordinator.player().context("player missing after ready")?.media_path().to_path_buf();
        let output = SyntheticOutput::read(&path)?;
        let left = output.layer(EyeLayer::Left).count();
        let right = output.layer(EyeLayer::Right).count();
        let expected_left = if reversed { SyntheticPattern::BLUE } else { SyntheticPattern::RED };
        if left != 30 || right != 30 || !output.layer(EyeLayer::Left).all(|a| a.color == expected_left) {
            anyhow::bail!("selftest produced unexpected layers for {}", settings.settings_key());
        }
        println!("✓ {} ({left} frame pairs at {}x{})", settings.settings_key(), output.eye_width, output.eye_height);
        coordinator.stop().await;
    }

    let stats = coordinator.cache().stats().await?;
    println!("✓ cache holds {} entries", stats.entries);
    Ok(())
}
