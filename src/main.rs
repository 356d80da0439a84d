//! readaloud-rs: read a book aloud from the terminal.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use readaloud_rs::analytics::{AnalyticsSink, JsonlAnalytics};
use readaloud_rs::config::{Config, Diagnostics};
use readaloud_rs::coordinator::{Coordinator, CoordinatorHandle, CoordinatorOptions, PlaybackEvent};
use readaloud_rs::document::{BookFile, ConsoleViewer, ViewMode};
use readaloud_rs::engine::{self, EngineKind};

const RATE_STEP: f32 = 0.25;

#[derive(Parser, Debug)]
#[command(name = "readaloud-rs", about = "Read a book aloud with synchronized highlighting")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Book to read: a .json page/paragraph file or plain text
    #[arg(short, long)]
    book: Option<PathBuf>,

    /// Page to start on (1-based)
    #[arg(short, long, default_value_t = 1)]
    page: usize,

    /// Force a speech engine: native or server
    #[arg(short, long)]
    engine: Option<String>,

    /// Start reading immediately
    #[arg(long)]
    autoplay: bool,

    /// Viewer launch parameters, e.g. "tts_engine=server&autoplay=1"
    #[arg(long)]
    launch_params: Option<String>,

    /// View mode: 1up, 2up or thumb
    #[arg(long, default_value = "1up")]
    mode: String,

    /// Print the read-aloud report for a day (YYYY-MM-DD) and exit
    #[arg(long)]
    report: Option<String>,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug,ort=info")
    } else {
        EnvFilter::new("info,ort=warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = Config::load(args.config.as_deref());

    if let Some(date) = &args.report {
        let analytics = JsonlAnalytics::new(config.analytics.resolved_dir());
        println!("{}", analytics.report(date));
        return Ok(());
    }

    let mut launch = args
        .launch_params
        .as_deref()
        .map(Diagnostics::from_launch_params)
        .unwrap_or_default();
    if let Some(name) = &args.engine {
        match EngineKind::from_name(name) {
            Some(kind) => launch.force_engine = Some(kind),
            None => warn!("Unknown engine \"{name}\", choosing automatically"),
        }
    }
    launch.autoplay |= args.autoplay;
    config.diagnostics = std::mem::take(&mut config.diagnostics).merge(launch);

    let Some(book_path) = args.book.as_deref() else {
        return Err("no book given (use --book)".into());
    };
    let book = BookFile::load(book_path)?;
    if book.language.is_some() {
        config.engine.book_language = book.language.clone();
    }

    let kind = match engine::select_engine(&config, config.diagnostics.force_engine) {
        Ok(kind) => kind,
        Err(e) => {
            info!("{e}, read-aloud disabled");
            return Ok(());
        }
    };
    let speech = engine::build_engine(kind, &config)?;

    let mode = ViewMode::from_name(&args.mode).unwrap_or_else(|| {
        warn!("Unknown view mode \"{}\", using 1up", args.mode);
        ViewMode::OnePage
    });
    let total = book.pages.len();
    let viewer = Arc::new(ConsoleViewer::new(total, mode, args.page.saturating_sub(1)));

    let mut options = CoordinatorOptions::from_config(&config);
    if config.analytics.enabled {
        let sink: Arc<dyn AnalyticsSink> = Arc::new(JsonlAnalytics::new(config.analytics.resolved_dir()));
        options.analytics = Some(sink);
    }

    info!("readaloud-rs starting with the {kind} engine");
    let handle = Coordinator::spawn(speech, Arc::new(book), viewer, options);
    let events = handle.subscribe();

    if config.diagnostics.autoplay {
        handle.toggle().await?;
    }

    run_console(handle, events, engine::clamp_rate(config.playback.rate)).await
}

async fn run_console(
    handle: CoordinatorHandle,
    mut events: broadcast::Receiver<PlaybackEvent>,
    mut rate: f32,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Commands: p play/pause, n next, b back, s stop, + / - rate, v <uri> voice, voices, q quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if !handle_line(&handle, &mut rate, line.trim()).await? {
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(event) => report_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("Missed {n} playback events"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    // the coordinator may already be gone
    let _ = handle.stop().await;
    let _ = handle.shutdown().await;
    Ok(())
}

/// Returns false when the user asked to quit.
async fn handle_line(
    handle: &CoordinatorHandle,
    rate: &mut f32,
    line: &str,
) -> Result<bool, Box<dyn std::error::Error>> {
    let (command, arg) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "" => {}
        "p" => handle.toggle().await?,
        "n" => handle.jump_forward().await?,
        "b" => handle.jump_backward().await?,
        "s" => handle.stop().await?,
        "+" | "-" => {
            let delta = if command == "+" { RATE_STEP } else { -RATE_STEP };
            *rate = engine::clamp_rate(*rate + delta);
            handle.set_playback_rate(*rate).await?;
        }
        "v" => {
            if !handle.set_voice(arg.trim()).await? {
                println!("No such voice: {}", arg.trim());
            }
        }
        "voices" => {
            for voice in handle.voices().await? {
                let marker = if voice.default { " (default)" } else { "" };
                println!("  {}  {}  {}{marker}", voice.voice_uri, voice.lang, voice.name);
            }
        }
        "q" | "quit" => return Ok(false),
        other => println!("Unknown command: {other}"),
    }
    Ok(true)
}

fn report_event(event: &PlaybackEvent) {
    match event {
        PlaybackEvent::ChunkStarted(chunk) => {
            println!("[page {}] {}", chunk.leaf_index + 1, chunk.text);
        }
        PlaybackEvent::LoadFailed { leaf_index, reason } => {
            println!("Could not read page {}: {reason} (p to retry)", leaf_index + 1);
        }
        PlaybackEvent::Done => println!("End of book."),
        PlaybackEvent::Pause => println!("Paused."),
        PlaybackEvent::Stop => println!("Stopped."),
        _ => {}
    }
}
