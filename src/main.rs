use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use kaeva_voice::voice::{
    ActivityGate, AudioChunk, AudioPlayer, CaptureOwner, CpalMicrophone, CpalSink, KeywordMatcher,
    MicrophoneArbiter, MonitorEvent, PlayableAudio, VoiceActivityMonitor, decode_with_default,
    levenshtein, similarity,
};
use kaeva_voice::{Config, SqliteStore, VoiceSessionLogger, db, serialize_full};

/// Kaeva Voice - hands-free conversational voice engine
#[derive(Parser)]
#[command(name = "kaeva-voice", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Enable session debug logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch microphone levels and silence detection
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "10")]
        duration: u64,
    },
    /// Decode a base64 PCM chunk into a WAV file
    Decode {
        /// File containing the base64 payload
        input: PathBuf,
        /// Output WAV path
        #[arg(short, long)]
        output: PathBuf,
        /// Mime hint carrying the sample rate
        #[arg(short, long, default_value = "audio/pcm;rate=24000")]
        mime: String,
    },
    /// Decode a base64 PCM chunk and play it
    Play {
        /// File containing the base64 payload
        input: PathBuf,
        /// Mime hint carrying the sample rate
        #[arg(short, long, default_value = "audio/pcm;rate=24000")]
        mime: String,
        /// Volume in [0, 1]; defaults to the configured volume
        #[arg(long)]
        volume: Option<f32>,
    },
    /// Print the agent context for a user
    Context {
        /// User ID
        #[arg(short, long)]
        user: String,
        /// Reference date (YYYY-MM-DD), defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Print the raw snapshot as JSON instead
        #[arg(long)]
        json: bool,
    },
    /// Compare a phrase against the wake words
    Similarity {
        /// Heard phrase
        phrase: String,
        /// Compare against this phrase instead of the configured wake words
        #[arg(long)]
        against: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn,kaeva_voice=info",
        1 => "info,kaeva_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;
    if cli.debug {
        config.debug.set(true);
    }
    tracing::debug!(?config, "loaded configuration");
    let logger = VoiceSessionLogger::from_config(&config);

    let result = match cli.command {
        Command::TestMic { duration } => test_mic(&config, &logger, duration).await,
        Command::Decode { input, output, mime } => decode_file(&config, &input, &output, &mime),
        Command::Play { input, mime, volume } => {
            play_file(&config, &logger, &input, &mime, volume).await
        }
        Command::Context { user, date, json } => print_context(&config, &logger, &user, date, json),
        Command::Similarity { phrase, against } => {
            print_similarity(&config, &phrase, against.as_deref());
            Ok(())
        }
    };

    if let Err(e) = &result {
        logger.error("command_failed", json!({ "error": e.to_string() }));
    }
    if config.debug.is_enabled() {
        eprintln!("{}", logger.export_json()?);
    }
    result
}

/// Run the silence monitor on the real microphone
async fn test_mic(config: &Config, logger: &VoiceSessionLogger, duration: u64) -> anyhow::Result<()> {
    println!("Monitoring microphone for {duration} seconds...");
    println!(
        "Silence threshold: {} dB, window: {} ms\n",
        config.monitor.silence_threshold_db,
        config.monitor.silence_window.as_millis()
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let monitor = VoiceActivityMonitor::with_gate(
        Arc::new(CpalMicrophone::new()),
        MicrophoneArbiter::new(),
        config.monitor.clone(),
        ActivityGate::Decibels(config.monitor.silence_threshold_db),
        CaptureOwner::Diagnostics,
        Arc::new(tx),
    );
    monitor.start().await?;
    logger.session("mic_test_started", json!({ "durationSecs": duration }));

    let deadline = tokio::time::sleep(Duration::from_secs(duration));
    tokio::pin!(deadline);
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let mut level = 0u8;

    loop {
        tokio::select! {
            () = &mut deadline => break,
            _ = ticker.tick() => {
                let meter_len = usize::from(level) * 50 / 255;
                let meter = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);
                println!("level {level:3} [{meter}]");
            }
            Some(event) = rx.recv() => match event {
                MonitorEvent::Level(sample) => level = sample.level,
                MonitorEvent::SpeechStarted(sample) => {
                    logger.audio("speech", json!({ "atMs": sample.timestamp_ms, "level": sample.level }));
                    println!(">> speech at {} ms", sample.timestamp_ms);
                }
                MonitorEvent::Silence(silence) => {
                    logger.audio("silence", json!({ "atMs": silence.fired_at_ms, "lastSpeechMs": silence.last_speech_ms }));
                    println!(
                        ">> silence at {} ms (last speech {} ms)",
                        silence.fired_at_ms, silence.last_speech_ms
                    );
                }
            },
        }
    }

    monitor.stop().await;
    logger.session("mic_test_stopped", json!({}));
    println!("\n---");
    println!("If the level moved while you spoke, the microphone is working.");
    Ok(())
}

fn read_chunk(config: &Config, input: &Path, mime: &str) -> anyhow::Result<PlayableAudio> {
    let payload = std::fs::read_to_string(input)?;
    let chunk = AudioChunk::new(payload, mime);
    Ok(decode_with_default(&chunk, config.playback.default_sample_rate)?)
}

fn decode_file(config: &Config, input: &Path, output: &Path, mime: &str) -> anyhow::Result<()> {
    let audio = read_chunk(config, input, mime)?;
    std::fs::write(output, &audio.container)?;
    println!(
        "Wrote {} ({} Hz, {} bytes PCM, {:.2}s)",
        output.display(),
        audio.sample_rate,
        audio.data_len(),
        audio.duration().as_secs_f32()
    );
    Ok(())
}

async fn play_file(
    config: &Config,
    logger: &VoiceSessionLogger,
    input: &Path,
    mime: &str,
    volume: Option<f32>,
) -> anyhow::Result<()> {
    let audio = read_chunk(config, input, mime)?;
    println!(
        "Playing {:.2}s at {} Hz...",
        audio.duration().as_secs_f32(),
        audio.sample_rate
    );

    let volume = volume.unwrap_or(config.playback.volume);
    logger.audio(
        "playback_started",
        json!({ "bytes": audio.data_len(), "sampleRate": audio.sample_rate, "volume": volume }),
    );

    let player = AudioPlayer::new(Arc::new(CpalSink::new()));
    let outcome = player.play(&audio, volume)?.finished().await?;
    logger.audio("playback_finished", json!({ "outcome": format!("{outcome:?}") }));
    println!("Playback {outcome:?}");
    Ok(())
}

fn print_context(
    config: &Config,
    logger: &VoiceSessionLogger,
    user: &str,
    date: Option<NaiveDate>,
    as_json: bool,
) -> anyhow::Result<()> {
    let pool = db::init(&config.db_path)?;
    let store = SqliteStore::new(pool);
    let snapshot = store.load_snapshot(user, date.unwrap_or_else(|| Utc::now().date_naive()))?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        let text = serialize_full(&snapshot);
        logger.context("full_rendered", json!({ "userId": user, "chars": text.len() }));
        if text.is_empty() {
            println!("(no context for user {user})");
        } else {
            println!("{text}");
        }
    }
    Ok(())
}

fn print_similarity(config: &Config, phrase: &str, against: Option<&str>) {
    if let Some(other) = against {
        println!(
            "similarity: {:.3} (edit distance {})",
            similarity(phrase, other),
            levenshtein(&phrase.to_lowercase(), &other.to_lowercase())
        );
        return;
    }

    let wake = &config.wake;
    for keyword in &wake.keywords {
        println!("{keyword:>16}: {:.3}", similarity(phrase, keyword));
    }

    let matcher = KeywordMatcher::new(&wake.keywords, wake.threshold, wake.word_boundary);
    match matcher.best_match(phrase) {
        Some(m) => println!("activates on \"{}\" (score {:.3})", m.keyword, m.score),
        None => println!("no activation (threshold {:.2})", wake.threshold),
    }
}
