use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use hearing_screener::audio::{
    amplitude_for_level, analyze, render_tone, split_channels, write_wav, Pan, PlaybackRequest,
};
use hearing_screener::engine::default_output;
use hearing_screener::{
    init_logging, AppConfig, AudioOutput, CalibrationPersistence, Ear, EngineState, Frequency,
    JsonFileCalibration, PatientInfo, ScreeningEngine, ScreeningSession, SimulatedOutput,
};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::Level;

#[derive(Parser, Debug)]
#[command(
    name = "screening_cli",
    about = "Operator console for pediatric pure-tone hearing screening"
)]
struct Cli {
    /// Configuration JSON (defaults to assets/screening_config.json)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Calibration file shared across sessions
    #[arg(long, default_value = "screening_calibration.json")]
    calibration_file: PathBuf,
    /// Enable debug logging
    #[arg(long, short)]
    verbose: bool,
    /// Run without a sound device; stimuli are timed but silent
    #[arg(long)]
    dry_run: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Save a just-audible reference level for one frequency
    Calibrate {
        #[arg(long)]
        frequency: u32,
        #[arg(long)]
        level: i32,
    },
    /// Print stored calibration and applied offsets
    ShowCalibration,
    /// Render a calibrated stimulus to WAV and print its spectrum check
    Render {
        #[arg(long)]
        frequency: u32,
        #[arg(long, value_enum, default_value_t = EarArg::Right)]
        ear: EarArg,
        #[arg(long, default_value_t = 50)]
        level: i32,
        #[arg(long)]
        output: PathBuf,
    },
    /// Run an interactive screening and write the report
    Run {
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long, default_value = "")]
        patient_id: String,
        #[arg(long, default_value = "")]
        age: String,
        #[arg(long, default_value = "")]
        remarks: String,
        /// Write the JSON report here instead of stdout
        #[arg(long)]
        report: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum EarArg {
    Right,
    Left,
}

impl From<EarArg> for Ear {
    fn from(arg: EarArg) -> Self {
        match arg {
            EarArg::Right => Ear::Right,
            EarArg::Left => Ear::Left,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(if cli.verbose { Level::DEBUG } else { Level::INFO });

    let config = match &cli.config {
        Some(path) => AppConfig::load_from_file(path),
        None => AppConfig::load(),
    };

    // Only `run` plays stimuli; the other commands never open the device
    let silent: Arc<dyn AudioOutput> = Arc::new(SimulatedOutput::new());

    match cli.command {
        Commands::Calibrate { frequency, level } => {
            let session = open_session(&config, &cli.calibration_file, silent)?;
            run_calibrate(&session, frequency, level)
        }
        Commands::ShowCalibration => {
            let session = open_session(&config, &cli.calibration_file, silent)?;
            run_show_calibration(&session)
        }
        Commands::Render {
            frequency,
            ear,
            level,
            output,
        } => {
            let session = open_session(&config, &cli.calibration_file, silent)?;
            run_render(&session, frequency, ear.into(), level, &output)
        }
        Commands::Run {
            name,
            patient_id,
            age,
            remarks,
            report,
        } => {
            let output = if cli.dry_run {
                silent
            } else {
                default_output().context("opening audio output")?
            };
            ensure_audible(output.as_ref(), cli.dry_run)?;
            let session = open_session(&config, &cli.calibration_file, output)?;
            let patient = PatientInfo {
                name,
                id: patient_id,
                age,
                notes: String::new(),
            };
            run_screening(&session, patient, remarks, report).await
        }
    }
}

/// Refuse to screen through an output nobody can hear unless asked to
fn ensure_audible(output: &dyn AudioOutput, dry_run: bool) -> Result<()> {
    if output.is_audible() || dry_run {
        return Ok(());
    }
    Err(anyhow!(
        "output '{}' produces no sound; build with the cpal_output feature or pass --dry-run",
        output.name()
    ))
}

fn open_session(
    config: &AppConfig,
    calibration_file: &Path,
    output: Arc<dyn AudioOutput>,
) -> Result<ScreeningSession> {
    let persistence: Arc<dyn CalibrationPersistence> = Arc::new(JsonFileCalibration::new(
        calibration_file,
        config.calibration.history_capacity,
    ));
    let session = ScreeningSession::new(config.clone(), output, persistence);
    session
        .load_calibration()
        .with_context(|| format!("loading {}", calibration_file.display()))?;
    Ok(session)
}

fn run_calibrate(session: &ScreeningSession, hz: u32, level: i32) -> Result<ExitCode> {
    let frequency = Frequency::from_hz(hz)?;
    let record = session.save_calibration(frequency, level)?;
    println!(
        "{}: history {:?}, applied offset {} dB",
        frequency,
        record.history(),
        session.calibration().applied_offset(frequency)
    );
    Ok(ExitCode::from(0))
}

#[derive(Serialize)]
struct CalibrationRow {
    frequency: u32,
    history: Vec<i32>,
    applied_offset_db: Option<i32>,
    last_calibrated_ms: Option<u64>,
}

fn run_show_calibration(session: &ScreeningSession) -> Result<ExitCode> {
    let floor = session.config().calibration.reference_floor_db;
    let rows: Vec<CalibrationRow> = session
        .calibration()
        .records()?
        .into_iter()
        .map(|record| CalibrationRow {
            frequency: record.frequency.hz(),
            history: record.history().iter().copied().collect(),
            applied_offset_db: record.applied_offset(floor),
            last_calibrated_ms: record.last_calibrated_ms,
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&rows)?);

    let missing = session.calibration().missing_frequencies();
    if missing.is_empty() {
        Ok(ExitCode::from(0))
    } else {
        eprintln!("Not calibrated: {:?}", missing);
        Ok(ExitCode::from(2))
    }
}

#[derive(Serialize)]
struct RenderReport {
    path: String,
    frequency_hz: u32,
    ear: Ear,
    nominal_level_db: i32,
    physical_level_db: i32,
    amplitude: f32,
    sample_rate: u32,
    frames: usize,
    measured_peak_hz: f32,
    measured_peak_amplitude: f32,
    opposite_channel_silent: bool,
}

fn run_render(
    session: &ScreeningSession,
    hz: u32,
    ear: Ear,
    level: i32,
    output: &Path,
) -> Result<ExitCode> {
    let frequency = Frequency::from_hz(hz)?;
    let config = session.config();
    let physical_level_db = level + session.calibration().applied_offset(frequency);
    let request = PlaybackRequest {
        frequency_hz: hz as f32,
        amplitude: amplitude_for_level(
            physical_level_db,
            config.tone.full_scale_reference_db,
        ),
        pan: Pan::from(ear),
        duration: config.protocol.tone_duration(),
        ramp: config.tone.ramp(),
    };

    let sample_rate = config.tone.render_sample_rate;
    let frames = render_tone(request, sample_rate);
    write_wav(output, &frames, sample_rate)?;

    let (left, right) = split_channels(&frames);
    let (tested, opposite) = match ear {
        Ear::Left => (left, right),
        Ear::Right => (right, left),
    };
    let analysis =
        analyze(&tested, sample_rate).ok_or_else(|| anyhow!("rendered tone is empty"))?;

    let report = RenderReport {
        path: output.display().to_string(),
        frequency_hz: hz,
        ear,
        nominal_level_db: level,
        physical_level_db,
        amplitude: request.amplitude,
        sample_rate,
        frames: frames.len(),
        measured_peak_hz: analysis.peak_hz,
        measured_peak_amplitude: analysis.peak_amplitude,
        opposite_channel_silent: opposite.iter().all(|s| *s == 0.0),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if analysis.matches_frequency(request.frequency_hz) {
        Ok(ExitCode::from(0))
    } else {
        Ok(ExitCode::from(2))
    }
}

async fn run_screening(
    session: &ScreeningSession,
    patient: PatientInfo,
    remarks: String,
    report_path: Option<PathBuf>,
) -> Result<ExitCode> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("Starting screening. Keys: y = heard, n = not heard, r = replay, t = retry, q = end");
    let engine = session.begin_screening().await?;

    while !engine.state().is_complete() {
        match engine.state() {
            EngineState::AwaitingResponse(trial) => println!("{} - heard? [y/n/r/q]", trial),
            EngineState::PresentationFailed(trial) => {
                println!("Could not play {} - retry? [t/q]", trial)
            }
            EngineState::NotStarted | EngineState::Presenting(_) | EngineState::Complete => {}
        }

        let line = match read_command(&mut lines).await? {
            Some(line) if !is_quit(&line) => line,
            _ => {
                end_early(&engine)?;
                break;
            }
        };

        // Keep reading while the pause and tone run so `q` takes effect at once
        let command = apply_command(&engine, &line);
        tokio::pin!(command);
        loop {
            tokio::select! {
                // The command must apply its response before a `q` is seen
                biased;
                outcome = &mut command => {
                    if let Err(err) = outcome {
                        eprintln!("{}", err);
                    }
                    break;
                }
                line = read_command(&mut lines) => match line? {
                    Some(line) if !is_quit(&line) => {
                        println!("Presentation in progress, only q is accepted");
                    }
                    _ => {
                        end_early(&engine)?;
                        break;
                    }
                },
            }
        }
    }

    let report = engine.report(patient, remarks)?;
    let json = serde_json::to_string_pretty(&report)?;
    match report_path {
        Some(path) => {
            fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
            println!("Report written to {}", path.display());
        }
        None => println!("{json}"),
    }
    println!("Outcome: {:?}", report.outcome);
    Ok(ExitCode::from(0))
}

async fn read_command(lines: &mut Lines<BufReader<Stdin>>) -> Result<Option<String>> {
    Ok(lines
        .next_line()
        .await
        .context("reading operator input")?
        .map(|line| line.trim().to_lowercase()))
}

fn is_quit(command: &str) -> bool {
    matches!(command, "q" | "quit")
}

fn end_early(engine: &ScreeningEngine) -> Result<()> {
    if !engine.state().is_complete() {
        engine.complete_test()?;
    }
    Ok(())
}

async fn apply_command(engine: &ScreeningEngine, command: &str) -> Result<()> {
    match command {
        "y" | "yes" => {
            engine.record_response(true).await?;
        }
        "n" | "no" => {
            engine.record_response(false).await?;
        }
        "r" | "replay" => {
            engine.replay().await?;
        }
        "t" | "retry" => {
            engine.retry_presentation().await?;
        }
        "" => {}
        other => return Err(anyhow!("Unknown command '{}'", other)),
    }
    Ok(())
}
