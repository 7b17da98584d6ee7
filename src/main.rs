use clap::{Parser, Subcommand};
use hwpulse::collectors::{HostSensors, Metric, ReadingStatus, Subsystem};
use hwpulse::config::{Config, MAX_STRESS_SECS};
use hwpulse::session::{DiagnosticSession, SessionContext, SessionError, SessionResult};
use hwpulse::snapshot::{SnapshotAggregator, SystemSnapshot};
use hwpulse::stress::process::{run_stress_process, termination_signal, ProcessOptions};
use hwpulse::stress::{SelfExeLauncher, StressTarget, WorkerKind};
use hwpulse::verdict::dataset::generate_balanced;
use hwpulse::verdict::bayes::TrainingSource;
use hwpulse::verdict::{build_classifier, LearnedClassifier};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hwpulse")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture one snapshot and classify it.
    Snapshot {
        #[arg(long)]
        json: bool,
    },
    /// Capture and classify every poll interval until Ctrl+C (default).
    Watch,
    /// Snapshot, stress, snapshot again and compare the verdicts.
    Diagnose {
        #[arg(value_enum, default_value_t = StressTarget::All)]
        target: StressTarget,
        /// Seconds; defaults to stress.default_duration_secs.
        #[arg(long, value_parser = duration_secs())]
        duration: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    /// Fit the learned model on the dataset and save it.
    Train,
    /// Write a synthetic labelled training dataset.
    Dataset {
        /// Defaults to classifier.dataset_path.
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long, default_value_t = 200)]
        per_class: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Load every CPU core; progress is printed on stdout.
    StressCpu {
        #[arg(value_parser = duration_secs())]
        duration: Option<u64>,
    },
    /// Hold and rewrite a memory block; progress is printed on stdout.
    StressMem {
        #[arg(value_parser = duration_secs())]
        duration: Option<u64>,
    },
    /// Dispatch GPU compute work; progress is printed on stdout.
    StressGpu {
        #[arg(value_parser = duration_secs())]
        duration: Option<u64>,
    },
    /// Run all stress kinds in one process.
    StressAll {
        #[arg(value_parser = duration_secs())]
        duration: Option<u64>,
    },
}

fn duration_secs() -> clap::builder::RangedU64ValueParser<u64> {
    clap::value_parser!(u64).range(1..=MAX_STRESS_SECS)
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_or_default(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };

    match cli.command.unwrap_or(Command::Watch) {
        Command::Snapshot { json } => snapshot_once(&cfg, json).await,
        Command::Watch => watch_loop(&cfg).await,
        Command::Diagnose {
            target,
            duration,
            json,
        } => diagnose(&cfg, &cli.config, target, duration, json).await,
        Command::Train => train(&cfg),
        Command::Dataset {
            out,
            per_class,
            seed,
        } => {
            let path = out.unwrap_or_else(|| cfg.classifier.dataset_path.clone());
            match generate_balanced(&path, per_class, seed) {
                Ok(rows) => info!(path = %path.display(), rows, "датасет сгенерирован"),
                Err(err) => {
                    error!(error = %err, "не удалось сгенерировать датасет");
                    std::process::exit(1);
                }
            }
        }
        Command::StressCpu { duration } => stress(&cfg, &[WorkerKind::Cpu], duration).await,
        Command::StressMem { duration } => stress(&cfg, &[WorkerKind::Memory], duration).await,
        Command::StressGpu { duration } => stress(&cfg, &[WorkerKind::Gpu], duration).await,
        Command::StressAll { duration } => stress(&cfg, &WorkerKind::ALL, duration).await,
    }
}

/// Logs go to stderr: stdout of the stress subcommands carries the progress protocol.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn aggregator(cfg: &Config) -> SnapshotAggregator {
    SnapshotAggregator::new(
        Arc::new(HostSensors::new(cfg.sensors.disk_mount.clone())),
        cfg.sensors.poll_interval(),
    )
}

async fn capture(aggregator: &SnapshotAggregator) -> Option<SystemSnapshot> {
    let aggregator = aggregator.clone();
    match tokio::task::spawn_blocking(move || aggregator.capture()).await {
        Ok(snapshot) => Some(snapshot),
        Err(err) => {
            error!(error = %err, "сбор снимка завершился аварийно");
            None
        }
    }
}

async fn snapshot_once(cfg: &Config, json: bool) {
    let classifier = build_classifier(&cfg.classifier);
    let Some(snapshot) = capture(&aggregator(cfg)).await else {
        std::process::exit(1);
    };
    let verdict = classifier.classify_snapshot(&snapshot);

    if json {
        let doc = serde_json::json!({ "verdict": verdict, "snapshot": snapshot });
        match serde_json::to_string_pretty(&doc) {
            Ok(text) => println!("{text}"),
            Err(err) => {
                error!(error = %err, "не удалось сериализовать снимок");
                std::process::exit(1);
            }
        }
        return;
    }
    print!("{}", render_snapshot(&snapshot));
    println!("verdict: {verdict} ({})", classifier.name());
}

async fn watch_loop(cfg: &Config) {
    let classifier = build_classifier(&cfg.classifier);
    let aggregator = aggregator(cfg);
    info!(
        interval_ms = cfg.sensors.poll_interval_ms,
        strategy = classifier.name(),
        "запуск мониторинга"
    );

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "не удалось дождаться Ctrl+C");
        }
        info!("получен Ctrl+C, выполняется остановка");
        let _ = shutdown_tx.send(true);
    });

    let mut ticker = tokio::time::interval(cfg.sensors.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = ticker.tick() => {
                let Some(snapshot) = capture(&aggregator).await else {
                    continue;
                };
                let verdict = classifier.classify_snapshot(&snapshot);
                println!("{} | {verdict}", render_line(&snapshot));
            }
        }
    }
}

async fn diagnose(cfg: &Config, config_path: &str, target: StressTarget, duration: Option<u64>, json: bool) {
    let launcher = match SelfExeLauncher::current(&cfg.stress) {
        // Workers fall back to defaults on their own when the file is missing.
        Ok(l) => match std::fs::canonicalize(config_path) {
            Ok(path) => l.with_config(path),
            Err(_) => l,
        },
        Err(err) => {
            error!(error = %err, "не удалось подготовить запуск нагрузки");
            std::process::exit(1);
        }
    };
    let duration = Duration::from_secs(duration.unwrap_or(cfg.stress.default_duration_secs).max(1));
    let session = DiagnosticSession::new(SessionContext {
        aggregator: aggregator(cfg),
        classifier: build_classifier(&cfg.classifier),
        launcher: Arc::new(launcher),
        stress: cfg.stress.clone(),
        resample_interval: cfg.session.resample_interval(),
    });

    info!(%target, duration = %humantime::format_duration(duration), "диагностика запущена");
    let handle = session.begin(target, duration);
    let mut progress = handle.subscribe();
    let mut last_logged: Option<(String, u8)> = None;
    let mut cancelled = false;

    loop {
        tokio::select! {
            changed = progress.changed() => {
                if changed.is_err() {
                    break;
                }
                let p = *progress.borrow_and_update();
                let bucket = p.progress / 10 * 10;
                let key = (p.phase.to_string(), bucket);
                if last_logged.as_ref() != Some(&key) {
                    info!(phase = %p.phase, progress = p.progress, "ход диагностики");
                    last_logged = Some(key);
                }
                if p.is_done {
                    break;
                }
            }
            res = tokio::signal::ctrl_c(), if !cancelled => {
                if let Err(err) = res {
                    warn!(error = %err, "не удалось дождаться Ctrl+C");
                }
                info!("получен Ctrl+C, останавливаем нагрузку");
                handle.cancel();
                cancelled = true;
            }
        }
    }

    let outcome = handle.wait().await;
    match outcome.as_ref() {
        Ok(result) if json => match serde_json::to_string_pretty(result) {
            Ok(text) => println!("{text}"),
            Err(err) => {
                error!(error = %err, "не удалось сериализовать результат");
                std::process::exit(1);
            }
        },
        Ok(result) => print!("{}", render_session(result)),
        Err(err @ SessionError::Aborted { before, .. }) => {
            if let Some(before) = before {
                print!("{}", render_snapshot(before));
            }
            error!(error = %err, "диагностика прервана");
            std::process::exit(2);
        }
        Err(err) => {
            error!(error = %err, "диагностика завершилась с ошибкой");
            std::process::exit(1);
        }
    }
}

fn train(cfg: &Config) {
    let (classifier, source) = LearnedClassifier::train_from_dataset(&cfg.classifier.dataset_path);
    match &source {
        TrainingSource::Dataset { rows, skipped } => {
            info!(rows, skipped, "модель обучена на датасете")
        }
        TrainingSource::Fallback { reason } => {
            warn!(%reason, "датасет непригоден, сохранена минимальная модель")
        }
    }
    if let Err(err) = classifier.save(&cfg.classifier.model_path) {
        error!(error = %err, "не удалось сохранить модель");
        std::process::exit(1);
    }
    info!(path = %cfg.classifier.model_path.display(), "модель сохранена");
}

async fn stress(cfg: &Config, kinds: &[WorkerKind], duration: Option<u64>) {
    let duration = Duration::from_secs(duration.unwrap_or(cfg.stress.default_duration_secs));
    let opts = ProcessOptions::from_config(&cfg.stress).with_env_overrides();
    let summary =
        run_stress_process(kinds, duration, opts, std::io::stdout(), termination_signal()).await;
    if summary.interrupted {
        info!("нагрузка остановлена по сигналу");
    }
}

fn fmt_metric(value: Option<f64>, unit: &str) -> String {
    match value {
        Some(v) => format!("{v:.1}{unit}"),
        None => "n/a".to_string(),
    }
}

fn render_line(snapshot: &SystemSnapshot) -> String {
    let usage = |s: Subsystem| fmt_metric(snapshot.reading(s).metric(Metric::UsagePercent), "%");
    let temp = |s: Subsystem| {
        fmt_metric(snapshot.reading(s).metric(Metric::TemperatureCelsius), "°C")
    };
    format!(
        "cpu {} {} | gpu {} {} | ram {} | disk {}",
        usage(Subsystem::Cpu),
        temp(Subsystem::Cpu),
        usage(Subsystem::Gpu),
        temp(Subsystem::Gpu),
        usage(Subsystem::Ram),
        usage(Subsystem::Disk),
    )
}

fn render_snapshot(snapshot: &SystemSnapshot) -> String {
    let mut out = format!(
        "snapshot at {}\n",
        humantime::format_rfc3339_seconds(snapshot.captured_at())
    );
    for reading in snapshot.readings() {
        let subsystem = reading.subsystem();
        let detail = match reading.status() {
            ReadingStatus::Ok => {
                let mut parts = vec![
                    format!("usage {}", fmt_metric(reading.metric(Metric::UsagePercent), "%")),
                ];
                if matches!(subsystem, Subsystem::Cpu | Subsystem::Gpu) {
                    parts.push(format!(
                        "temp {}",
                        fmt_metric(reading.metric(Metric::TemperatureCelsius), "°C")
                    ));
                }
                if let Some(device) = reading.device() {
                    parts.push(device.to_string());
                }
                parts.join(", ")
            }
            ReadingStatus::Unavailable => "n/a".to_string(),
            ReadingStatus::Error(reason) => format!("unknown ({reason})"),
        };
        out.push_str(&format!("  {:<5} {detail}\n", subsystem.as_str()));
    }
    out
}

fn render_session(result: &SessionResult) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "stress {} ({}), {}\n",
        result.target,
        result.job.state.as_str(),
        humantime::format_duration(Duration::from_secs(result.job.elapsed().as_secs()))
    ));
    for w in &result.job.workers {
        let outcome = w
            .outcome
            .as_ref()
            .map(|o| format!("{o:?}"))
            .unwrap_or_else(|| "unknown".to_string());
        out.push_str(&format!("  {:<7} {}\n", w.kind.as_str(), outcome));
    }
    out.push_str("before:\n");
    out.push_str(&render_snapshot(&result.before));
    out.push_str("after:\n");
    out.push_str(&render_snapshot(&result.after));
    out.push_str(&format!(
        "verdict: {} -> {} (peak {}, {} samples)\n",
        result.before_verdict,
        result.after_verdict,
        result.peak_verdict,
        result.samples.len()
    ));
    out
}
