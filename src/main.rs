use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use chrono::DateTime;
use clap::Parser;
use rand::Rng;

use kairos::config::{LoadConfig, SettingsStore};
use kairos::ingest::{MarkerClassifier, SingleSymbol};
use kairos::layer::TimeLayer;
use kairos::model::{Coord, FeatureId, Geometry, RawFeature, RawValue};
use kairos::task::{IngestTask, TaskOutcome};
use kairos::{StepOutcome, TimePlayer};

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// JSON-lines feature file: one object per line with "id", "x", "y"
    /// plus attribute fields.
    file: PathBuf,

    /// Attribute holding each feature's timestamp.
    #[clap(long, default_value = "time")]
    time_field: String,

    /// Attribute holding an end time, for interval data.
    #[clap(long)]
    end_field: Option<String>,

    /// UTC offset in whole hours, applied to string timestamps.
    #[clap(long, default_value = "0")]
    utc_offset: i32,

    /// Data window length in seconds.
    #[clap(long, default_value = "60")]
    history: f64,

    /// Clock step in seconds.
    #[clap(long, default_value = "60")]
    step: f64,

    /// Play from the end of the data backwards.
    #[clap(long)]
    backward: bool,

    /// Single-step through empty intervals instead of jumping them.
    #[clap(long)]
    no_skip: bool,

    /// Color features by this attribute's values.
    #[clap(long)]
    color_attribute: Option<String>,

    /// Where per-layer settings files live.
    #[clap(long, default_value = ".kairos")]
    settings_dir: PathBuf,
}

fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info,kairos=info");
    }
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let args = Args::parse();

    let layer_name = args
        .file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "layer".to_string());

    println!("--- Kairos Time Player ---");
    println!("Layer: {}", layer_name);

    let features = match read_features(&args.file) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Failed to read {}: {}", args.file.display(), e);
            std::process::exit(1);
        }
    };
    if features.is_empty() {
        eprintln!("{} contains no features.", args.file.display());
        std::process::exit(1);
    }
    println!("Features: {}", features.len());

    // Reuse saved settings for this source when present, otherwise build a
    // configuration from the command line and remember it.
    let store = SettingsStore::new(&args.settings_dir);
    let field_count = features[0].attributes.len();
    let config = match store.lookup(&layer_name, field_count, features.len()) {
        Ok(Some(saved)) => {
            println!("Using saved layer settings.");
            saved
        }
        _ => {
            let mut config = LoadConfig::new(&args.time_field);
            config.duration_field = args.end_field.clone();
            config.utc_offset = args.utc_offset;
            config.color_attribute = args.color_attribute.clone();
            if let Err(e) = store.save(&layer_name, field_count, features.len(), &config) {
                eprintln!("Could not save layer settings: {}", e);
            }
            config
        }
    };

    // Fix the parsing strategy from the first feature.
    let parsers = match config.resolve(&features[0]) {
        Ok(parsers) => parsers,
        Err(e) => {
            eprintln!("Cannot use field '{}' for time: {}", config.epoch_field, e);
            std::process::exit(1);
        }
    };
    println!("Time strategy: {:?}", parsers.epoch);
    if parsers.epoch.is_numeric() && config.utc_offset != 0 {
        println!("Numeric timestamps are self-describing; UTC offset ignored.");
    }

    let classifier: Box<dyn MarkerClassifier> = match &config.color_attribute {
        Some(attr) => Box::new(RandomMarkerTable::new(attr.clone())),
        None => Box::new(SingleSymbol),
    };

    let mut layer = TimeLayer::new(&layer_name, config.clone(), parsers);
    layer.set_loading(true, "Loading...", false);

    // Load on a worker, hand the built index back through a channel.
    let (done_tx, done_rx) = mpsc::channel();
    let task = IngestTask {
        layer_name: layer_name.clone(),
        config,
        parsers,
        classifier,
        labeler: None,
    };
    let total = features.len();
    let handle = task.spawn(
        features,
        total,
        Box::new(move |outcome| {
            let _ = done_tx.send(outcome);
        }),
    );

    let mut last_pct = 0u32;
    while !handle.is_finished() {
        let pct = (handle.progress() * 100.0) as u32;
        if pct >= last_pct + 25 {
            println!("Loading... {}%", pct);
            last_pct = pct;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    handle.join();

    match done_rx.recv() {
        Ok(TaskOutcome::Succeeded(index, report)) => {
            if report.failed > 0 {
                println!("{} features failed to load.", report.failed);
            }
            if let Some(message) = report.status_message {
                println!("{}", message);
            }
            layer.complete_load(index, None);
        }
        Ok(TaskOutcome::Canceled) => {
            println!("Load canceled.");
            return;
        }
        Ok(TaskOutcome::Failed(e)) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
        Err(_) => {
            eprintln!("Load worker vanished without reporting.");
            std::process::exit(1);
        }
    }

    let mut player = TimePlayer::new();
    player.set_history(args.history);
    player.set_direction(!args.backward);
    player.set_skip_gaps(!args.no_skip);
    player.add_layer(layer);

    let Some((min_time, max_time)) = player.time_bounds() else {
        eprintln!("No data time range available.");
        std::process::exit(1);
    };
    println!("Data range: {}  ..  {}", format_time(min_time), format_time(max_time));
    println!("--------------------------");

    animate(&mut player, &args, min_time, max_time);
}

/// Step the shared clock across the data range, following gap jumps.
fn animate(player: &mut TimePlayer, args: &Args, min_time: f64, max_time: f64) {
    let forward = !args.backward;
    let mut t = if forward { min_time } else { max_time };

    loop {
        match player.step(t) {
            StepOutcome::Rendered { visible } => {
                let window_start = t - args.history;
                println!(
                    "{}  ..  {}   {} visible",
                    format_time(window_start),
                    format_time(t),
                    visible
                );
                t = if forward { t + args.step } else { t - args.step };
            }
            StepOutcome::Jump(target) => {
                if !target.is_finite() {
                    break;
                }
                // A hint pointing the wrong way means the data is behind us.
                if (forward && target <= t) || (!forward && target >= t) {
                    break;
                }
                println!("(no data, skipping to {})", format_time(target));
                t = target;
            }
        }
        if (forward && t > max_time + args.history) || (!forward && t < min_time - args.history) {
            break;
        }
    }
    println!("--------------------------");
    println!("Done.");
}

fn format_time(secs: f64) -> String {
    let whole = secs.floor() as i64;
    let nanos = ((secs - whole as f64) * 1e9) as u32;
    match DateTime::from_timestamp(whole, nanos) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => format!("{:.2}", secs),
    }
}

/// Read a JSON-lines feature file. Unknown value shapes become text so the
/// classifier still gets a sample to look at.
fn read_features(path: &PathBuf) -> std::io::Result<Vec<RawFeature>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut features = Vec::new();

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let value: serde_json::Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                eprintln!("Skipping line {}: {}", line_no + 1, e);
                continue;
            }
        };

        let id = match value.get("id") {
            Some(serde_json::Value::Number(n)) if n.is_i64() => {
                FeatureId::Int(n.as_i64().unwrap_or(line_no as i64))
            }
            Some(serde_json::Value::String(s)) => FeatureId::Text(s.clone()),
            _ => FeatureId::Int(line_no as i64),
        };

        let geometry = match (value.get("x").and_then(|v| v.as_f64()), value.get("y").and_then(|v| v.as_f64())) {
            (Some(x), Some(y)) => Some(Geometry::Point(Coord::new(x, y))),
            _ => None,
        };

        let mut attributes = HashMap::new();
        if let serde_json::Value::Object(map) = &value {
            for (key, val) in map {
                if key == "id" || key == "x" || key == "y" {
                    continue;
                }
                let raw = match val {
                    serde_json::Value::Number(n) => {
                        RawValue::Number(n.as_f64().unwrap_or(f64::NAN))
                    }
                    serde_json::Value::String(s) => RawValue::Text(s.clone()),
                    serde_json::Value::Bool(b) => RawValue::Text(b.to_string()),
                    serde_json::Value::Null => RawValue::Null,
                    other => RawValue::Text(other.to_string()),
                };
                attributes.insert(key.clone(), raw);
            }
        }

        features.push(RawFeature { id, geometry, attributes });
    }
    Ok(features)
}

/// Color-by-attribute marker table: each new attribute value gets a fresh
/// randomly colored marker, and repeats map back to the same index.
struct RandomMarkerTable {
    attribute: String,
    assigned: HashMap<String, usize>,
    colors: Vec<(u8, u8, u8)>,
}

impl RandomMarkerTable {
    fn new(attribute: String) -> Self {
        Self { attribute, assigned: HashMap::new(), colors: Vec::new() }
    }
}

impl MarkerClassifier for RandomMarkerTable {
    fn classify(&mut self, feature: &RawFeature) -> Option<usize> {
        let value = match feature.attribute(&self.attribute) {
            Some(RawValue::Text(s)) => s.clone(),
            Some(RawValue::Number(n)) => n.to_string(),
            Some(other) => format!("{:?}", other),
            None => return None,
        };
        if let Some(&idx) = self.assigned.get(&value) {
            return Some(idx);
        }
        let mut rng = rand::thread_rng();
        let color = (rng.gen::<u8>(), rng.gen::<u8>(), rng.gen::<u8>());
        let idx = self.colors.len();
        tracing::debug!(value = %value, ?color, "new marker assigned");
        self.colors.push(color);
        self.assigned.insert(value, idx);
        Some(idx)
    }
}
