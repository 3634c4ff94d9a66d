//! Subcommand handlers.

use crate::{Attack, CheckpointAction, Commands, ConfigAction};
use anyhow::{Context, bail};
use backdoor_core::config::{BackdoorConfig, ConfigSource, user_config_path};
use backdoor_core::training::checkpoint::{
    BestAccuracy, CheckpointManager, CheckpointRecord, LATEST_CHECKPOINT, Resume,
};
use backdoor_core::training::{
    Network, Optimizer, Scheduler, get_network, get_optimizer, get_scheduler, saved_epochs,
};
use backdoor_core::trigger::{Blend, Sample, TriggerConfig, TriggerTransform, array_to_image};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// File extensions `poison` picks up when walking a directory.
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "gif", "tif", "tiff", "webp"];

pub fn handle_command(command: Commands, source: &ConfigSource) -> anyhow::Result<()> {
    match command {
        Commands::Poison {
            input,
            output,
            attack,
            trigger,
            alpha,
        } => handle_poison(&input, &output, attack, trigger, alpha, source),
        Commands::SavedEpochs {
            num_epochs,
            stage,
            min_interval,
            max_interval,
        } => {
            let epochs =
                resolve_saved_epochs(source, num_epochs, stage, min_interval, max_interval)?;
            println!("{}", join_epochs(&epochs));
            Ok(())
        }
        Commands::Checkpoint { action } => handle_checkpoint(action, source),
        Commands::Resume { from, ckpt_dir } => handle_resume(from, ckpt_dir, source),
        Commands::Config { action } => handle_config(action, source),
    }
}

fn load(source: &ConfigSource) -> anyhow::Result<BackdoorConfig> {
    source.load().context("Failed to load config")
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

fn handle_poison(
    input: &Path,
    output: &Path,
    attack: Option<Attack>,
    trigger: Option<PathBuf>,
    alpha: Option<f32>,
    source: &ConfigSource,
) -> anyhow::Result<()> {
    let trigger_config = match (attack, trigger) {
        (Some(Attack::Badnets), Some(trigger_path)) => TriggerConfig::Badnets { trigger_path },
        (Some(Attack::Blend), Some(trigger_path)) => TriggerConfig::Blend {
            trigger_path,
            alpha: alpha.unwrap_or(Blend::DEFAULT_ALPHA),
        },
        _ => {
            let Some(mut configured) = load(source)?.trigger else {
                bail!("No trigger configured. Pass --attack and --trigger, or add a [trigger] section.");
            };
            if let (TriggerConfig::Blend { alpha: current, .. }, Some(alpha)) =
                (&mut configured, alpha)
            {
                *current = alpha;
            }
            configured
        }
    };

    let transform = trigger_config.build().with_context(|| {
        format!(
            "Failed to load trigger {}",
            trigger_config.trigger_path().display()
        )
    })?;

    let count = if input.is_dir() {
        poison_dir(transform.as_ref(), input, output)?
    } else {
        poison_file(transform.as_ref(), input, output)?;
        1
    };
    tracing::info!(attack = transform.name(), count, "Poisoned images");
    println!("Poisoned {} image(s) into {}", count, output.display());
    Ok(())
}

fn poison_file(transform: &dyn TriggerTransform, input: &Path, output: &Path) -> anyhow::Result<()> {
    let bytes = std::fs::read(input).with_context(|| format!("Failed to read {}", input.display()))?;
    let sample = Sample::from(bytes)
        .decode()
        .with_context(|| format!("Failed to decode {}", input.display()))?;
    let poisoned = transform
        .apply(&sample)
        .with_context(|| format!("Failed to poison {}", input.display()))?;

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    array_to_image(&poisoned)?
        .save(output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    tracing::debug!(input = %input.display(), output = %output.display(), "Poisoned image");
    Ok(())
}

/// Mirror every image under `input` into `output`, keeping relative paths.
fn poison_dir(transform: &dyn TriggerTransform, input: &Path, output: &Path) -> anyhow::Result<usize> {
    let mut count = 0;
    for entry in WalkDir::new(input).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() || !is_image(entry.path()) {
            continue;
        }
        let relative = entry.path().strip_prefix(input)?;
        poison_file(transform, entry.path(), &output.join(relative))?;
        count += 1;
    }
    Ok(count)
}

fn resolve_saved_epochs(
    source: &ConfigSource,
    num_epochs: Option<usize>,
    stage: Option<usize>,
    min_interval: Option<usize>,
    max_interval: Option<usize>,
) -> anyhow::Result<BTreeSet<usize>> {
    let training = load(source)?.training;
    let policy = training.save;
    Ok(saved_epochs(
        num_epochs.unwrap_or(training.num_epochs),
        stage.unwrap_or(policy.num_stage_epochs),
        min_interval.unwrap_or(policy.min_interval),
        max_interval.unwrap_or(policy.max_interval),
    )?)
}

fn join_epochs(epochs: &BTreeSet<usize>) -> String {
    epochs
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn manager_for(config: &BackdoorConfig, ckpt_dir: Option<PathBuf>) -> CheckpointManager {
    CheckpointManager::new(ckpt_dir.unwrap_or_else(|| config.training.ckpt_dir.clone()))
}

fn handle_checkpoint(action: CheckpointAction, source: &ConfigSource) -> anyhow::Result<()> {
    let config = load(source)?;
    match action {
        CheckpointAction::Init { ckpt_dir } => {
            let manager = manager_for(&config, ckpt_dir);
            let target = manager.dir().join(LATEST_CHECKPOINT);
            if target.exists() {
                println!("Checkpoint already exists at: {}", target.display());
                return Ok(());
            }

            let network = get_network(&config.network);
            let optimizer = get_optimizer(network.as_ref(), &config.optimizer)?;
            let scheduler = get_scheduler(optimizer.as_ref(), config.lr_scheduler.as_ref())?;

            let mut record = CheckpointRecord::new(0, network.state_dict(), serde_json::json!({}))
                .with_optimizer(optimizer.as_ref())?;
            if let Some(scheduler) = &scheduler {
                record = record.with_scheduler(scheduler.as_ref())?;
            }
            if config.training.track_best {
                record = record.with_best(BestAccuracy { acc: 0.0, epoch: 0 });
            }

            let entry = manager.save(LATEST_CHECKPOINT, &record)?;
            println!(
                "Created {} ({} parameters, {} bytes) at: {}",
                network.name(),
                network.num_parameters(),
                entry.size_bytes,
                target.display()
            );
            Ok(())
        }
        CheckpointAction::List { ckpt_dir } => {
            let manager = manager_for(&config, ckpt_dir);
            let entries = manager.list()?;
            if entries.is_empty() {
                println!("No checkpoints recorded in {}", manager.dir().display());
                return Ok(());
            }
            println!("Checkpoints in {} ({}):", manager.dir().display(), entries.len());
            for entry in &entries {
                println!(
                    "  {:<20} epoch {:>5}  {:>12} bytes  {}  sha256:{}",
                    entry.name,
                    entry.epoch,
                    entry.size_bytes,
                    entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                    &entry.sha256[..12.min(entry.sha256.len())]
                );
            }
            Ok(())
        }
        CheckpointAction::Inspect { name, ckpt_dir } => {
            let manager = manager_for(&config, ckpt_dir);
            let path = resolve_checkpoint_path(&manager, &name);
            let record = manager
                .read(&path)
                .with_context(|| format!("Failed to read checkpoint {}", path.display()))?;
            println!("{}", describe_record(&record)?);
            Ok(())
        }
    }
}

/// A name inside the checkpoint directory, falling back to a literal path.
fn resolve_checkpoint_path(manager: &CheckpointManager, name: &str) -> PathBuf {
    let in_dir = manager.dir().join(name);
    if !in_dir.exists() && Path::new(name).exists() {
        PathBuf::from(name)
    } else {
        in_dir
    }
}

fn describe_record(record: &CheckpointRecord) -> anyhow::Result<String> {
    let state = record.model_state_dict()?;
    let elements: usize = state.values().map(|t| t.len()).sum();
    let mut lines = vec![
        format!("Epoch: {}", record.epoch()?),
        format!("Result: {}", record.result()?),
        format!("Model: {} tensors, {} values", state.len(), elements),
        format!(
            "Optimizer state: {}",
            if record.optimizer_state_dict().is_ok() { "yes" } else { "no" }
        ),
        format!(
            "Scheduler state: {}",
            if record.scheduler_state_dict().is_ok() { "yes" } else { "no" }
        ),
    ];
    if let (Ok(acc), Ok(epoch)) = (record.best_acc(), record.best_epoch()) {
        lines.push(format!("Best accuracy: {acc} (epoch {epoch})"));
    }
    lines.push(format!("Keys: {}", record.keys().join(", ")));
    Ok(lines.join("\n"))
}

fn handle_resume(
    from: Option<String>,
    ckpt_dir: Option<PathBuf>,
    source: &ConfigSource,
) -> anyhow::Result<()> {
    let config = load(source)?;
    let resume = from.map(Resume::from).unwrap_or_else(|| config.training.resume.clone());
    let manager = manager_for(&config, ckpt_dir);

    let mut network = get_network(&config.network);
    let mut optimizer = get_optimizer(network.as_ref(), &config.optimizer)?;
    let mut scheduler = get_scheduler(optimizer.as_ref(), config.lr_scheduler.as_ref())?;

    let resumed = manager
        .load_state(
            &mut network,
            &resume,
            Some(optimizer.as_mut() as &mut dyn Optimizer),
            scheduler.as_mut().map(|s| s.as_mut() as &mut dyn Scheduler),
            config.training.track_best,
        )
        .context("Failed to resume training state")?;

    let remaining: Vec<usize> = config
        .training
        .saved_epochs()?
        .into_iter()
        .filter(|&e| e > resumed.epoch)
        .collect();

    match &resumed.resumed_from {
        Some(path) => println!("Resumed from: {}", path.display()),
        None => println!("Training from scratch"),
    }
    println!("Resumed epoch: {}", resumed.epoch);
    println!("Learning rate: {}", optimizer.lr());
    if let Some(best) = resumed.best {
        println!("Best accuracy: {} (epoch {})", best.acc, best.epoch);
    }
    println!(
        "Next epochs to checkpoint: {}",
        remaining
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(())
}

fn handle_config(action: ConfigAction, source: &ConfigSource) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init { path } => {
            let Some(config_path) = path.or_else(user_config_path) else {
                bail!("Could not resolve a user config directory; pass a path.");
            };
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let toml_str = toml::to_string_pretty(&BackdoorConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(source)?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}
