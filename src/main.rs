use filmeto::cli::{Args, Command};
use filmeto::config::FilmetoConfig;
use filmeto::core::compose_queue::LayerComposeTaskManager;
use filmeto::core::event_bus::{EventBus, Notifier};
use filmeto::core::events::{LayerChangedEvent, TimelineChangedEvent};
use filmeto::entities::layer::Layer;
use filmeto::entities::layer_manager::LayerManager;
use filmeto::entities::timeline::{ItemServices, Timeline};
use filmeto::paths::{self, PathConfig};

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for draining the compose queue before exit
const DRAIN_TIMEOUT: Duration = Duration::from_secs(600);

fn init_logging(args: &Args, path_config: &PathConfig) -> Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let default_level = match args.verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .clone()
            .unwrap_or_else(|| paths::data_file("filmeto.log", path_config));
        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file {}", log_path.display()))?;

        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();
        info!("Logging to file: {} (level: {})", log_path.display(), default_level);
    } else {
        // Console logging (respects RUST_LOG if set)
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

fn layer_line(layer: &Layer) -> String {
    format!(
        "{:>4}  {} {:<8} {:<24} {}{}  {}x{} @ ({}, {})",
        layer.id,
        layer.layer_type.icon(),
        layer.layer_type.as_str(),
        layer.name,
        if layer.visible { "V" } else { "-" },
        if layer.locked { "L" } else { "-" },
        layer.width,
        layer.height,
        layer.x,
        layer.y
    )
}

fn manager_for(timeline: &Timeline, index: usize) -> Result<Arc<LayerManager>> {
    let item = timeline.item(index)?;
    Ok(item.layer_manager()?)
}

fn run(args: &Args, timeline: &Timeline) -> Result<()> {
    match &args.command {
        Command::Items => {
            for index in 1..=timeline.item_count() {
                let item = timeline.item(index)?;
                let layers = item.layer_manager()?.layer_count();
                let mark = if item.is_selected() { "*" } else { " " };
                let outputs = match (item.image_path().is_file(), item.video_path().is_file()) {
                    (true, true) => "composed",
                    (false, false) => "not composed",
                    _ => "partial",
                };
                println!("{}{:>4}  {} layers  {}", mark, index, layers, outputs);
            }
        }
        Command::AddItem => {
            let item = timeline.add_item()?;
            println!("{}", item.index());
        }
        Command::Layers { item } => {
            for layer in manager_for(timeline, *item)?.get_layers() {
                println!("{}", layer_line(&layer));
            }
        }
        Command::AddLayer {
            item,
            layer_type,
            from,
            x,
            y,
        } => {
            let manager = manager_for(timeline, *item)?;
            let layer = match from {
                Some(path) => manager.add_layer_from_file(path, *layer_type)?,
                None => manager.add_layer(*layer_type)?,
            };
            if x.is_some() || y.is_some() {
                manager.set_position(layer.id, x.unwrap_or(layer.x), y.unwrap_or(layer.y))?;
            }
            println!("{}", layer.id);
        }
        Command::RemoveLayer { item, id } => {
            if !manager_for(timeline, *item)?.remove_layer(*id)? {
                bail!("No layer {} in item {}", id, item);
            }
        }
        Command::ToggleVisible { item, id } => {
            let visible = manager_for(timeline, *item)?
                .toggle_visibility(*id)?
                .with_context(|| format!("No layer {} in item {}", id, item))?;
            println!("{}", if visible { "visible" } else { "hidden" });
        }
        Command::ToggleLock { item, id } => {
            let locked = manager_for(timeline, *item)?
                .toggle_lock(*id)?
                .with_context(|| format!("No layer {} in item {}", id, item))?;
            println!("{}", if locked { "locked" } else { "unlocked" });
        }
        Command::Rename { item, id, name } => {
            if !manager_for(timeline, *item)?.rename_layer(*id, name)? {
                bail!("No layer {} in item {}", id, item);
            }
        }
        Command::MoveLayer { item, id, to } => {
            if !manager_for(timeline, *item)?.move_layer(*id, *to)? {
                bail!("No layer {} in item {}", id, item);
            }
        }
        Command::Compose { item, all } => {
            let indices: Vec<usize> = if *all {
                (1..=timeline.item_count()).collect()
            } else {
                item.iter().copied().collect()
            };
            for index in indices {
                let manager = manager_for(timeline, index)?;
                match manager.request_compose() {
                    Some(task_id) => info!("Item {}: queued {}", index, task_id),
                    None => warn!("Item {}: compose queue unavailable", index),
                }
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let path_config = PathConfig::from_env_and_cli(args.config_dir.clone());
    if let Err(e) = paths::ensure_dirs(&path_config) {
        eprintln!("Warning: Failed to create application directories: {}", e);
    }
    init_logging(&args, &path_config)?;
    debug!("Command-line args: {:?}", args);

    let config_path = paths::config_file("filmeto.yml", &path_config);
    let mut config = FilmetoConfig::load(&config_path)?.with_env_overrides();
    if args.no_compose {
        config.auto_compose = false;
    }
    info!("Config path: {}", config_path.display());
    let config = Arc::new(config);

    let bus = EventBus::new();
    bus.subscribe::<LayerChangedEvent, _>(|e| {
        debug!("Item {}: layer {} {}", e.item_index, e.layer.id, e.kind.as_str());
    });
    bus.subscribe::<TimelineChangedEvent, _>(|e| {
        info!("Item {} composed: {}", e.item_index, e.video_path.display());
    });

    let queue = LayerComposeTaskManager::new(&config).context("Failed to start compose queue")?;
    let services = ItemServices::new(Arc::clone(&config))
        .with_notifier(Notifier::from_emitter(bus.emitter()))
        .with_composer(queue.clone());
    let timeline = Timeline::open(&args.project_dir, services)?;

    let result = run(&args, &timeline);

    if !queue.wait_idle(DRAIN_TIMEOUT) {
        warn!("Compose queue still busy after {:?}", DRAIN_TIMEOUT);
    }
    queue.shutdown();
    result
}
