// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use blockdev::backend::{
    DriverRegistry, FileDriver, InMemoryDriver, MemStore, OpenFlags,
};
use blockdev::layer::RunState;
use blockdev::BlockLayer;
use blockdev_config_toml::Config;
use clap::Parser;
use serde_json::json;
use slog::{o, Drain};

mod command;

use command::{Command, Defaults};

fn build_log() -> (slog::Logger, slog_async::AsyncGuard) {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
    (slog::Logger::root(drain.fuse(), o!()), guard)
}

/// Set up the block layer described by `config`: formats, images, then
/// drives in order.
fn setup_layer(
    config: &Config,
    log: &slog::Logger,
) -> anyhow::Result<BlockLayer> {
    let store = MemStore::new();
    let mut drivers = DriverRegistry::new();
    drivers.register(Arc::new(InMemoryDriver::cow("qcow2", store.clone())));
    drivers.register(Arc::new(InMemoryDriver::flat("raw-mem", store)));
    drivers.register(Arc::new(FileDriver));
    if let Some(formats) = &config.main.formats {
        let rw: Vec<&str> = formats.rw.iter().map(String::as_str).collect();
        let ro: Vec<&str> = formats.ro.iter().map(String::as_str).collect();
        drivers.set_whitelist(&rw, &ro);
    }

    let mut layer =
        BlockLayer::new(log.new(o!("component" => "block")), drivers);
    if config.main.incoming {
        layer.set_runstate(RunState::InMigrate);
    }

    for image in &config.images {
        layer
            .drivers()
            .img_create(
                &image.name,
                &image.format,
                image.backing.as_deref(),
                image.backing_format.as_deref(),
                image.size,
                OpenFlags::empty(),
                image.encryption_key.as_deref(),
            )
            .with_context(|| {
                format!("Failed to create image {}", image.name)
            })?;
        slog::info!(log, "image created";
            "name" => &image.name, "format" => &image.format);
    }

    for (i, drive) in config.drives.iter().enumerate() {
        let opts = drive
            .to_option_set()
            .with_context(|| format!("Invalid options for drive {}", i))?;
        layer
            .drive_init(opts, config.main.default_if)
            .with_context(|| format!("Failed to add drive {}", i))?;
    }
    Ok(layer)
}

fn load_script(path: &str) -> anyhow::Result<Vec<serde_json::Value>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read script {}", path))?;
    serde_json::Deserializer::from_str(&contents)
        .into_iter::<serde_json::Value>()
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Malformed script {}", path))
}

fn print_events(
    out: &mut impl Write,
    layer: &mut BlockLayer,
) -> std::io::Result<()> {
    for event in layer.take_events() {
        writeln!(out, "{}", json!(event))?;
    }
    Ok(())
}

#[derive(clap::Parser)]
/// Run a set of drives and a script of management commands against them.
struct Args {
    /// The block layer config file.
    #[clap(value_name = "CONFIG", action)]
    config: String,

    /// JSON commands to execute, one object after another.
    #[clap(short, long, action)]
    script: Option<String>,

    /// Upper bound on control loop rounds when waiting for jobs.
    #[clap(short, long, action, default_value_t = 10_000)]
    max_polls: usize,
}

fn main() -> anyhow::Result<()> {
    let Args { config, script, max_polls } = Args::parse();

    let (log, _log_async_guard) = build_log();

    let cfg = blockdev_config_toml::parse(&config)
        .with_context(|| format!("Failed to parse config {}", config))?;
    let mut layer = setup_layer(&cfg, &log)?;
    slog::info!(log, "block layer ready"; "drives" => layer.drives().len());

    let commands = match &script {
        Some(path) => load_script(path)?,
        None => Vec::new(),
    };
    let defaults = Defaults { if_type: cfg.main.default_if, max_polls };

    let mut out = std::io::stdout().lock();
    for raw in commands {
        let reply = match serde_json::from_value::<Command>(raw) {
            Ok(cmd) => {
                slog::debug!(log, "executing command"; "command" => ?cmd);
                command::execute(&mut layer, cmd, defaults)
            }
            Err(e) => command::error_reply(
                blockdev::ErrorClass::GenericError,
                &format!("Invalid command: {}", e),
            ),
        };
        writeln!(out, "{}", reply)?;
        print_events(&mut out, &mut layer)?;
    }

    let polls = layer.run_until_idle(max_polls);
    print_events(&mut out, &mut layer)?;
    let remaining = layer.query_block_jobs();
    if !remaining.is_empty() {
        slog::warn!(log, "block jobs still running";
            "jobs" => remaining.len(), "polls" => polls);
    }
    Ok(())
}
