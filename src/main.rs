use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

mod app;
mod catalog;
mod cli;
mod config;
mod listing;
mod lock;
mod semantic;
mod session;
mod storage;
#[cfg(test)]
mod tests;
mod web;

use app::{
    task_runner::{StartOutcome, TaskState, TaskStatus},
    AppFactory, IndexService, QueryOutcome,
};
use cli::QueryArgs;

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();
    init_logging();

    let paths = AppFactory::get_paths()?;
    let config = AppFactory::create_config(&paths)?;
    let service = Arc::new(AppFactory::create_service(&paths, &config)?);

    match args.command {
        cli::Command::Serve { listen, no_refresh } => {
            let rebuilding = service.open()?;
            if !rebuilding && !no_refresh && service.start_refresh() == StartOutcome::Busy {
                log::warn!("could not start the startup refresh");
            }

            let listen = listen.unwrap_or_else(|| config.listen.clone());
            web::start_daemon(service, config.images_root(), listen)
        }

        cli::Command::Init {} => run_task(&service, |s| s.start_init()),

        cli::Command::Refresh {} => {
            service.reconciler().load_snapshot()?;
            run_task(&service, |s| s.start_refresh())?;
            if let Some(report) = service.last_report() {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            Ok(())
        }

        cli::Command::Reset {} => run_task(&service, |s| s.start_reset()),

        cli::Command::Clear {} => run_task(&service, |s| s.start_clear()),

        cli::Command::Query(query) => {
            if service.open()? {
                log::info!("index was missing, waiting for the rebuild");
                finish(watch(&service))?;
            }
            run_query(&service, query)
        }

        cli::Command::Classify { image, label } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("Failed to read {}", image.display()))?;
            let scores = service.classify(&bytes, &label)?;
            println!("{}", serde_json::to_string_pretty(&scores)?);
            Ok(())
        }

        cli::Command::Status {} => {
            let loaded = service.reconciler().load_snapshot()?;
            let rows = service.reconciler().catalog().count()?;
            let indexed = service
                .reconciler()
                .index()
                .map(|index| index.len())
                .unwrap_or(0);

            println!("images root: {}", config.images_root().display());
            println!("model:       {}", config.model);
            println!("catalog:     {rows} images");
            if loaded {
                println!("index:       {indexed} rows");
            } else {
                println!("index:       missing or stale, run `imgdex reset`");
            }
            Ok(())
        }
    }
}

fn run_task(
    service: &IndexService,
    start: impl FnOnce(&IndexService) -> StartOutcome,
) -> anyhow::Result<()> {
    if start(service) == StartOutcome::Busy {
        bail!("another task is running");
    }
    finish(watch(service))
}

/// Render the running task's progress until it ends.
fn watch(service: &IndexService) -> TaskStatus {
    let bar = ProgressBar::new(1000);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.cyan} [{bar:30.cyan/dim}] {percent:>3}% {msg} ({elapsed})")
    {
        bar.set_style(style);
    }
    bar.enable_steady_tick(Duration::from_millis(100));

    loop {
        let status = service.status();
        bar.set_message(status.description.clone());
        if status.progress >= 0.0 {
            bar.set_position((status.progress * 1000.0) as u64);
        }

        if !status.is_running() {
            bar.finish_and_clear();
            return service.join();
        }
        std::thread::sleep(Duration::from_millis(200));
    }
}

fn finish(status: TaskStatus) -> anyhow::Result<()> {
    match status.state {
        Some(TaskState::Done) | None => {
            println!("{}: done", status.title);
            Ok(())
        }
        Some(TaskState::Aborted) => bail!("{} was aborted", status.title),
        Some(TaskState::Failed) | Some(TaskState::Running) => bail!(
            "{} failed: {}",
            status.title,
            status.error.unwrap_or_default()
        ),
    }
}

fn run_query(service: &IndexService, query: QueryArgs) -> anyhow::Result<()> {
    let outcome = match (query.text, query.id, query.image) {
        (Some(text), _, _) => service.query_text(&text, query.page)?,
        (_, Some(id), _) => service.query_id(id, query.page)?,
        (_, _, Some(image)) => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("Failed to read {}", image.display()))?;
            let session = service.new_session();
            service
                .query_image(&bytes, &session)?
                .map(|tagged| tagged.results)
        }
        _ => bail!("one of --text, --id or --image is required"),
    };

    match outcome {
        QueryOutcome::Ready(results) => {
            println!("{}", serde_json::to_string_pretty(&results)?);
            Ok(())
        }
        QueryOutcome::Busy => bail!("index is being rebuilt, try again later"),
    }
}
