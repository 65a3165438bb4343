use std::{process, sync::Arc};

use fotocache::{
    application::{error::AppError, rules::register_default_rules, runtime::CacheRuntime},
    cache::{
        CacheConfig, CacheEvent, InvalidationCompleted, PreloadTargets, ResourceSource,
        Subscription,
    },
    config,
    infra::{
        http::HttpSource,
        probe::{ConnectivityProbe, HealthCheck},
        telemetry,
    },
};
use time::format_description::well_known::Rfc3339;
use tokio::sync::watch;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    let messages = error.messages();
    if dispatcher::has_been_set() {
        error!(error = %error, chain = ?messages, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, chain = ?messages, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Preload(args) => run_preload(settings, args).await,
    }
}

fn build_runtime(settings: &config::Settings) -> Result<(CacheRuntime, Arc<HttpSource>), AppError> {
    let source = Arc::new(HttpSource::new(&settings.api)?);
    let runtime = CacheRuntime::new(CacheConfig::from(&settings.cache), source.clone());
    register_default_rules(runtime.manager())?;
    Ok((runtime, source))
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let (runtime, source) = build_runtime(&settings)?;

    info!(
        target = "fotocache::serve",
        base_url = %settings.api.base_url,
        "Starting cache engine"
    );

    let probe = ConnectivityProbe::new(
        source as Arc<dyn HealthCheck>,
        settings.api.probe_interval,
    );
    let (online, probe_handle) = probe.spawn();
    // Headless: the storefront is always in the foreground.
    let (_visible_tx, visible) = watch::channel(true);
    let watcher = runtime.attach_watcher(online, visible);

    let sweep_handle = runtime.spawn_eviction_sweep();
    let log_handle = tokio::spawn(log_cache_events(runtime.subscribe()));

    let warming = runtime.preloader().smart_preload("/");
    info!(target = "fotocache::serve", keys = warming.len(), "Startup preload started");

    let result = tokio::signal::ctrl_c()
        .await
        .map_err(|err| AppError::unexpected(format!("failed to listen for shutdown: {err}")));
    info!(target = "fotocache::serve", "Shutdown requested");

    watcher.shutdown().await;
    for handle in [probe_handle, sweep_handle, log_handle] {
        handle.abort();
        let _ = handle.await;
    }

    let stats = runtime.cache().stats();
    info!(
        target = "fotocache::serve",
        hits = stats.hits,
        stale_hits = stats.stale_hits,
        misses = stats.misses,
        fetches = stats.fetches,
        evictions = stats.evictions,
        "Cache engine stopped"
    );

    result
}

async fn run_preload(settings: config::Settings, args: config::PreloadArgs) -> Result<(), AppError> {
    let (runtime, _) = build_runtime(&settings)?;
    let targets = PreloadTargets::for_path(&args.path);
    if targets.keys.is_empty() {
        return Err(AppError::validation(format!(
            "nothing to preload for path `{}`",
            args.path
        )));
    }

    info!(
        target = "fotocache::preload",
        path = %args.path,
        keys = targets.keys.len(),
        "Starting preload"
    );

    if let Some(event) = targets.warm_event.as_deref()
        && let Err(err) = runtime.source().warm_event(event).await
    {
        warn!(target = "fotocache::preload", event, error = %err, "Backend warm-up failed");
    }

    let preloader = runtime.preloader();
    let results = futures::future::join_all(
        targets
            .keys
            .iter()
            .map(|key| preloader.preload_key(key.clone())),
    )
    .await;

    let mut loaded = 0;
    for (key, result) in targets.keys.iter().zip(&results) {
        match result {
            Some(_) => {
                loaded += 1;
                info!(target = "fotocache::preload", key = %key, "Preloaded");
            }
            None => warn!(target = "fotocache::preload", key = %key, "Preload failed"),
        }
    }

    info!(
        target = "fotocache::preload",
        loaded,
        failed = targets.keys.len() - loaded,
        "Preload completed"
    );
    Ok(())
}

async fn log_cache_events(mut subscription: Subscription) {
    while let Some(event) = subscription.recv().await {
        match event {
            CacheEvent::Invalidated(completed) => log_completion(&completed),
            CacheEvent::FetchFailed { key, error } => {
                warn!(target = "fotocache::events", key = %key, error, "Background refresh failed");
            }
        }
    }
}

fn log_completion(completed: &InvalidationCompleted) {
    let timestamp = completed
        .timestamp
        .format(&Rfc3339)
        .unwrap_or_else(|_| completed.timestamp.to_string());
    info!(
        target = "fotocache::events",
        id = %completed.id,
        epoch = completed.epoch,
        trigger = %completed.trigger,
        keys = ?completed.keys,
        %timestamp,
        "Cache invalidated"
    );
}
