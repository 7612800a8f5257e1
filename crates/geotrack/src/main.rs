//! `geotrack` - CLI for order location tracking
//!
//! This binary samples positions for an order and inspects the stored
//! history and live positions.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _};
use clap::Parser;
use tracing::{debug, info};

use geotrack::cli::{
    Cli, Command, ConfigCommand, HistoryCommand, LatestCommand, OrdersCommand, TrackCommand,
    WatchCommand,
};
use geotrack::geo::{format_coordinate, Axis};
use geotrack::orders::generate_order_id;
use geotrack::store::tracked_duration;
use geotrack::{
    init_logging, AggregationSource, Clock, Config, Coordinates, LiveBoard, LocationProvider,
    LocationStore, Order, OrderBook, OrderRegistry, Poller, PositionSample, ReplayProvider,
    Sampler, SimulatedProvider, SqliteMedium, SystemClock, TrackedOrderView,
};

/// Everything the commands read from or write to.
#[derive(Debug)]
struct App {
    config: Config,
    medium: Arc<SqliteMedium>,
    store: Arc<LocationStore>,
    orders: Arc<OrderBook>,
    clock: Arc<dyn Clock>,
}

impl App {
    fn open(config: Config) -> anyhow::Result<Self> {
        let path = config.database_path();
        let medium = Arc::new(
            SqliteMedium::open(&path)
                .with_context(|| format!("opening database {}", path.display()))?,
        );
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(
            LocationStore::new(medium.clone(), clock.clone())
                .with_key(config.storage.samples_key.clone())
                .with_max_per_order(config.storage.max_samples_per_order),
        );
        let orders = Arc::new(OrderBook::new(
            medium.clone(),
            config.storage.orders_key.clone(),
            clock.clone(),
        ));
        Ok(Self {
            config,
            medium,
            store,
            orders,
            clock,
        })
    }

    fn board(&self) -> LiveBoard {
        LiveBoard::new(self.store.clone(), self.orders.clone())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbosity());

    if let Command::Config(config_cmd) = &cli.command {
        return handle_config(cli.config.as_deref(), config_cmd);
    }

    let config = Config::load_from(cli.config.clone()).context("loading configuration")?;
    let app = App::open(config)?;

    match cli.command {
        Command::Track(cmd) => handle_track(&app, &cmd).await,
        Command::History(cmd) => handle_history(&app, &cmd),
        Command::Latest(cmd) => handle_latest(&app, &cmd),
        Command::Watch(cmd) => handle_watch(&app, &cmd).await,
        Command::Orders(cmd) => handle_orders(&app, cmd),
        Command::Status(cmd) => handle_status(&app, cmd.json),
        Command::Config(_) => Ok(()),
    }
}

async fn handle_track(app: &App, cmd: &TrackCommand) -> anyhow::Result<()> {
    let provider: Arc<dyn LocationProvider> = match &cmd.replay {
        Some(path) => Arc::new(
            ReplayProvider::from_jsonl(path)
                .with_context(|| format!("loading replay script {}", path.display()))?,
        ),
        None => Arc::new(SimulatedProvider::default()),
    };

    if app.orders.lookup(&cmd.order)?.is_none() {
        println!(
            "Note: order {} is not registered; it will not appear in `latest` until it is.",
            cmd.order
        );
    }

    let sampler = Sampler::new(provider, app.store.clone(), app.config.sampler_config());
    let mut status = sampler.subscribe();

    if let Err(e) = sampler.start_tracking(&cmd.order, &cmd.user).await {
        bail!("{}", e.message);
    }
    println!("Tracking {} for {} (Ctrl-C to stop)", cmd.order, cmd.user);

    let deadline = cmd.duration_secs.map(Duration::from_secs);
    let stop_after = async {
        match deadline {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(stop_after);

    let mut last_printed: Option<String> = None;
    loop {
        {
            let current = status.borrow_and_update();
            if let Some(sample) = &current.location {
                if last_printed.as_deref() != Some(sample.id.as_str()) {
                    print_sample(sample);
                    last_printed = Some(sample.id.clone());
                }
            }
            if let Some(error) = &current.error {
                debug!("Last tracking error: {}", error.message);
            }
            if !current.is_tracking {
                println!("Provider ended the watch.");
                break;
            }
        }

        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            () = &mut stop_after => {
                info!("Tracking duration elapsed");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    sampler.stop_tracking();
    let stored = app.store.history_for(&cmd.order)?.len();
    println!("Stopped. {stored} samples stored for {}.", cmd.order);
    Ok(())
}

fn handle_history(app: &App, cmd: &HistoryCommand) -> anyhow::Result<()> {
    let history = app.store.history_for(&cmd.order)?;
    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&history)?);
        return Ok(());
    }
    if history.is_empty() {
        println!("No samples stored for {}.", cmd.order);
        return Ok(());
    }
    println!("History for {} ({} updates)", cmd.order, history.len());
    if let Some(duration) = tracked_duration(&history) {
        let minutes = (duration.num_milliseconds() + 30_000).div_euclid(60_000);
        println!("Tracked for {minutes} minutes");
    }
    for sample in &history {
        print_sample(sample);
    }
    Ok(())
}

fn handle_latest(app: &App, cmd: &LatestCommand) -> anyhow::Result<()> {
    let views = app.board().latest()?;
    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&views)?);
    } else {
        print_views(app, &views);
    }
    Ok(())
}

async fn handle_watch(app: &App, cmd: &WatchCommand) -> anyhow::Result<()> {
    let interval = cmd
        .interval_ms
        .map_or_else(|| app.config.poll_interval(), Duration::from_millis);
    let handle = Poller::start(Arc::new(app.board()), app.clock.clone(), interval)?;
    let mut updates = handle.subscribe();
    let mut seen = 0u64;

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }

        let update = updates.borrow_and_update().clone();
        if let Some(update) = update {
            println!(
                "--- refreshed {} ---",
                update.refreshed_at.format("%Y-%m-%d %H:%M:%S")
            );
            print_views(app, &update.views);
            seen += 1;
        }
        if cmd.count.is_some_and(|count| seen >= count) {
            break;
        }
    }

    handle.stop();
    Ok(())
}

fn handle_orders(app: &App, cmd: OrdersCommand) -> anyhow::Result<()> {
    match cmd {
        OrdersCommand::Add {
            dest_lat,
            dest_lng,
            assign,
            id,
        } => {
            let mut order = Order::new(
                id.unwrap_or_else(generate_order_id),
                Coordinates::new(dest_lat, dest_lng),
            );
            if let Some(user) = assign {
                order = order.assign(user);
            }
            let order = app.orders.create(order)?;
            println!("Created order {} ({})", order.id, order.status);
        }
        OrdersCommand::List { json } => {
            let orders = app.orders.orders()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&orders)?);
            } else if orders.is_empty() {
                println!("No orders registered.");
            } else {
                for order in &orders {
                    println!(
                        "{:<10} {:<11} {:<14} -> {}",
                        order.id,
                        order.status.to_string(),
                        order.assigned_to.as_deref().unwrap_or("-"),
                        order.destination
                    );
                }
            }
        }
        OrdersCommand::Status { id, status } => match app.orders.set_status(&id, status)? {
            Some(order) => println!("Order {} is now {}", order.id, order.status),
            None => bail!("no order with id {id}"),
        },
    }
    Ok(())
}

fn handle_status(app: &App, json: bool) -> anyhow::Result<()> {
    let stats = app.store.stats()?;
    let orders = app.orders.orders()?.len();
    let tracked = app.board().latest()?.len();

    if json {
        let status = serde_json::json!({
            "database_path": app.medium.path(),
            "database_size_bytes": app.medium.size_bytes(),
            "total_samples": stats.total_samples,
            "orders_with_samples": stats.orders,
            "malformed_records": stats.malformed_records,
            "oldest_sample": stats.oldest_sample,
            "newest_sample": stats.newest_sample,
            "registered_orders": orders,
            "tracked_orders": tracked,
            "max_samples_per_order": app.store.max_per_order(),
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("geotrack status");
        println!("---------------");
        println!("Database:          {}", app.medium.path().display());
        println!("Size:              {} bytes", app.medium.size_bytes());
        println!("Samples:           {}", stats.total_samples);
        println!("Orders w/ samples: {}", stats.orders);
        if stats.malformed_records > 0 {
            println!("Malformed records: {}", stats.malformed_records);
        }
        println!("Registered orders: {orders}");
        println!("Tracked orders:    {tracked}");
        if let (Some(oldest), Some(newest)) = (stats.oldest_sample, stats.newest_sample) {
            println!("Oldest sample:     {}", oldest.to_rfc3339());
            println!("Newest sample:     {}", newest.to_rfc3339());
        }
    }
    Ok(())
}

fn handle_config(config_path: Option<&Path>, cmd: &ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            let config = Config::load_from(config_path.map(Path::to_path_buf))?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Storage]");
                println!("  Database path:         {}", config.database_path().display());
                println!("  Max samples per order: {}", config.storage.max_samples_per_order);
                println!("  Samples key:           {}", config.storage.samples_key);
                println!("  Orders key:            {}", config.storage.orders_key);
                println!();
                println!("[Tracking]");
                println!("  High accuracy:         {}", config.tracking.high_accuracy);
                println!("  Initial timeout (ms):  {}", config.tracking.initial_timeout_ms);
                println!("  Watch timeout (ms):    {}", config.tracking.watch_timeout_ms);
                println!("  Maximum age (ms):      {}", config.tracking.maximum_age_ms);
                println!();
                println!("[Polling]");
                println!("  Interval (ms):         {}", config.polling.interval_ms);
                println!("  Live threshold (s):    {}", config.polling.live_threshold_secs);
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file
                .clone()
                .or_else(|| config_path.map(Path::to_path_buf))
                .unwrap_or_else(Config::default_config_path);
            Config::load_file(&path)?;
            println!("Configuration is valid: {}", path.display());
        }
    }
    Ok(())
}

fn print_sample(sample: &PositionSample) {
    let accuracy = sample
        .accuracy
        .map_or_else(|| "-".to_string(), |a| format!("±{a:.0} m"));
    println!(
        "{}  {}  {}  {}",
        sample.timestamp.format("%Y-%m-%d %H:%M:%S"),
        format_coordinate(sample.location.lat, Axis::Latitude),
        format_coordinate(sample.location.lng, Axis::Longitude),
        accuracy
    );
}

fn print_views(app: &App, views: &[TrackedOrderView]) {
    if views.is_empty() {
        println!("No tracked orders.");
        return;
    }
    let now = app.clock.now();
    let threshold = app.config.live_threshold();
    for view in views {
        let age = (now - view.sample.timestamp).num_seconds().max(0);
        println!(
            "{:<10} {:<4} {:<11} {} {}  {:>7.2} km to go  ({}s ago, {})",
            view.order_id,
            if view.is_live(now, threshold) { "LIVE" } else { "" },
            view.order.status.to_string(),
            format_coordinate(view.sample.location.lat, Axis::Latitude),
            format_coordinate(view.sample.location.lng, Axis::Longitude),
            view.distance_to_destination_km(),
            age,
            view.sample.user_id
        );
    }
}
