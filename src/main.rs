use clap::Parser;
use clinic_cache::config::Config;
use clinic_cache::fetch::ApiKeyCredentials;
use clinic_cache::{
  logging, AdaptiveConfigProvider, CacheStore, ConnectionMonitor, HttpFetcher, LifecycleBus,
  LifecycleEvent, LogNotifier, Query, SmartRefreshScheduler,
};
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "clinic-cache")]
#[command(about = "Watch a clinic backend resource through the freshness cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/clinic-cache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Resource path relative to the backend URL
  #[arg(short, long, default_value = "rest/v1/appointments?select=*")]
  resource: String,

  /// Seconds between cache reads
  #[arg(short, long, default_value_t = 5)]
  interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.logging)?;

  let bus = LifecycleBus::new();
  let monitor = ConnectionMonitor::new(config.connection);
  monitor.attach_lifecycle_bus(bus.clone());

  let adaptive = AdaptiveConfigProvider::new(monitor.clone()).with_overrides(config.cache.adaptive);
  let store =
    CacheStore::with_settings(adaptive.clone(), config.cache_settings()).with_notifier(Arc::new(LogNotifier));
  let scheduler = SmartRefreshScheduler::new(adaptive);
  let _listener = scheduler.spawn_listener(&bus);

  let http = HttpFetcher::new(&config.backend.url, Arc::new(ApiKeyCredentials::from_env()?))?;
  let mut query = Query::new(store.clone(), args.resource.as_str(), http.fetcher(&args.resource));
  let _registration = query.watch_lifecycle(&scheduler);

  info!(resource = %args.resource, backend = %config.backend.url, "watching resource");
  println!("Watching {} (f: focus, v: visible, o: offline, n: online, r: refetch, q: quit)", args.resource);

  let mut reads = tokio::time::interval(Duration::from_secs(args.interval.max(1)));
  let mut gc = tokio::time::interval(Duration::from_secs(config.cache.gc_interval_secs.max(1)));
  let mut commands = BufReader::new(tokio::io::stdin()).lines();
  let ctrl_c = tokio::signal::ctrl_c();
  tokio::pin!(ctrl_c);

  loop {
    tokio::select! {
      _ = reads.tick() => {
        let result = query.read()?;
        if query.poll() {
          let rows = result
            .data
            .as_ref()
            .map_or(0, |data| data.as_array().map_or(1, Vec::len));
          let fetched = result
            .fetched_at
            .map(|at| at.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
          println!(
            "[{:?}] {:?}: {} row(s), fetched {}",
            monitor.quality(),
            result.status,
            rows,
            fetched
          );
          if let Some(error) = &result.error {
            println!("  last error: {}", error);
          }
        }
      }
      _ = gc.tick() => {
        store.collect_garbage();
      }
      line = commands.next_line() => {
        match line?.as_deref().map(str::trim) {
          Some("f") => bus.publish(LifecycleEvent::FocusGained),
          Some("v") => bus.publish(LifecycleEvent::BecameVisible),
          Some("o") => monitor.set_online(false),
          Some("n") => monitor.set_online(true),
          Some("r") => {
            let _ = query.refetch()?;
          }
          Some("q") | None => break,
          Some(_) => {}
        }
      }
      _ = &mut ctrl_c => break,
    }
  }

  info!("shutting down");
  Ok(())
}
