use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kube::core::DynamicObject;
use lazywatch_kubehub::{dynamic_watcher, set_unhandled_error_hook, ObjectKey, StateListener, WatchConfig, Watcher};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "lazywatchctl", version, about = "Lazily started, debounced kube watchers")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Seconds to wait for the initial list before giving up
    #[arg(long = "wait-secs", global = true, env = "LAZYWATCH_WAIT_SECS", default_value_t = 8)]
    wait_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List cached objects for a group/version/kind key
    Ls {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
    },
    /// Print one cached object
    Get {
        /// GVK key, e.g. "v1/Pod"
        gvk: String,
        name: String,
    },
    /// Print +/~/- lines each time a burst of changes settles
    Watch {
        /// GVK key, e.g. "apps/v1/Deployment"
        gvk: String,
    },
}

fn init_tracing() {
    let env = std::env::var("LAZYWATCH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("LAZYWATCH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid LAZYWATCH_METRICS_ADDR; expected host:port");
        }
    }
}

async fn synced_watcher(gvk: &str, ns: Option<&str>, wait: Duration) -> Result<Watcher<DynamicObject>> {
    let client = kube::Client::try_default().await.context("building kube client")?;
    let w = dynamic_watcher(client, gvk, ns, WatchConfig::from_env()).await?;
    match tokio::time::timeout(wait, w.wait_synced()).await {
        Ok(true) => {}
        Ok(false) => anyhow::bail!("watcher for {} was cancelled before its initial list", gvk),
        Err(_) => warn!(gvk = %gvk, wait_secs = wait.as_secs(), "initial list not complete; output may be partial"),
    }
    Ok(w)
}

fn key_of(o: &DynamicObject) -> String {
    ObjectKey::new(o.metadata.namespace.as_deref(), o.metadata.name.as_deref().unwrap_or("")).to_string()
}

fn render_age(o: &DynamicObject) -> String {
    let Some(created) = o.metadata.creation_timestamp.as_ref() else { return "-".to_string() };
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
    let mut secs = (now - created.0.timestamp()).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}

/// Print what changed since the previous settle; `seen` maps key -> resourceVersion.
fn print_changes(items: &[DynamicObject], seen: &mut HashMap<String, String>, output: Output) -> Result<()> {
    let mut current: HashMap<String, String> = HashMap::with_capacity(items.len());
    for o in items {
        let key = key_of(o);
        let rv = o.metadata.resource_version.clone().unwrap_or_default();
        match seen.get(&key) {
            None => emit('+', &key, output)?,
            Some(prev) if *prev != rv => emit('~', &key, output)?,
            Some(_) => {}
        }
        current.insert(key, rv);
    }
    let mut gone: Vec<_> = seen.keys().filter(|k| !current.contains_key(*k)).cloned().collect();
    gone.sort();
    for key in gone {
        emit('-', &key, output)?;
    }
    *seen = current;
    Ok(())
}

fn emit(op: char, key: &str, output: Output) -> Result<()> {
    match output {
        Output::Human => println!("{} {}", op, key),
        Output::Json => println!("{}", serde_json::to_string(&serde_json::json!({ "op": op.to_string(), "key": key }))?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    set_unhandled_error_hook(|err| error!(error = %err, "unhandled watch error"));
    let cli = Cli::parse();
    let ns = cli.namespace.as_deref();
    let wait = Duration::from_secs(cli.wait_secs);

    match cli.command {
        Commands::Ls { gvk } => {
            info!(gvk = %gvk, ns = ?ns, "ls invoked");
            let w = synced_watcher(&gvk, ns, wait).await?;
            let mut items = w.list();
            items.sort_by_key(key_of);
            match cli.output {
                Output::Human => {
                    println!("NAMESPACE   NAME                 AGE");
                    for item in &items {
                        let ns_col = item.metadata.namespace.clone().unwrap_or_else(|| "-".to_string());
                        let name = item.metadata.name.as_deref().unwrap_or("");
                        println!("{:<11} {:<20} {}", ns_col, name, render_age(item));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&items)?),
            }
            w.cancel();
        }
        Commands::Get { gvk, name } => {
            info!(gvk = %gvk, ns = ?ns, name = %name, "get invoked");
            let w = synced_watcher(&gvk, ns, wait).await?;
            let key = ObjectKey::new(w.namespace(), &name);
            match w.get(&key)? {
                Some(obj) => println!("{}", serde_json::to_string_pretty(&obj)?),
                None => eprintln!("{} not found", key),
            }
            w.cancel();
        }
        Commands::Watch { gvk } => {
            info!(gvk = %gvk, ns = ?ns, "watch invoked");
            let client = kube::Client::try_default().await.context("building kube client")?;
            let w = dynamic_watcher(client, &gvk, ns, WatchConfig::from_env()).await?;

            // Surface self-cancellation (e.g. access denied) to the loop below.
            let (state_tx, mut state_rx) = mpsc::unbounded_channel::<()>();
            let listener = StateListener::new(move || { let _ = state_tx.send(()); });
            w.add_state_listener(&listener);

            let mut settled = w.settled();
            let mut seen: HashMap<String, String> = HashMap::new();
            w.start();
            loop {
                tokio::select! {
                    changed = settled.changed() => {
                        if changed.is_err() { break; }
                        print_changes(&w.list(), &mut seen, cli.output)?;
                    }
                    Some(()) = state_rx.recv() => {
                        if !w.active() {
                            warn!(gvk = %gvk, "watcher cancelled; exiting watch loop");
                            break;
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        break;
                    }
                }
            }
            w.remove_state_listener(&listener);
            w.cancel();
        }
    }

    Ok(())
}
