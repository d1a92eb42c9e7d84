use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use identity_relay::bus::{BusMessage, LocalBus, MessageBus, Router};
use identity_relay::config::RelayConfig;
use identity_relay::identity::{Credentials, RemoteIdentity};
use identity_relay::protocol::{LoopbackNetwork, LoopbackProtocol, Protocol};
use identity_relay::store::{Database, LibSqlBackend};
use identity_relay::worker::{WorkerDeps, WorkerRegistry};

/// Subject on which replies to stdin orders are collected.
const CLI_REPLY_SUBJECT: &str = "_INBOX.cli";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = RelayConfig::from_env().context("invalid relay configuration")?;

    eprintln!("identity-relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Management subject: {}", config.router.management_subject);
    eprintln!("   Delivery subject: {}", config.router.delivery_subject);
    eprintln!("   Scheduler subject: {}", config.worker.scheduler_subject);
    eprintln!("   Commands:");
    eprintln!("     account <id> <handle>        register a loopback account + identity");
    eprintln!("     post <from> <to> <text>      send a loopback DM");
    eprintln!("     <subject> <json>             publish an order\n");

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );

    // ── Bus, protocol, workers ───────────────────────────────────────────
    let bus = Arc::new(LocalBus::new());
    let network = LoopbackNetwork::new();
    let protocol: Arc<dyn Protocol> =
        Arc::new(LoopbackProtocol::new(Arc::clone(&network), Arc::clone(&store)));

    let registry = Arc::new(WorkerRegistry::new(WorkerDeps {
        store: Arc::clone(&store),
        bus: bus.clone() as Arc<dyn MessageBus>,
        protocol: Arc::clone(&protocol),
        config: config.worker.clone(),
    }));
    let router = Arc::new(Router::new(
        Arc::clone(&registry),
        bus.clone() as Arc<dyn MessageBus>,
        config.router.clone(),
    ));

    let management = bus.subscribe(&config.router.management_subject).await;
    let delivery = bus.subscribe(&config.router.delivery_subject).await;
    let router_task = Arc::clone(&router).spawn(management, delivery);

    spawn_printer("reply", bus.subscribe(CLI_REPLY_SUBJECT).await);
    spawn_printer(
        "scheduler",
        bus.subscribe(&config.worker.scheduler_subject).await,
    );

    // ── Stdin loop ───────────────────────────────────────────────────────
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut accounts: HashMap<u64, (Uuid, Uuid)> = HashMap::new();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "Error reading stdin");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Err(e) = run_command(line, &bus, &network, &store, &mut accounts).await {
            eprintln!("error: {e:#}");
        }
    }

    registry.shutdown_all().await;
    router_task.abort();
    Ok(())
}

async fn run_command(
    line: &str,
    bus: &LocalBus,
    network: &LoopbackNetwork,
    store: &Arc<dyn Database>,
    accounts: &mut HashMap<u64, (Uuid, Uuid)>,
) -> anyhow::Result<()> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "account" => {
            let mut parts = rest.split_whitespace();
            let id: u64 = parts
                .next()
                .context("usage: account <id> <handle>")?
                .parse()
                .context("account id must be a number")?;
            let handle = parts.next().context("usage: account <id> <handle>")?;

            let token = Uuid::new_v4().to_string();
            network.register_account(id, handle, handle.trim_start_matches('@'), &token);

            let (user_id, remote_id) = *accounts
                .entry(id)
                .or_insert_with(|| (Uuid::new_v4(), Uuid::new_v4()));
            store
                .upsert_identity(&RemoteIdentity {
                    user_id,
                    remote_id,
                    protocol: "loopback".into(),
                    identifier: handle.to_string(),
                    credentials: Some(Credentials::new(token, "")),
                    infos: HashMap::new(),
                })
                .await?;
            println!("user_id={user_id} remote_id={remote_id}");
        }
        "post" => {
            let mut parts = rest.splitn(3, ' ');
            let usage = "usage: post <from> <to> <text>";
            let from: u64 = parts.next().context(usage)?.parse().context(usage)?;
            let to: u64 = parts.next().context(usage)?.parse().context(usage)?;
            let text = parts.next().context(usage)?;
            let id = network.post(from, to, text);
            println!("event {id}");
        }
        subject => {
            serde_json::from_str::<serde_json::Value>(rest).context("payload is not valid JSON")?;
            bus.publish_request(subject, CLI_REPLY_SUBJECT, rest.as_bytes().to_vec())
                .await?;
        }
    }
    Ok(())
}

fn spawn_printer(label: &'static str, mut rx: tokio::sync::mpsc::UnboundedReceiver<BusMessage>) {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            println!("[{label}] {}", String::from_utf8_lossy(&message.payload));
        }
    });
}
