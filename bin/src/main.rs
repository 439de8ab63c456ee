#![allow(clippy::cognitive_complexity)]
use anyhow::{Context, Result, anyhow};
use membership::{
    Change, CloseReason, MembershipConfig, Registration, Watcher, models::EventKind,
};
use tokio::{runtime::Builder, signal};
use tracing::*;

mod config;

use config::{
    cli::{self, Command, Parser},
    trace,
};

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.log, config.log_format)?;
    debug!(?config, ?trace_config);

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    // if we have a configured value here, set it
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    // build the runtime
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => {
                error!(?err, "memberctl task failed");
                Err(anyhow!(err))
            }
            Ok(Err(err)) => {
                error!(?err, "exited with error");
                Err(err)
            }
            Ok(Ok(())) => {
                debug!("exiting...");
                Ok(())
            }
        }
    })
}

async fn start(config: cli::Config) -> Result<()> {
    let membership = config.membership()?;
    info!(
        endpoints = ?membership.endpoints,
        prefix = membership.prefix,
        ttl = membership.ttl_secs,
        "using membership config"
    );
    match config.command {
        Command::Watch => watch(membership).await,
        Command::Register { .. } => register(membership).await,
    }
}

async fn watch(membership: MembershipConfig) -> Result<()> {
    let watcher = Watcher::connect(&membership)
        .await
        .context("failed to start membership watcher")?;
    let mut changes = watcher
        .take_changes()
        .context("change feed already taken")?;

    print_members(&watcher);
    let mut leader = watcher.leader_name();
    loop {
        tokio::select! {
            res = signal::ctrl_c() => {
                res.context("failed to listen for ctrl-c")?;
                info!("received ctrl-c, shutting down");
                break;
            }
            _ = watcher.closed() => break,
            change = changes.recv() => match change {
                Some(change) => {
                    print_change(&watcher, &change);
                    let current = watcher.leader_name();
                    if current != leader {
                        println!("leader {}", current.as_deref().unwrap_or("<none>"));
                        leader = current;
                    }
                }
                None => break,
            },
        }
    }

    let reason = watcher.closed_reason();
    watcher.close().await;
    match reason {
        Some(CloseReason::WatchTerminated(reason)) => Err(anyhow!("watch terminated: {reason}")),
        _ => Ok(()),
    }
}

async fn register(membership: MembershipConfig) -> Result<()> {
    let me = Registration::connect(&membership)
        .await
        .context("failed to register")?;
    info!(name = me.my_name(), key = me.my_key(), lease = me.lease_id(), "joined group");
    let mut changes = me.take_changes().context("change feed already taken")?;

    let mut leading = me.am_i_leader();
    report_leadership(&me, leading);
    loop {
        tokio::select! {
            res = signal::ctrl_c() => {
                res.context("failed to listen for ctrl-c")?;
                info!("received ctrl-c, leaving group");
                break;
            }
            _ = me.closed() => break,
            change = changes.recv() => {
                if change.is_none() {
                    break;
                }
                let now = me.am_i_leader();
                if now != leading {
                    report_leadership(&me, now);
                    leading = now;
                }
            }
        }
    }

    let reason = me.closed_reason();
    me.close().await;
    match reason {
        Some(CloseReason::LeaseLost(lease)) => Err(anyhow!("registration lost, lease {lease} expired")),
        Some(CloseReason::WatchTerminated(reason)) => Err(anyhow!("watch terminated: {reason}")),
        _ => Ok(()),
    }
}

fn report_leadership(me: &Registration, leading: bool) {
    if leading {
        info!(name = me.my_name(), "became leader");
    } else {
        let leader = me.leader_name();
        info!(name = me.my_name(), leader = leader.as_deref(), "following");
    }
}

fn print_members(watcher: &Watcher) {
    let all = watcher.get_all();
    for name in watcher.get_names() {
        let value = all.get(&name).map(|v| String::from_utf8_lossy(v).into_owned());
        println!("member {name} {}", value.unwrap_or_default());
    }
    match watcher.get_leader() {
        Some((name, _)) => println!("leader {name}"),
        None => println!("leader <none>"),
    }
}

fn print_change(watcher: &Watcher, change: &Change) {
    match change.op {
        EventKind::Put => {
            let value = watcher
                .get_value_by_name(&change.name)
                .map(|v| String::from_utf8_lossy(&v).into_owned())
                .unwrap_or_default();
            println!("{change} {value}");
        }
        EventKind::Delete => println!("{change}"),
    }
}
