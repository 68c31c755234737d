//! Simulate command - drives several clone managers over one backing tier.
//!
//! Each worker plays requests from a pool of simulated clients. Every request
//! lands on a random clone, presents the client's last token, touches the
//! session and stores the token that clone hands back. Clients therefore hop
//! between clones the way they would behind a load balancer after failover.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{Context as _, Result, bail};
use clap::Args;
use console::{Style, style};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tracing::debug;

use cairn_session::{
    AffinityContext, IdCodec, SessionManager, SessionManagerConfig, SessionStats, SnapshotStore,
};

use super::Context;

/// Arguments for the simulate command.
#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Concurrent worker threads
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Requests per worker
    #[arg(long, default_value_t = 250)]
    pub requests: usize,

    /// Simulated clients sharing the traffic
    #[arg(long, default_value_t = 32)]
    pub clients: usize,

    /// Clone ids of the simulated servers, comma separated
    #[arg(long, value_delimiter = ',', default_value = "A,B,C")]
    pub clones: Vec<String>,
}

/// Simulation report for JSON output.
#[derive(Debug, Serialize)]
struct SimulateOutput {
    requests: u64,
    failures: u64,
    elapsed_ms: u128,
    clients: usize,
    distinct_sessions: usize,
    backing_records: usize,
    longest_chain: usize,
    managers: Vec<SessionStats>,
}

/// Run the simulate command.
pub async fn run(args: SimulateArgs, ctx: &Context) -> Result<()> {
    if args.workers == 0 || args.clients == 0 {
        bail!("--workers and --clients must be positive");
    }
    if args.clones.is_empty() {
        bail!("at least one clone id is required");
    }

    let config = ctx.manager_config()?;
    let output = tokio::task::spawn_blocking(move || simulate(&args, config))
        .await
        .context("simulation worker panicked")??;

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_report(&output);
    }
    Ok(())
}

fn simulate(args: &SimulateArgs, template: SessionManagerConfig) -> Result<SimulateOutput> {
    let backing = SnapshotStore::new();
    let managers: Vec<SessionManager> = args
        .clones
        .iter()
        .map(|clone| {
            let config = SessionManagerConfig {
                app_name: format!("{}-{}", template.app_name, clone),
                ..template.clone()
            }
            .with_clone_id(clone.as_str());
            SessionManager::builder(config)
                .with_backing(Arc::new(backing.clone()))
                .build()
        })
        .collect();

    let tokens: Vec<Mutex<Option<String>>> = (0..args.clients).map(|_| Mutex::new(None)).collect();
    let requests = AtomicU64::new(0);
    let failures = AtomicU64::new(0);
    let started = Instant::now();

    std::thread::scope(|scope| {
        for worker in 0..args.workers {
            let (managers, tokens, requests, failures) = (&managers, &tokens, &requests, &failures);
            scope.spawn(move || {
                let mut rng = rand::rng();
                for _ in 0..args.requests {
                    let client = rng.random_range(0..tokens.len());
                    let manager = &managers[rng.random_range(0..managers.len())];
                    requests.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = request(manager, &tokens[client]) {
                        debug!(worker, client, error = %e, "Simulated request failed");
                        failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });
    let elapsed = started.elapsed();

    for manager in &managers {
        manager.run_invalidation_sweep();
    }

    let codec = IdCodec::from_config(&template);
    let mut distinct = HashSet::new();
    let mut longest_chain = 0;
    for token in tokens.iter().filter_map(|t| t.lock().clone()) {
        if let Some(parsed) = codec.decode(&token) {
            let chain = parsed
                .clone_chain
                .as_deref()
                .map_or(0, |c| codec.split_chain(c).len());
            longest_chain = longest_chain.max(chain);
            distinct.insert(parsed.base_id);
        }
    }

    Ok(SimulateOutput {
        requests: requests.into_inner(),
        failures: failures.into_inner(),
        elapsed_ms: elapsed.as_millis(),
        clients: args.clients,
        distinct_sessions: distinct.len(),
        backing_records: backing.len(),
        longest_chain,
        managers: managers.iter().map(SessionManager::stats).collect(),
    })
}

/// One request: join or create the client's session and record the token
/// the serving clone hands back.
fn request(manager: &SessionManager, token: &Mutex<Option<String>>) -> Result<()> {
    // Holding the client's slot serializes that client's requests.
    let mut token = token.lock();
    let mut ctx = AffinityContext::new(token.clone());
    let handle = manager
        .obtain_session(&mut ctx, true)?
        .context("no session returned")?;

    let hits = handle
        .attribute("hits")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    handle.set_attribute("hits", hits + 1)?;

    *token = manager.encode_token(&mut ctx, &handle);
    Ok(())
}

fn print_report(output: &SimulateOutput) {
    let dim = Style::new().dim();

    println!();
    println!("{}", style("Simulation").bold());
    println!("{}", dim.apply_to("─".repeat(40)));
    println!(
        "  {} {} in {} ms ({} failed)",
        dim.apply_to("Requests:"),
        output.requests,
        output.elapsed_ms,
        output.failures
    );
    println!(
        "  {} {} clients, {} distinct sessions",
        dim.apply_to("Sessions:"),
        output.clients,
        output.distinct_sessions
    );
    println!(
        "  {} {} records, longest clone chain {}",
        dim.apply_to("Backing: "),
        output.backing_records,
        output.longest_chain
    );
    println!();
    println!(
        "  {:<16} {:>6} {:>8} {:>9} {:>10}",
        dim.apply_to("manager"),
        dim.apply_to("live"),
        dim.apply_to("created"),
        dim.apply_to("destroyed"),
        dim.apply_to("timed out")
    );
    for stats in &output.managers {
        println!(
            "  {:<16} {:>6} {:>8} {:>9} {:>10}",
            stats.app_name,
            stats.store.live,
            stats.store.created,
            stats.store.destroyed,
            stats.store.timed_out
        );
    }
    println!();
}
