//! admission-cli: drive the admission core from the command line.
//!
//! Usage:
//!   admission-cli demo [--config <path>] [--units <n>] [--fail-every <k>]
//!   admission-cli config [--config <path>]
//!   admission-cli fetch <url> [--referer <url>] [--config <path>]
//!   admission-cli version

use admission_core::api::{ApiRequest, BatchApi};
use admission_core::batch::{worker_fn, BatchAccumulator, WorkPayload};
use admission_core::{AdmissionConfig, Error, HttpFetcher};
use anyhow::{bail, Context};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let Some(command) = args.get(1) else {
        print_usage();
        std::process::exit(1);
    };

    match command.as_str() {
        "demo" => cmd_demo(&args[2..]).await,
        "config" => cmd_config(&args[2..]),
        "fetch" => cmd_fetch(&args[2..]).await,
        "version" | "--version" | "-V" => {
            println!("admission-cli {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}

fn print_usage() {
    println!(
        r#"admission-cli

USAGE:
    admission-cli <COMMAND> [OPTIONS]

COMMANDS:
    demo [--units <n>] [--fail-every <k>]   Submit synthetic units and report batch status
    config                                  Print the effective configuration as YAML
    fetch <url> [--referer <url>]           Fetch a URL through the paced, retrying client
    version                                 Show version information
    help                                    Show this help message

OPTIONS:
    --config <path>                         YAML configuration file

ENVIRONMENT:
    ADMISSION_*                             Override individual settings
    RUST_LOG                                Log filter (default: info)"#
    );
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn load_config(args: &[String]) -> anyhow::Result<AdmissionConfig> {
    let base = match flag(args, "--config") {
        Some(path) => AdmissionConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {path}"))?,
        None => AdmissionConfig::default(),
    };
    Ok(base.with_env_overrides()?)
}

fn cmd_config(args: &[String]) -> anyhow::Result<()> {
    let config = load_config(args)?;
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

async fn cmd_demo(args: &[String]) -> anyhow::Result<()> {
    let config = load_config(args)?;
    let units: usize = match flag(args, "--units") {
        Some(n) => n.parse().context("--units expects a number")?,
        None => config.batch.max_batch_size * 2 + 1,
    };
    let fail_every: u64 = match flag(args, "--fail-every") {
        Some(k) => k.parse().context("--fail-every expects a number")?,
        None => 0,
    };

    let seen = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&seen);
    let worker = Arc::new(worker_fn(move |payload: WorkPayload| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if fail_every > 0 && n % fail_every == 0 {
                return Err(Error::worker(format!("synthetic failure on unit #{n}")));
            }
            Ok(serde_json::json!({ "bytes": payload.data.len(), "options": payload.options }))
        }
    }));

    let accumulator = Arc::new(BatchAccumulator::new(config.batch.clone(), worker));
    accumulator.start()?;
    let api = BatchApi::new(Arc::clone(&accumulator), &config.inbound);

    let mut ids = Vec::with_capacity(units);
    for i in 0..units {
        let body = serde_json::json!({
            "data_base64": base64_of(format!("page-{i:03}").as_bytes()),
            "options": { "target_lang": "English" },
        });
        let resp = api.handle(&ApiRequest::post("/batch/submit", "127.0.0.1", body));
        if !resp.status.is_success() {
            bail!("submission {i} rejected with {}: {}", resp.status, resp.body);
        }
        if let Some(id) = resp.body["request_id"].as_str() {
            ids.push(id.to_string());
        }
    }

    let reports = accumulator.shutdown().await;
    println!(
        "processed {} unit(s); {} batch(es) joined at shutdown",
        seen.load(Ordering::SeqCst),
        reports.len()
    );

    for batch_id in accumulator.registry().batch_ids() {
        let resp = api.handle(&ApiRequest::get(format!("/batch/{batch_id}"), "127.0.0.1"));
        println!("{}", serde_json::to_string_pretty(&resp.body)?);
    }
    if let Some(first) = ids.first() {
        let resp = api.handle(&ApiRequest::get(format!("/batch/status/{first}"), "127.0.0.1"));
        println!("{}", serde_json::to_string_pretty(&resp.body)?);
    }
    Ok(())
}

async fn cmd_fetch(args: &[String]) -> anyhow::Result<()> {
    let Some(url) = args.first().filter(|a| !a.starts_with("--")) else {
        bail!("fetch requires a URL");
    };
    let config = load_config(args)?;
    let fetcher = HttpFetcher::new(&config.outbound)?;

    match fetcher.get_bytes(url, flag(args, "--referer")).await? {
        Some(body) => println!("{url}: {} byte(s)", body.len()),
        None => println!("{url}: not fetched"),
    }
    Ok(())
}

fn base64_of(data: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(data)
}
