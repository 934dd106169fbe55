use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use clap::Parser;
use partgrid::{
    ha::{compute_status, report::render_table, DistributionTarget, OwnershipSnapshot},
    telemetry::{initialize_fmt_subscriber, initialize_jaeger_subscriber},
};
use serde::Deserialize;
use time::{macros::format_description, OffsetDateTime};
use tracing::{event, Level};

#[derive(Debug, Parser)]
#[command(name = "partgrid-status")]
#[command(about = "Periodically prints the StatusHA of partitioned services", long_about = None)]
struct Cli {
    /// JSON file with one ownership snapshot or a list of them. Re-read on every iteration.
    #[arg(long)]
    snapshot_path: PathBuf,
    /// Only report this service
    #[arg(long)]
    service: Option<String>,
    /// Seconds between iterations
    #[arg(short, long, default_value = "5")]
    delay: u64,
    /// Number of iterations, 0 runs until interrupted
    #[arg(short, long, default_value = "0")]
    iterations: u64,
    /// Consider endangered services safe when running as a health check
    #[arg(long, default_value = "false")]
    allow_endangered: bool,
    #[arg(short, long, default_value = "false")]
    tracing_jaeger: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Snapshots {
    Many(Vec<OwnershipSnapshot>),
    One(OwnershipSnapshot),
}

async fn load(path: &Path, service: Option<&str>) -> anyhow::Result<Vec<OwnershipSnapshot>> {
    let c = tokio::fs::read_to_string(path).await?;
    let snapshots = match serde_json::from_str(&c)? {
        Snapshots::Many(snapshots) => snapshots,
        Snapshots::One(snapshot) => vec![snapshot],
    };

    Ok(snapshots
        .into_iter()
        .filter(|snapshot| service.map_or(true, |service| snapshot.service == service))
        .collect())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    if args.tracing_jaeger {
        initialize_jaeger_subscriber("http://localhost:4317/v1/traces")?;
    } else {
        initialize_fmt_subscriber()?;
    }

    let timestamp_format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let mut iteration = 0;
    loop {
        let snapshots = load(&args.snapshot_path, args.service.as_deref()).await?;
        let statuses = snapshots
            .iter()
            .map(|snapshot| {
                DistributionTarget::even(snapshot).and_then(|target| compute_status(snapshot, &target))
            })
            .collect::<partgrid::error::Result<Vec<_>>>()?;

        let timestamp = OffsetDateTime::now_utc().format(&timestamp_format)?;
        println!("{}\n", render_table(&timestamp, &statuses));

        let unsafe_services: Vec<&str> = statuses
            .iter()
            .filter(|status| !status.is_safe(args.allow_endangered))
            .map(|status| status.service.as_str())
            .collect();
        for service in unsafe_services.iter() {
            event!(Level::WARN, "service {} is not safe to restart a member", service);
        }

        iteration += 1;
        if args.iterations > 0 && iteration >= args.iterations {
            if !unsafe_services.is_empty() {
                anyhow::bail!("unsafe services: {}", unsafe_services.join(", "));
            }
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(args.delay)) => {}
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}
