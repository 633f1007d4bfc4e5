#![deny(warnings)]

//! Headless CLI that drives scripted deployment scenarios on a stepped clock.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use deploy_core::{
    AnomalyId, Asset, AssetCategory, AssetConfig, AssetId, Deposit, DepositId, EngineConfig,
    OwnerId, ResourceKind, SiteId, Target,
};
use deploy_engine::{DeploymentController, DeploymentStore, EngineError, InMemoryStore};
use persistence::SqliteStore;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, Subscriber};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Scenario {
    Rover,
    Station,
    Satellite,
}

impl FromStr for Scenario {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rover" => Ok(Scenario::Rover),
            "station" => Ok(Scenario::Station),
            "satellite" => Ok(Scenario::Satellite),
            other => bail!("unknown scenario {other:?} (expected rover, station or satellite)"),
        }
    }
}

#[derive(Debug, Default)]
struct Args {
    config: Option<String>,
    db: Option<String>,
    scenario: Option<String>,
    version: bool,
}

fn parse_args() -> Args {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => args.config = it.next(),
            "--db" => args.db = it.next(),
            "--scenario" => args.scenario = it.next(),
            "--version" | "-V" => args.version = true,
            _ => {}
        }
    }
    args
}

/// `RUST_LOG`-style directives, falling back to `info`.
fn log_filter(directives: Option<String>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

fn subscriber(filter: EnvFilter) -> impl Subscriber + Send + Sync + 'static {
    tracing_subscriber::fmt().with_env_filter(filter).finish()
}

fn owner() -> OwnerId {
    OwnerId::new("pilot-1")
}

fn site() -> SiteId {
    SiteId::new("mars")
}

fn fixture_assets() -> Vec<Asset> {
    let asset = |id: &str, category, speed, capacity, power| Asset {
        id: AssetId::new(id),
        owner: owner(),
        site: site(),
        category,
        config: AssetConfig {
            speed,
            capacity,
            power,
        },
    };
    vec![
        asset("rover-1", AssetCategory::MiningAutomaton, 2, 2, 1),
        asset("station-1", AssetCategory::MiningStation, 1, 1, 1),
        asset("sat-1", AssetCategory::Satellite, 1, 1, 1),
    ]
}

fn fixture_deposits() -> Vec<Deposit> {
    vec![
        Deposit {
            id: DepositId::new("dep-1"),
            site: site(),
            resource: ResourceKind::new("15"),
            remaining: 1,
            purity: None,
        },
        Deposit {
            id: DepositId::new("ice-1"),
            site: site(),
            resource: ResourceKind::new("water"),
            remaining: 12,
            purity: Some(0.8),
        },
    ]
}

fn stamp(t0: DateTime<Utc>, now: DateTime<Utc>) -> String {
    format!("T+{}s", (now - t0).num_milliseconds() as f64 / 1000.0)
}

async fn run_rover<S: DeploymentStore>(c: &DeploymentController<S>, t0: DateTime<Utc>) -> Result<()> {
    let rover = AssetId::new("rover-1");
    match c
        .start_deployment(&rover, Target::Deposit(DepositId::new("ice-1")), t0)
        .await
    {
        Ok(_) => println!("{} | unexpected: low-power rover reached the ice", stamp(t0, t0)),
        Err(e) => println!("{} | ice-1 refused: {}", stamp(t0, t0), e),
    }
    let deployed = c
        .start_deployment(&rover, Target::Deposit(DepositId::new("dep-1")), t0)
        .await?;
    println!(
        "{} | rover-1 deployed to dep-1 | duration: {:?} ms",
        stamp(t0, t0),
        deployed.duration_ms
    );
    let duration = deployed.duration_ms.unwrap_or(0) as i64;
    for at in [duration / 2, duration - 1, duration] {
        let now = t0 + Duration::milliseconds(at);
        let p = c.get_progress(&rover, now).await?;
        println!("{} | progress {}", stamp(t0, now), serde_json::to_string(&p)?);
    }
    for at in [duration, duration + 1_000] {
        let now = t0 + Duration::milliseconds(at);
        let got = c.collect(&rover, now).await?;
        println!("{} | collect {}", stamp(t0, now), serde_json::to_string(&got)?);
    }
    let held = c.holding(&owner(), &site(), &ResourceKind::new("15")).await?;
    let now = t0 + Duration::milliseconds(duration + 1_000);
    println!("{} | holding {}", stamp(t0, now), serde_json::to_string(&held)?);
    Ok(())
}

async fn run_station<S: DeploymentStore>(c: &DeploymentController<S>, t0: DateTime<Utc>) -> Result<()> {
    let station = AssetId::new("station-1");
    c.activate(&station, t0).await?;
    println!("{} | station-1 accruing", stamp(t0, t0));
    let now = t0 + Duration::milliseconds(10_500);
    let p = c.get_progress(&station, now).await?;
    println!("{} | progress {}", stamp(t0, now), serde_json::to_string(&p)?);
    let claim = c.claim(&station, now, Some(true)).await?;
    println!("{} | claim {}", stamp(t0, now), serde_json::to_string(&claim)?);
    let now = t0 + Duration::seconds(70);
    let claim = c.claim(&station, now, Some(false)).await?;
    println!("{} | claim {}", stamp(t0, now), serde_json::to_string(&claim)?);
    let p = c.get_progress(&station, now).await?;
    println!("{} | progress {}", stamp(t0, now), serde_json::to_string(&p)?);
    Ok(())
}

async fn run_satellite<S: DeploymentStore>(
    c: &DeploymentController<S>,
    t0: DateTime<Utc>,
) -> Result<()> {
    let sat = AssetId::new("sat-1");
    let target = Target::Anomaly(AnomalyId::new("cloud-7"));
    let deployed = match c.start_deployment(&sat, target.clone(), t0).await {
        Ok(deployed) => deployed,
        Err(e @ EngineError::QuotaExceeded { .. }) => {
            println!("{} | sat-1 refused: {}", stamp(t0, t0), e);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    println!(
        "{} | sat-1 observing cloud-7 | duration: {:?} ms",
        stamp(t0, t0),
        deployed.duration_ms
    );
    for minutes in [0, 15, 40] {
        let now = t0 + Duration::minutes(minutes);
        let p = c.get_progress(&sat, now).await?;
        println!("{} | progress {}", stamp(t0, now), serde_json::to_string(&p)?);
    }
    let now = t0 + Duration::minutes(40);
    let got = c.collect(&sat, now).await?;
    println!("{} | collect {}", stamp(t0, now), serde_json::to_string(&got)?);
    let now = t0 + Duration::hours(1);
    match c.start_deployment(&sat, target, now).await {
        Ok(_) => println!("{} | redeployed (new week)", stamp(t0, now)),
        Err(e) => println!("{} | redeploy refused: {}", stamp(t0, now), e),
    }
    let quota = c
        .quota_status(&owner(), AssetCategory::Satellite, now, 0)
        .await?;
    println!("{} | quota {}", stamp(t0, now), serde_json::to_string(&quota)?);
    for hours in [12, 24, 72] {
        let now = t0 + Duration::hours(hours);
        let dwell = c.satellite_status(&sat, now).await?;
        println!("{} | dwell {}", stamp(t0, now), serde_json::to_string(&dwell)?);
    }
    Ok(())
}

async fn run<S: DeploymentStore>(
    c: &DeploymentController<S>,
    scenario: Scenario,
    t0: DateTime<Utc>,
) -> Result<()> {
    match scenario {
        Scenario::Rover => run_rover(c, t0).await,
        Scenario::Station => run_station(c, t0).await,
        Scenario::Satellite => run_satellite(c, t0).await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logging setup
    subscriber(log_filter(std::env::var("RUST_LOG").ok())).init();

    let args = parse_args();
    if args.version {
        println!(
            "cli {} ({} {})",
            env!("CARGO_PKG_VERSION"),
            env!("GIT_SHA"),
            env!("BUILD_DATE")
        );
        return Ok(());
    }
    let scenario: Scenario = args.scenario.as_deref().unwrap_or("rover").parse()?;
    info!(?scenario, config = ?args.config, db = ?args.db, "starting CLI");

    let config = match &args.config {
        Some(path) => EngineConfig::load(path).with_context(|| format!("loading {path}"))?,
        None => EngineConfig::default(),
    };
    config.validate()?;

    let t0 = Utc::now();
    match &args.db {
        Some(url) => {
            let store = Arc::new(SqliteStore::connect(url).await?);
            for asset in fixture_assets() {
                store.upsert_asset(&asset).await?;
            }
            for deposit in fixture_deposits() {
                store.upsert_deposit(&deposit).await?;
            }
            run(&DeploymentController::new(store, config), scenario, t0).await?;
        }
        None => {
            let store = Arc::new(InMemoryStore::new());
            for asset in fixture_assets() {
                store.insert_asset(asset);
            }
            for deposit in fixture_deposits() {
                store.insert_deposit(deposit)?;
            }
            run(&DeploymentController::new(store, config), scenario, t0).await?;
        }
    }

    println!("Scenario {:?} OK", scenario);
    Ok(())
}
