use clap::Parser;
use globalmap_tracker::{error, info, initialize_logger, Config, Database, HttpApi, Poller};
use std::path::PathBuf;
use std::process::exit;

/// Polls the global map and reconciles territory assaults into the local
/// projection. Run once from cron, or with an interval loop.
#[derive(Parser)]
#[command(name = "fetch", version)]
struct Args {
    /// Path to the config file
    #[arg(long, default_value = "tracker.yml")]
    config: PathBuf,

    /// Run a single poll cycle and exit
    #[arg(long)]
    once: bool,

    /// Clan ids to track, overriding the configured list
    clan_ids: Vec<u64>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = Config::load_or_default(&args.config);
    if !args.clan_ids.is_empty() {
        config.clan_ids = args.clan_ids.clone();
    }

    initialize_logger(&config);
    info!(
        "[main] territory assault tracker v{} booting",
        env!("CARGO_PKG_VERSION")
    );

    if let Err(e) = config.validate() {
        error!("[main] ❌ Invalid config file - {e}");
        exit(1);
    }

    let database = match Database::connect(&config.database_uri) {
        Ok(database) => database,
        Err(e) => {
            error!("[main] ❌ {e}");
            exit(1);
        }
    };

    if let Err(e) = database.ping().await {
        error!("[main] ❌ Failed to reach the database - {e}");
        exit(1);
    }

    let api = match HttpApi::new(&config) {
        Ok(api) => api,
        Err(e) => {
            error!("[main] ❌ {e}");
            exit(1);
        }
    };

    let poller = Poller::new(&api, &database, &config);

    // Validated above; the fallback only guards the unreachable.
    let interval = config
        .poll_interval()
        .unwrap_or(std::time::Duration::from_secs(600));

    loop {
        if let Err(e) = poller.run_cycle().await {
            error!("[main] ❌ poll cycle failed - {e}");
        }

        if args.once {
            break;
        }

        info!(
            "[main] next cycle in {}",
            humantime::format_duration(interval)
        );
        tokio::time::sleep(interval).await;
    }
}
