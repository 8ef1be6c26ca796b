mod api;
mod clans;
mod config;
mod database;
mod day;
mod error;
mod matcher;
mod poller;
mod projection;
mod reconcile;
mod schedule;
mod snapshot;
mod store;

pub use api::{HttpApi, LogEventType, RawLogEntry, UpstreamApi};
pub use config::Config;
pub use database::Database;
pub use day::battle_day;
pub use error::Error;
pub use matcher::{apply_assignments, match_winners, prepare_log, Assignment, LogEntry};
pub use poller::Poller;
pub use projection::assault_clan_json;
pub use reconcile::{Outcome, Reconciler};
pub use schedule::{planned_times, round_title};
pub use snapshot::{normalize, ActiveBattle, RawTerritory, TerritorySnapshot};
pub use store::{
    Assault, Battle, BattleKey, Clan, ClanArenaStat, ClanId, Front, MemoryStore, Status, Store,
    Territory,
};

pub use log::{debug, error, info, trace, warn};
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config as LogConfig, Root};
use log4rs::encode::pattern::PatternEncoder;

pub type TrackerResult = Result<(), Error>;

/// Short correlation id for tying a poll cycle's log lines together.
pub fn short_id() -> String {
    uuid::Uuid::new_v4().as_simple().to_string()[0..8].to_string()
}

pub fn initialize_logger(config: &Config) {
    let log_pattern = "[{d(%Y-%m-%d %H:%M:%S%.3f)(utc)}Z {h({l})} {M}:{L}] {m}{n}";

    let log_level = match config.log_level.as_ref() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };

    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(log_pattern)))
        .build();

    let mut builder = LogConfig::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)));
    let mut root = Root::builder().appender("stdout");

    if !config.logging_path.is_empty() {
        match FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(log_pattern)))
            .build(&config.logging_path)
        {
            Ok(logfile) => {
                builder = builder.appender(Appender::builder().build("logfile", Box::new(logfile)));
                root = root.appender("logfile");
            }
            Err(e) => println!(
                "[ERROR] Failed to open log file {} - {e}",
                config.logging_path
            ),
        }
    }

    match builder.build(root.build(log_level)) {
        Ok(c) => match log4rs::init_config(c) {
            Ok(_) => (),
            Err(e) => println!("[ERROR] Failed to initialize logger - {e}"),
        },
        Err(e) => println!("[ERROR] Failed to build logger config - {e}"),
    };
}
