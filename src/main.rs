//! eve-notify - desktop notifications from EVE Online character logs
//!
//! Runs the monitoring daemon and manages the subscribed characters in the
//! config file.

use clap::Parser;
use eve_notify::config::{
    Config, SharedLogRoot, apply_config, default_config_path, load_config_from, save_config_to,
    watch_config,
};
use eve_notify::discovery::{find_latest_log, list_characters};
use eve_notify::notification::{DesktopNotifier, LogNotifier, NotificationSink};
use eve_notify::registry::SubscriptionRegistry;
use eve_notify::supervisor::MonitoringSupervisor;
use eve_notify::{Character, EntityId, Error, LogCategory, NotificationRuleSet, Result, Rule};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "eve-notify", about = "Notifications from EVE Online character logs")]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Monitor subscribed characters and send notifications (default)
    Run {
        /// EVE log root, overriding the config file
        #[arg(long)]
        log_path: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = NotifierKind::Desktop)]
        notifier: NotifierKind,
    },
    /// List characters found in the gamelogs
    Characters {
        #[arg(long)]
        log_path: Option<PathBuf>,
    },
    /// Print the live log file of a character
    Latest {
        id: EntityId,
        #[arg(long, value_enum, default_value_t = LogCategory::Gamelog)]
        category: LogCategory,
        #[arg(long)]
        log_path: Option<PathBuf>,
    },
    /// Subscribe a character (replaces its rules if already subscribed)
    Subscribe {
        id: EntityId,
        /// Rule to enable; repeat for several. Enables every rule if omitted.
        #[arg(long = "rule", value_enum)]
        rules: Vec<Rule>,
    },
    /// Remove a character from the config
    Unsubscribe { id: EntityId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum NotifierKind {
    /// Platform desktop notifications
    Desktop,
    /// Log notifications instead of showing them
    Log,
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("EVE_NOTIFY_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt().with_env_filter(filter).with_target(false).init();
}

fn rule_set(rules: &[Rule]) -> NotificationRuleSet {
    let rules = if rules.is_empty() { &Rule::ALL[..] } else { rules };
    rules
        .iter()
        .fold(NotificationRuleSet::default(), |set, rule| set.with(*rule))
}

/// `--log-path` wins over the config file.
fn resolve_log_root(override_path: Option<PathBuf>, config_path: &Path) -> Result<Option<PathBuf>> {
    if override_path.is_some() {
        return Ok(override_path);
    }
    Ok(load_config_from(config_path)?.log_path)
}

async fn run_daemon(
    config_path: PathBuf,
    log_path: Option<PathBuf>,
    notifier: NotifierKind,
) -> Result<()> {
    let config = match load_config_from(&config_path) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "failed to load config; using defaults");
            Config::default()
        }
    };

    let log_root = SharedLogRoot::new(log_path.clone().or_else(|| config.log_path.clone()));
    let notifier: Arc<dyn NotificationSink> = match notifier {
        NotifierKind::Desktop => Arc::new(DesktopNotifier),
        NotifierKind::Log => Arc::new(LogNotifier),
    };

    let (registry, events) = SubscriptionRegistry::new();
    let handle = MonitoringSupervisor::new(
        Arc::clone(&registry),
        Arc::new(log_root.clone()),
        notifier,
        config.timing(),
    )
    .spawn(events);

    if config.characters.is_empty() {
        warn!("no characters subscribed; use `eve-notify subscribe <ID>`");
    }
    let mut result = apply_config(&config, &registry);

    let (reload_tx, mut reload_rx) = mpsc::channel::<Config>(4);
    let watcher_shutdown = CancellationToken::new();
    let watcher = tokio::spawn({
        let shutdown = watcher_shutdown.clone();
        async move {
            if let Err(e) = watch_config(config_path, reload_tx, shutdown).await {
                warn!(error = %e, "config watcher stopped; changes need a restart");
            }
        }
    });

    info!("eve-notify running; press Ctrl-C to stop");
    while result.is_ok() {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl-C");
                break;
            }
            // A fatal supervisor error is reported by shutdown() below.
            _ = handle.cancelled() => break,
            Some(config) = reload_rx.recv() => {
                if log_path.is_none() {
                    log_root.set(config.log_path.clone());
                }
                result = apply_config(&config, &registry);
            }
        }
    }

    watcher_shutdown.cancel();
    if let Err(e) = watcher.await {
        warn!(error = %e, "config watcher task failed");
    }

    let shutdown = handle.shutdown().await;
    result.and(shutdown)
}

fn characters(log_root: Option<PathBuf>) -> Result<()> {
    let characters = list_characters(log_root.as_deref())?;
    if characters.is_empty() {
        println!("No characters found.");
        return Ok(());
    }
    for character in &characters {
        println!("{}", character_line(character));
    }
    Ok(())
}

fn character_line(character: &Character) -> String {
    format!(
        "{:<24}  last seen {}",
        character.label(),
        character.last_seen.format("%Y-%m-%d %H:%M:%S")
    )
}

fn latest(log_root: Option<PathBuf>, id: EntityId, category: LogCategory) -> Result<()> {
    let log_root = log_root.ok_or(Error::LogPathNotConfigured)?;
    match find_latest_log(&log_root.join(category.dir_name()), id, category) {
        Some(path) => println!("{}", path.display()),
        None => println!("No {category} log found for character {id}."),
    }
    Ok(())
}

fn subscribe(config_path: &Path, id: EntityId, rules: &[Rule]) -> Result<()> {
    let mut config = load_config_from(config_path)?;
    config.characters.insert(id, rule_set(rules));
    save_config_to(&config, config_path)?;
    println!("Subscribed character {id}.");
    Ok(())
}

fn unsubscribe(config_path: &Path, id: EntityId) -> Result<()> {
    let mut config = load_config_from(config_path)?;
    if config.characters.remove(&id).is_none() {
        println!("Character {id} is not subscribed.");
        return Ok(());
    }
    save_config_to(&config, config_path)?;
    println!("Unsubscribed character {id}.");
    Ok(())
}

fn dispatch(command: Command, config_path: PathBuf) -> Result<()> {
    match command {
        Command::Run { log_path, notifier } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_daemon(config_path, log_path, notifier))
        }
        Command::Characters { log_path } => {
            characters(resolve_log_root(log_path, &config_path)?)
        }
        Command::Latest {
            id,
            category,
            log_path,
        } => latest(resolve_log_root(log_path, &config_path)?, id, category),
        Command::Subscribe { id, rules } => subscribe(&config_path, id, &rules),
        Command::Unsubscribe { id } => unsubscribe(&config_path, id),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let Some(config_path) = cli.config.or_else(default_config_path) else {
        eprintln!("error: could not determine the config directory; pass --config");
        return ExitCode::FAILURE;
    };
    let command = cli.command.unwrap_or(Command::Run {
        log_path: None,
        notifier: NotifierKind::Desktop,
    });

    match dispatch(command, config_path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "eve-notify failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    #[test]
    fn cli_no_subcommand() {
        let cli = Cli::try_parse_from(["eve-notify"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn cli_verbose_three() {
        let cli = Cli::try_parse_from(["eve-notify", "-vvv"]).unwrap();
        assert_eq!(cli.verbose, 3);
    }

    #[test]
    fn cli_run_with_options() {
        let cli = Cli::try_parse_from([
            "eve-notify",
            "run",
            "--log-path",
            "/eve/logs",
            "--notifier",
            "log",
            "-v",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Some(Command::Run { log_path, notifier }) => {
                assert_eq!(log_path, Some(PathBuf::from("/eve/logs")));
                assert_eq!(notifier, NotifierKind::Log);
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_latest_defaults_to_gamelog() {
        let cli = Cli::try_parse_from(["eve-notify", "latest", "501"]).unwrap();
        match cli.command {
            Some(Command::Latest { id, category, .. }) => {
                assert_eq!(id, EntityId(501));
                assert_eq!(category, LogCategory::Gamelog);
            }
            _ => panic!("expected Latest command"),
        }
    }

    #[test]
    fn cli_subscribe_with_rules() {
        let cli = Cli::try_parse_from([
            "eve-notify",
            "--config",
            "/tmp/c.json",
            "subscribe",
            "501",
            "--rule",
            "cargo-full",
            "--rule",
            "corp-chat",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.json")));
        match cli.command {
            Some(Command::Subscribe { id, rules }) => {
                assert_eq!(id, EntityId(501));
                assert_eq!(rules, vec![Rule::CargoFull, Rule::CorpChat]);
            }
            _ => panic!("expected Subscribe command"),
        }
    }

    #[test]
    fn cli_rejects_non_numeric_id() {
        assert!(Cli::try_parse_from(["eve-notify", "unsubscribe", "abc"]).is_err());
    }

    #[test]
    fn rule_set_without_rules_enables_all() {
        let all = rule_set(&[]);
        assert!(Rule::ALL.iter().all(|r| all.is_enabled(*r)));

        let one = rule_set(&[Rule::AutopilotJump]);
        assert!(one.is_enabled(Rule::AutopilotJump));
        assert!(!one.is_enabled(Rule::CargoFull));
    }

    #[test]
    fn character_line_uses_display_label() {
        let character = Character {
            id: EntityId(501),
            last_seen: chrono::NaiveDate::from_ymd_opt(2024, 1, 3)
                .unwrap()
                .and_hms_opt(8, 0, 0)
                .unwrap(),
        };
        let line = character_line(&character);
        assert!(line.starts_with("Character 501 "));
        assert!(line.ends_with("last seen 2024-01-03 08:00:00"));
    }

    #[test]
    fn subscribe_and_unsubscribe_edit_config() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");

        subscribe(&path, EntityId(501), &[Rule::CargoFull]).unwrap();
        let config = load_config_from(&path).unwrap();
        assert!(config.characters[&EntityId(501)].cargo_full);

        unsubscribe(&path, EntityId(501)).unwrap();
        assert!(load_config_from(&path).unwrap().characters.is_empty());
    }

    #[test]
    fn log_path_flag_overrides_config() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        let config = Config {
            log_path: Some(PathBuf::from("/from/config")),
            ..Config::default()
        };
        save_config_to(&config, &path).unwrap();

        assert_eq!(
            resolve_log_root(None, &path).unwrap(),
            Some(PathBuf::from("/from/config"))
        );
        assert_eq!(
            resolve_log_root(Some(PathBuf::from("/flag")), &path).unwrap(),
            Some(PathBuf::from("/flag"))
        );
    }
}
