use std::env;
use std::sync::Arc;

use mailwatch::providers::imap::ImapConnector;
use mailwatch::{Account, Connector, Scheduler, Settings, ValidityCache};
use tracing::{error, info, warn};

const ACCOUNTS_VAR: &str = "MAILWATCH_ACCOUNTS";
const SETTINGS_VAR: &str = "MAILWATCH_SETTINGS";
const STDOUT_TARGET: &str = "stdout";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailwatch=info".into()),
        )
        .try_init();
}

fn load_accounts() -> Result<Vec<Account>, String> {
    let raw = env::var(ACCOUNTS_VAR).map_err(|_| format!("{ACCOUNTS_VAR} is not set"))?;
    raw.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.parse::<Account>().map_err(|err| err.to_string()))
        .collect()
}

fn load_settings() -> Result<Settings, String> {
    match env::var(SETTINGS_VAR) {
        Ok(raw) => Settings::from_json(&raw).map_err(|err| err.to_string()),
        Err(_) => Ok(Settings::default()),
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let (accounts, settings) = match load_accounts().and_then(|accounts| load_settings().map(|settings| (accounts, settings))) {
        Ok(loaded) => loaded,
        Err(message) => {
            error!(%message, "invalid configuration");
            std::process::exit(2);
        }
    };
    if accounts.is_empty() {
        warn!("no accounts configured in {ACCOUNTS_VAR}");
    }

    let connector: Arc<dyn Connector> = Arc::new(ImapConnector);
    let cache = Arc::new(ValidityCache::new(
        Arc::clone(&connector),
        settings.cache_ttl(),
        settings.timeout(),
    ));
    let (scheduler, mut batches) = match Scheduler::new(connector, cache, settings, accounts) {
        Ok(built) => built,
        Err(err) => {
            error!(%err, "invalid settings");
            std::process::exit(2);
        }
    };

    for status in scheduler.list_accounts().await {
        match status.valid {
            Some(true) => info!(account = %status.account, "login ok"),
            _ => warn!(
                account = %status.account,
                error = status.validation_error.as_deref().unwrap_or("unknown"),
                "login failed, account will be retried after the cache expires"
            ),
        }
    }

    if let Err(err) = scheduler.subscribe(STDOUT_TARGET).await {
        error!(%err, "failed to start mail watch");
        std::process::exit(1);
    }

    loop {
        tokio::select! {
            batch = batches.recv() => {
                let Some(batch) = batch else { break };
                for record in &batch.notifications {
                    match serde_json::to_string(record) {
                        Ok(line) => println!("{line}"),
                        Err(err) => warn!(%err, "failed to encode notification"),
                    }
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    error!(%err, "failed to listen for ctrl-c");
                }
                break;
            }
        }
    }

    if let Err(err) = scheduler.stop().await {
        warn!(%err, "shutdown");
    }
}
