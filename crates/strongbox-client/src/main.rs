use std::env;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use strongbox_transfer::{
    BackupSession, ChannelSink, FileIdentityStore, StatusSink, Tee, TracingSink, TransferConfig,
    TransferContext,
};
use tracing::{info, warn};

/// Events buffered between the engine and the stdout printer.
const EVENT_QUEUE: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "strongbox_client=info,strongbox_transfer=info".into()),
        )
        .init();

    // Config
    let config = config_from_env()?;
    let file: PathBuf = env::var("STRONGBOX_FILE")
        .context("STRONGBOX_FILE is not set")?
        .into();
    let identity_path: PathBuf = env::var("STRONGBOX_IDENTITY_PATH")
        .unwrap_or_else(|_| "me.info".into())
        .into();

    info!(
        server = %config.server_addr,
        username = %config.username,
        file = %file.display(),
        identity = %identity_path.display(),
        "starting backup"
    );

    // Status events go to stdout as JSON lines, and to the log.
    let (channel, events) = ChannelSink::new(EVENT_QUEUE);
    let channel = Arc::new(channel);
    let sinks: Vec<Arc<dyn StatusSink>> = vec![channel.clone() as Arc<dyn StatusSink>, Arc::new(TracingSink)];
    let printer = std::thread::spawn(move || {
        let mut out = std::io::stdout().lock();
        for event in events {
            match serde_json::to_string(&event) {
                Ok(line) => {
                    let _ = writeln!(out, "{}", line);
                }
                Err(e) => warn!("Failed to serialize status event: {}", e),
            }
        }
    });

    let ctx = TransferContext::new(config, Arc::new(Tee(sinks)));
    let cancel = ctx.cancel.clone();
    let session = BackupSession::new(ctx, Arc::new(FileIdentityStore::new(identity_path)));

    // The engine is blocking; Ctrl+C trips the cancel token and the session
    // stops at the next packet boundary.
    let mut job = tokio::task::spawn_blocking(move || session.run(&file));
    let result = tokio::select! {
        res = &mut job => res?,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupt received, cancelling");
            cancel.cancel();
            job.await?
        }
    };

    let dropped = channel.dropped();
    drop(channel);
    if printer.join().is_err() {
        warn!("status printer thread panicked");
    }
    if dropped > 0 {
        warn!(dropped, "status events dropped by a slow consumer");
    }

    let summary = result?;
    info!(
        client_id = %summary.client_id,
        bytes = summary.size,
        crc = summary.crc,
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "backup finished"
    );
    Ok(())
}

fn config_from_env() -> anyhow::Result<TransferConfig> {
    let mut config = TransferConfig::default();
    if let Ok(addr) = env::var("STRONGBOX_SERVER") {
        config.server_addr = addr;
    }
    config.username = env::var("STRONGBOX_USERNAME").context("STRONGBOX_USERNAME is not set")?;
    if let Some(max) = env_parse::<u32>("STRONGBOX_MAX_RETRIES")? {
        config.max_crc_retries = max;
        config.max_file_retries = max;
        config.max_reconnects = max;
    }
    if let Some(secs) = env_parse::<u64>("STRONGBOX_CONNECT_TIMEOUT_SECS")? {
        config.connect_timeout = Duration::from_secs(secs);
    }
    config.validate()?;
    Ok(config)
}

fn env_parse<T>(name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(name)
        .ok()
        .map(|v| v.parse::<T>().with_context(|| format!("{} is not a valid number: {:?}", name, v)))
        .transpose()
}
