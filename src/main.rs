//! livecall - voice calls from the terminal
//!
//! Usage: `livecall [CONTACT] [--wav FILE] [--route ROUTE] [--muted]`
//!
//! The ID token is read from `LIVECALL_ID_TOKEN`. With `--wav`, the file is
//! used as the microphone and output is discarded.

#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use livecall::device::pulse::PulseBackend;
use livecall::device::FileBackend;
use livecall::{
    AudioBackend, AudioRoute, EngineConfig, EngineEvent, PoolRegistry, TokenStore, VoiceSession,
    WsConnector,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

const TOKEN_ENV: &str = "LIVECALL_ID_TOKEN";

struct Args {
    contact: String,
    wav: Option<PathBuf>,
    route: Option<AudioRoute>,
    muted: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        contact: "Miles-EN".to_string(),
        wav: None,
        route: None,
        muted: false,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--wav" => args.wav = Some(it.next().context("--wav needs a file")?.into()),
            "--route" => {
                let route = it.next().context("--route needs a value")?;
                args.route = Some(route.parse()?);
            }
            "--muted" => args.muted = true,
            flag if flag.starts_with("--") => bail!("unknown option {flag}"),
            contact => args.contact = contact.to_string(),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = parse_args()?;
    let config = EngineConfig::load().context("Failed to load configuration")?;
    let token = std::env::var(TOKEN_ENV).with_context(|| format!("{TOKEN_ENV} is not set"))?;
    let tokens = Arc::new(TokenStore::with_token(token));

    let backend: Arc<dyn AudioBackend> = match &args.wav {
        Some(path) => {
            info!(path = %path.display(), "Using WAV file as microphone");
            Arc::new(FileBackend::new(path))
        }
        None => Arc::new(PulseBackend::new("livecall")),
    };

    let connector = Arc::new(WsConnector::new(config.client.clone()));
    let registry = Arc::new(PoolRegistry::new(config.pool.clone(), connector));
    let session = VoiceSession::new(&config, registry, backend);

    let mut events = session.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(EngineEvent::Error(e)) => error!("{}", e),
                Ok(event @ EngineEvent::InitProgress(_)) => debug!("{}", event),
                Ok(event) => info!("{}", event),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    if let Some(route) = args.route {
        session.set_audio_route(route)?;
    }
    if args.muted {
        session.set_muted(true).await?;
    }

    info!(contact = %args.contact, pool_size = config.pool.target_size, "Starting call");
    session
        .connect(&args.contact, tokens)
        .await
        .context("Failed to start call")?;
    info!("Call in progress, press Ctrl-C to hang up");

    let ended = {
        let session = session.clone();
        async move {
            while session.is_active().await {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Hanging up"),
        _ = ended => info!("Call ended by the remote side"),
    }

    session.shutdown().await;
    info!("livecall stopped");
    Ok(())
}
