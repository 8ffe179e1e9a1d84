use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use portal_cli::{Cli, EquipmentRequest, FormCommand, PermitRequest, PhoneUpdate};
use portal_submit::config::{AppConfig, ConfigLoader};
use portal_submit::quality::SysfsSignal;
use portal_submit::{
    FnObserver, HttpSubmitter, QualityMonitor, SubmissionCoordinator, SubmitError, Submitter,
};
use serde::Serialize;
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

type DynSubmitter<T> = Arc<dyn Submitter<Payload = T, Output = Value>>;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_logging();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ConfigLoader::new().with_file(path).load(),
        None => ConfigLoader::load_default(),
    }
    .context("failed to load configuration")?;

    let flow = cli.command.flow();
    let endpoint = cli.command.endpoint();
    let options = RunOptions {
        json: cli.json,
        repeat: cli.repeat,
    };
    let succeeded = match cli.command {
        FormCommand::Permit(args) => {
            run_flow(&config, flow, endpoint, PermitRequest::from(args), options).await?
        }
        FormCommand::Equipment(args) => {
            run_flow(&config, flow, endpoint, EquipmentRequest::from(args), options).await?
        }
        FormCommand::Phone(args) => {
            run_flow(&config, flow, endpoint, PhoneUpdate::from(args), options).await?
        }
    };

    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn init_logging() {
    let default_level = "warn";
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Debug, Clone, Copy)]
struct RunOptions {
    json: bool,
    repeat: u32,
}

fn submitter<T>(config: &AppConfig, endpoint: &str) -> DynSubmitter<T>
where
    T: Serialize + Send + Sync + 'static,
{
    let http = HttpSubmitter::<T, Value>::new(config.http.endpoint(endpoint))
        .with_token(config.http.token.clone());

    #[cfg(feature = "dev-faults")]
    let http = portal_submit::faults::FaultySubmitter::from_env(http);

    Arc::new(http)
}

/// Submit `payload` once plus `repeat` more times. Returns whether every
/// submission succeeded.
async fn run_flow<T>(
    config: &AppConfig,
    flow: &str,
    endpoint: &str,
    payload: T,
    options: RunOptions,
) -> Result<bool>
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    let policy = config
        .policy(flow)
        .with_context(|| format!("no usable retry policy for flow '{flow}'"))?;
    let json_output = options.json;

    let monitor = QualityMonitor::new(Arc::new(SysfsSignal::default()));
    monitor.sample();

    let coordinator = Arc::new(
        SubmissionCoordinator::new(submitter::<T>(config, endpoint), policy)
            .with_monitor(monitor)
            .with_observer(FnObserver::new(
                |stage| tracing::info!(%stage, "progress"),
                move |issue| {
                    if !json_output {
                        eprintln!("warning: {issue}");
                    }
                },
            )),
    );
    let _watch = coordinator.watch_connection(config.monitor.sample_interval());

    let ctrl_c = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling submissions");
                coordinator.cancel_all();
            }
        }
    });

    let mut all_ok = true;
    for _ in 0..=options.repeat {
        let outcome = coordinator.submit(payload.clone()).await;
        all_ok &= outcome.is_ok();
        report(flow, &outcome, options.json)?;
        if matches!(outcome, Err(SubmitError::UserCancelled)) {
            break;
        }
    }

    ctrl_c.abort();
    Ok(all_ok)
}

fn report(flow: &str, outcome: &portal_submit::Result<Value>, json_output: bool) -> Result<()> {
    if json_output {
        let line = match outcome {
            Ok(response) => json!({ "flow": flow, "ok": true, "response": response }),
            Err(err) => json!({
                "flow": flow,
                "ok": false,
                "error": err.to_string(),
                "suppressed": err.is_suppressed(),
            }),
        };
        println!("{}", serde_json::to_string(&line)?);
        return Ok(());
    }

    match outcome {
        Ok(response) => {
            let message = response
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| response.to_string());
            println!("{flow}: {message}");
        }
        Err(err) => eprintln!("{flow}: {err}"),
    }
    Ok(())
}
