use std::{env, path::PathBuf, time::Duration};

use recorder::{GateMode, RecorderConfig, RetryPolicy, init_logging, record};
use tokio::{io::AsyncRead, sync::watch};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = match parse_cli_args() {
        Ok(CliAction::Run(cli)) => *cli,
        Ok(CliAction::Help) => {
            print_cli_help();
            return Ok(());
        }
        Ok(CliAction::Version) => {
            println!("{}", binary_version_text());
            return Ok(());
        }
        Err(err) => {
            eprintln!("error: {err}\n");
            print_cli_help();
            return Err(err.into());
        }
    };

    init_logging()?;
    info!("{}", binary_version_text());

    let config = recorder_config(&cli)?;
    let source: Box<dyn AsyncRead + Unpin + Send> = match &cli.input {
        Some(path) if path.as_os_str() != "-" => {
            info!("recording from {}", path.display());
            Box::new(tokio::fs::File::open(path).await?)
        }
        _ => {
            info!("recording from stdin");
            Box::new(tokio::io::stdin())
        }
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("stop requested");
                let _ = stop_tx.send(true);
            }
            Err(err) => warn!("failed to listen for ctrl-c: {err}"),
        }
    });

    let report = record(config, source, stop_rx).await?;
    println!("{}", report.artifact.file_name);
    info!(
        "recorded {} chunk(s) via {} transport into {} ({} bytes)",
        report.produced, report.transport, report.artifact.file_name, report.artifact.bytes
    );
    Ok(())
}

fn recorder_config(cli: &CliArgs) -> Result<RecorderConfig, String> {
    let defaults = RecorderConfig::default();
    let chunk_ms = cli.chunk_ms.unwrap_or(proto::DEFAULT_CHUNK_INTERVAL_MS);
    if chunk_ms == 0 {
        return Err("--chunk-ms must be greater than zero".to_string());
    }
    let default_retry = RetryPolicy::default();
    Ok(RecorderConfig {
        server_url: cli.server.clone().unwrap_or(defaults.server_url),
        chunk_interval: Duration::from_millis(chunk_ms),
        session_aware: !cli.no_session,
        retry: RetryPolicy {
            max_retries: cli.retries.unwrap_or(default_retry.max_retries),
            backoff: cli
                .retry_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(default_retry.backoff),
        },
        upload_timeout: cli
            .upload_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis),
        gate: cli.gate.unwrap_or_default(),
        worker_resource: cli.worker_resource.clone(),
    })
}

#[derive(Clone, Debug, Default)]
struct CliArgs {
    server: Option<String>,
    input: Option<PathBuf>,
    chunk_ms: Option<u64>,
    no_session: bool,
    retries: Option<u32>,
    retry_backoff_ms: Option<u64>,
    upload_timeout_ms: Option<u64>,
    gate: Option<GateMode>,
    worker_resource: Option<String>,
}

enum CliAction {
    Run(Box<CliArgs>),
    Help,
    Version,
}

fn parse_cli_args() -> Result<CliAction, String> {
    parse_args(env::args().skip(1))
}

fn parse_args(args: impl Iterator<Item = String>) -> Result<CliAction, String> {
    let mut args = args.peekable();
    let mut cli = CliArgs::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(CliAction::Help),
            "-V" | "--version" => return Ok(CliAction::Version),
            "--server" => {
                cli.server = Some(next_arg_value("--server", &mut args)?);
            }
            "--input" => {
                cli.input = Some(PathBuf::from(next_arg_value("--input", &mut args)?));
            }
            "--chunk-ms" => {
                cli.chunk_ms = Some(parse_number("--chunk-ms", &mut args)?);
            }
            "--no-session" => {
                cli.no_session = true;
            }
            "--retries" => {
                cli.retries = Some(parse_number("--retries", &mut args)?);
            }
            "--retry-backoff-ms" => {
                cli.retry_backoff_ms = Some(parse_number("--retry-backoff-ms", &mut args)?);
            }
            "--upload-timeout-ms" => {
                cli.upload_timeout_ms = Some(parse_number("--upload-timeout-ms", &mut args)?);
            }
            "--gate" => {
                let value = next_arg_value("--gate", &mut args)?;
                cli.gate = Some(
                    value
                        .parse::<GateMode>()
                        .map_err(|_| format!("invalid --gate: {value} (expected on|off)"))?,
                );
            }
            "--worker-resource" => {
                cli.worker_resource = Some(next_arg_value("--worker-resource", &mut args)?);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    Ok(CliAction::Run(Box::new(cli)))
}

fn parse_number<T: std::str::FromStr>(
    flag: &str,
    args: &mut std::iter::Peekable<impl Iterator<Item = String>>,
) -> Result<T, String> {
    let value = next_arg_value(flag, args)?;
    value
        .trim()
        .parse::<T>()
        .map_err(|_| format!("invalid {flag}: {value}"))
}

fn next_arg_value(
    flag: &str,
    args: &mut std::iter::Peekable<impl Iterator<Item = String>>,
) -> Result<String, String> {
    let value = args
        .next()
        .ok_or_else(|| format!("missing value for {flag}"))?;
    if value.trim().is_empty() {
        return Err(format!("value for {flag} cannot be empty"));
    }
    Ok(value)
}

fn print_cli_help() {
    eprintln!(concat!(
        "Usage: cr-record [options]\n\n",
        "Records a webm byte stream in timed chunks and uploads them while capture runs.\n",
        "Stops at end of input or on Ctrl-C, then asks the server to merge.\n\n",
        "Options:\n",
        "  --server <URL>               Recording server (default: http://localhost:5000)\n",
        "  --input <PATH|->             Capture source, - for stdin (default: -)\n",
        "  --chunk-ms <MS>              Chunk interval in milliseconds (default: 1000)\n",
        "  --no-session                 Do not request a session id\n",
        "  --retries <N>                Retries per failed chunk (default: 0)\n",
        "  --retry-backoff-ms <MS>      First retry delay, doubled per attempt (default: 250)\n",
        "  --upload-timeout-ms <MS>     Per-upload timeout (default: none)\n",
        "  --gate <on|off>              Worker resource validation (default: on)\n",
        "  --worker-resource <HANDLE>   Resource handle offered to the gate\n",
        "  -V, --version                Show version\n",
        "  -h, --help                   Show this help\n"
    ));
}

fn binary_version_text() -> String {
    format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}
