//! The `llm` binary: parse one request, run one session, exit.
//!
//! Invoked by thin script wrappers that pipe the directive on stdin, e.g.
//! `llm --into jitgrep --model pro --limit-usd 10 <<'EOF' ... EOF`. Exit
//! codes: 0 for a completed (or completed-replayed) session, 2 for a
//! request the runner refuses to start, 3 for an aborted session, 1 for
//! anything internal.

use std::io::Read;
use std::path::PathBuf;
use std::str::FromStr;

use tracing_subscriber::EnvFilter;

use llm_runner::budget::cents_to_usd;
use llm_runner::config::RunnerConfig;
use llm_runner::dispatch::DelegationMode;
use llm_runner::error::RunnerError;
use llm_runner::session::{SessionController, SessionReport, SessionRequest};
use llm_runner::transcript::read_transcript;

const USAGE: &str = "\
Usage: llm [OPTIONS]

Runs a build directive through budget-capped model workers and records a
replayable session transcript. The directive is read from stdin unless
--directive or --directive-file is given.

Options:
  -d, --directive <TEXT>       directive text inline
      --directive-file <PATH>  read the directive from a file
      --into <NAME>            output directory name (required)
      --model <TIER>           worker tier from the config
      --limit-usd <DOLLARS>    hard spending cap for the session (required)
      --delegation <MODE>      single | staged | auto (default: auto)
      --replay                 reproduce the recording for this request
      --overwrite              replace differing output files instead of aborting
      --request <PATH>         read the whole request as a JSON document
      --config <PATH>          runner config file (default: ./llm-runner.yaml)
  -h, --help                   print this help
";

#[derive(Debug, Default)]
struct CliArgs {
    directive: Option<String>,
    directive_file: Option<PathBuf>,
    into: Option<String>,
    model: Option<String>,
    limit_usd: Option<f64>,
    delegation: Option<DelegationMode>,
    replay: bool,
    overwrite: bool,
    request_file: Option<PathBuf>,
    config_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("llm: {e}");
            let code = e
                .downcast_ref::<RunnerError>()
                .map(RunnerError::exit_code)
                .unwrap_or(1);
            if code == 2 {
                eprintln!("\n{USAGE}");
            }
            code
        }
    };
    std::process::exit(code);
}

async fn run() -> anyhow::Result<i32> {
    let args = match parse_args(std::env::args().skip(1))? {
        Some(args) => args,
        None => {
            print!("{USAGE}");
            return Ok(0);
        }
    };

    let config = RunnerConfig::load(args.config_file.as_deref())?;
    let request = build_request(&args, &config)?;

    let controller = SessionController::new(config);
    let cancel = controller.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling session");
            cancel.cancel();
        }
    });

    let report = controller.run(request).await?;
    describe_report(&report).await;
    Ok(report.exit_code())
}

/// `Ok(None)` means help was requested.
fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Option<CliArgs>> {
    let mut out = CliArgs::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(None),
            "-d" | "--directive" => out.directive = Some(flag_value(&mut args, &arg)?),
            "--directive-file" => {
                out.directive_file = Some(PathBuf::from(flag_value(&mut args, &arg)?))
            }
            "--into" => out.into = Some(flag_value(&mut args, &arg)?),
            "--model" => out.model = Some(flag_value(&mut args, &arg)?),
            "--limit-usd" => {
                let raw = flag_value(&mut args, &arg)?;
                let parsed = raw.parse::<f64>().map_err(|_| {
                    RunnerError::invalid_request(format!(
                        "--limit-usd expects a number, got '{raw}'"
                    ))
                })?;
                out.limit_usd = Some(parsed);
            }
            "--delegation" => {
                let raw = flag_value(&mut args, &arg)?;
                out.delegation =
                    Some(DelegationMode::from_str(&raw).map_err(RunnerError::invalid_request)?);
            }
            "--replay" => out.replay = true,
            "--overwrite" => out.overwrite = true,
            "--request" => out.request_file = Some(PathBuf::from(flag_value(&mut args, &arg)?)),
            "--config" => out.config_file = Some(PathBuf::from(flag_value(&mut args, &arg)?)),
            other => {
                return Err(
                    RunnerError::invalid_request(format!("unknown argument '{other}'")).into(),
                )
            }
        }
    }

    if out.request_file.is_some()
        && (out.directive.is_some()
            || out.directive_file.is_some()
            || out.into.is_some()
            || out.model.is_some()
            || out.limit_usd.is_some()
            || out.delegation.is_some())
    {
        return Err(RunnerError::invalid_request(
            "--request carries the whole request and cannot be combined with field flags",
        )
        .into());
    }

    Ok(Some(out))
}

fn flag_value(
    args: &mut impl Iterator<Item = String>,
    flag: &str,
) -> Result<String, RunnerError> {
    match args.next() {
        Some(v) => Ok(v),
        None => Err(RunnerError::invalid_request(format!(
            "{flag} expects a value"
        ))),
    }
}

fn build_request(args: &CliArgs, config: &RunnerConfig) -> anyhow::Result<SessionRequest> {
    if let Some(path) = &args.request_file {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RunnerError::invalid_request(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut request: SessionRequest = serde_json::from_str(&raw).map_err(|e| {
            RunnerError::invalid_request(format!("{} is not a valid request: {e}", path.display()))
        })?;
        request.replay |= args.replay;
        request.overwrite |= args.overwrite;
        return Ok(request);
    }

    let directive = match (&args.directive, &args.directive_file) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => std::fs::read_to_string(path).map_err(|e| {
            RunnerError::invalid_request(format!("cannot read {}: {e}", path.display()))
        })?,
        (None, None) => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf).map_err(|e| {
                RunnerError::invalid_request(format!("cannot read directive from stdin: {e}"))
            })?;
            buf
        }
    };

    let output_name = args
        .into
        .clone()
        .ok_or_else(|| RunnerError::invalid_request("--into <name> is required"))?;
    let limit_usd = args
        .limit_usd
        .ok_or_else(|| RunnerError::invalid_request("--limit-usd <dollars> is required"))?;

    Ok(SessionRequest {
        directive,
        output_name,
        tier: args
            .model
            .clone()
            .unwrap_or_else(|| config.default_tier.clone()),
        limit_usd,
        replay: args.replay,
        delegation: args.delegation.unwrap_or_default(),
        overwrite: args.overwrite,
    })
}

async fn describe_report(report: &SessionReport) {
    match &report.abort {
        None => {
            println!(
                "{}: {} file(s) under {} (${:.2} charged)",
                report.state,
                report.written.len(),
                report.output_root.display(),
                cents_to_usd(report.total_cost_cents),
            );
            println!("transcript: {}", report.transcript.display());
        }
        Some(abort) => {
            eprintln!("{} ({}): {}", report.state, abort.reason, abort.message);
            if let Ok(events) = read_transcript(&report.transcript).await {
                if let Some(last) = events.last() {
                    eprintln!("last recorded event: seq {} {}", last.seq, last.event.name());
                }
            }
            eprintln!(
                "charged ${:.2} of ${:.2}, ${:.2} remaining (transcript: {})",
                cents_to_usd(report.total_cost_cents),
                cents_to_usd(report.cap_cents),
                cents_to_usd(report.remaining_cents()),
                report.transcript.display(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn test_request_document_uses_invocation_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("request.json");
        std::fs::write(
            &path,
            r#"{"directive":"build the site","into":"site","model":"pro","limit_usd":0.5,"replay_e2e":true}"#,
        )
        .unwrap();

        let parsed = parse_args(args(&["--request", path.to_str().unwrap()]))
            .unwrap()
            .unwrap();
        let request = build_request(&parsed, &RunnerConfig::default()).unwrap();
        assert_eq!(request.directive, "build the site");
        assert_eq!(request.output_name, "site");
        assert_eq!(request.tier, "pro");
        assert_eq!(request.limit_usd, 0.5);
        assert!(request.replay);
    }

    #[test]
    fn test_request_document_excludes_field_flags() {
        let err =
            parse_args(args(&["--request", "r.json", "--delegation", "staged"])).unwrap_err();
        let runner_err = err.downcast_ref::<RunnerError>().unwrap();
        assert!(runner_err.is_invalid_request());
    }

    #[test]
    fn test_field_flags_fall_back_to_config_tier() {
        let parsed = parse_args(args(&[
            "--directive",
            "do the thing",
            "--into",
            "out",
            "--limit-usd",
            "2.5",
            "--overwrite",
        ]))
        .unwrap()
        .unwrap();
        let request = build_request(&parsed, &RunnerConfig::default()).unwrap();
        assert_eq!(request.tier, "pro");
        assert_eq!(request.limit_usd, 2.5);
        assert!(request.overwrite);
        assert!(!request.replay);
    }
}
