use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vigil_common::notify::JsonLinesSink;
use vigil_common::version::{read_embedded_version, running_version};
use vigil_common::Notifier;
use vigil_rendezvous::{DefaultBackend, IpcHandshake};
use vigil_update::{
    mount, new_run_id, Credentials, EmbeddedVersionOracle, RecoveryEngine, UnitRegistry,
    UpdateContext, UpdateOrchestrator, UpdateRequest, UpdateSource, UpdaterConfig,
};

const EXIT_RECOVERY_FAILED: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "vigil-updater", version)]
#[command(about = "Replaces the vigil agent in place and rolls back on failure")]
struct Cli {
    /// Path to the updater configuration (vigil-updater.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stage, gate and swap in a new bundle
    Update {
        /// Local directory or network share (//host/share, \\host\share)
        #[arg(long)]
        source: String,

        /// Share user name
        #[arg(long)]
        user: Option<String>,

        /// Environment variable holding the share password
        #[arg(long, requires = "user")]
        password_env: Option<String>,

        /// Swap even when versions and files match
        #[arg(long)]
        force: bool,

        /// Accept a bundle older than the running version
        #[arg(long)]
        allow_downgrade: bool,

        /// Give up when no client attaches within this many milliseconds (0 waits forever)
        #[arg(long, default_value_t = 0)]
        client_timeout_ms: u64,
    },

    /// Restore the known-good executable and restart the service
    Recover,

    /// Print build and version information
    Inspect {
        /// Also read the embedded version of this executable
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct InspectReport {
    running_version: String,
    build_id: &'static str,
    build_time: &'static str,
    git: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<FileReport>,
}

#[derive(Serialize)]
struct FileReport {
    path: PathBuf,
    version: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    if let Command::Inspect { file } = &cli.command {
        inspect(file.as_deref())?;
        return Ok(0);
    }

    let (config, loaded_from) =
        UpdaterConfig::load(cli.config.as_deref()).context("loading updater configuration")?;
    match &loaded_from {
        Some(path) => info!("configuration loaded from {}", path.display()),
        None => info!("no configuration file found, using defaults"),
    }

    let run_id = new_run_id();
    info!("{} (run {})", vigil_build_info::formatted_banner("vigil-updater"), run_id);
    let notifier = Notifier::new(Arc::new(JsonLinesSink::new(io::stdout()))).with_meta(run_id);
    let ctx = build_context(&config, notifier);

    match cli.command {
        Command::Update {
            source,
            user,
            password_env,
            force,
            allow_downgrade,
            client_timeout_ms,
        } => {
            let mut request = UpdateRequest::new(UpdateSource::parse(&source))
                .with_force(force)
                .with_allow_downgrade(allow_downgrade)
                .with_client_timeout(Duration::from_millis(client_timeout_ms));
            if let Some(user) = user {
                request = request.with_credentials(credentials(user, password_env)?);
            }

            let handshake = Arc::new(IpcHandshake::<DefaultBackend>::new(
                config.rendezvous.ready_channel.clone(),
                config.rendezvous.connected_channel.clone(),
            ));
            let mut orchestrator = UpdateOrchestrator::new(ctx, handshake);
            let outcome = orchestrator.run(&request).await;
            info!("update finished: {}", outcome);
            Ok(u8::try_from(outcome.exit_code()).unwrap_or(1))
        }
        Command::Recover => match RecoveryEngine::new(ctx).execute_emergency_recovery().await {
            Ok(()) => Ok(0),
            Err(err) => {
                error!("recovery failed: {}", err);
                Ok(EXIT_RECOVERY_FAILED)
            }
        },
        Command::Inspect { .. } => Ok(0),
    }
}

fn build_context(config: &UpdaterConfig, notifier: Notifier) -> UpdateContext {
    UpdateContext {
        paths: config.update_paths(),
        timings: config.timings(),
        units: UnitRegistry::from_config(config),
        mount: mount::provider_for(&config.mount),
        oracle: Arc::new(EmbeddedVersionOracle::new()),
        notifier,
    }
}

fn credentials(user: String, password_env: Option<String>) -> Result<Credentials> {
    let password = match password_env {
        Some(var) => match std::env::var(&var) {
            Ok(value) => value,
            Err(_) => bail!("password variable {} is not set", var),
        },
        None => String::new(),
    };
    Ok(Credentials::new(user, password))
}

fn inspect(file: Option<&std::path::Path>) -> Result<()> {
    let file = file
        .map(|path| -> Result<FileReport> {
            let version = read_embedded_version(path)
                .with_context(|| format!("reading version of {}", path.display()))?;
            Ok(FileReport {
                path: path.to_path_buf(),
                version: version.to_string(),
            })
        })
        .transpose()?;

    let report = InspectReport {
        running_version: running_version().to_string(),
        build_id: vigil_build_info::build_id(),
        build_time: vigil_build_info::build_timestamp(),
        git: vigil_build_info::git_label(),
        file,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_update_flags() {
        let cli = Cli::parse_from([
            "vigil-updater",
            "--debug",
            "update",
            "--source",
            "//fileserver/vigil",
            "--user",
            "svc",
            "--password-env",
            "VIGIL_SHARE_PASSWORD",
            "--force",
            "--client-timeout-ms",
            "500",
        ]);
        assert!(cli.debug);
        match cli.command {
            Command::Update {
                source,
                user,
                password_env,
                force,
                allow_downgrade,
                client_timeout_ms,
            } => {
                assert_eq!(source, "//fileserver/vigil");
                assert_eq!(user.as_deref(), Some("svc"));
                assert_eq!(password_env.as_deref(), Some("VIGIL_SHARE_PASSWORD"));
                assert!(force);
                assert!(!allow_downgrade);
                assert_eq!(client_timeout_ms, 500);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn password_env_requires_user() {
        let parsed = Cli::try_parse_from([
            "vigil-updater",
            "update",
            "--source",
            "/srv/updates",
            "--password-env",
            "X",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn missing_password_variable_is_an_error() {
        let err = credentials("svc".into(), Some("VIGIL_TEST_UNSET_PASSWORD_VAR".into())).unwrap_err();
        assert!(err.to_string().contains("VIGIL_TEST_UNSET_PASSWORD_VAR"));
    }
}
