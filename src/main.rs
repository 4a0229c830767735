/*!
# Introduction

creddog fetches a short-lived authorization token for Amazon ECR and merges it
into a local Docker credential file, so that subsequent image pulls and pushes
authenticate automatically.

Both Docker credential schemas are supported: the legacy flat `.dockercfg`
mapping and the current `config.json` file with its `auths` envelope. The
schema is detected from the target path's suffix and can be overridden with
`--schema`. Each registry endpoint in the ECR response is upserted into the
file; entries for other registries are left alone.

# Interface

By default the merged file is printed to stdout and the file on disk is left
untouched; pass `--replace` to rewrite the target file in place (atomically,
via a temporary file). The AWS region is taken from `--region` when given,
otherwise from instance metadata. A metadata failure is logged and tolerated;
the run then proceeds without a region and the ECR call reports the failure.

Credential files that exist but do not parse are treated as empty by default;
pass `--strict` to fail on malformed input instead.
*/

mod aws;
mod docker_config;
mod ecr;
mod imds;

use argh::FromArgs;
use docker_config::{CredentialStore, ParseMode, SchemaVersion};
use log::{info, warn};
use simplelog::{Config as LogConfig, LevelFilter, SimpleLogger};
use snafu::ResultExt;
use std::io::{self, Write};
use std::path::PathBuf;
use std::{env, process};

/// Stores user-supplied global arguments
#[derive(FromArgs, Debug)]
struct Args {
    #[argh(option, short = 'c')]
    /// path to the Docker credential file to update
    config: Option<PathBuf>,

    #[argh(option, short = 'r')]
    /// AWS region; read from instance metadata when not given
    region: Option<String>,

    #[argh(option, short = 's')]
    /// schema override, dockercfg|config.json; detected from the path suffix when not given
    schema: Option<SchemaVersion>,

    #[argh(switch)]
    /// replace the credential file instead of printing it to stdout
    replace: bool,

    #[argh(switch)]
    /// fail on a malformed credential file instead of starting from an empty store
    strict: bool,

    #[argh(option, default = "LevelFilter::Info", short = 'l')]
    /// log-level trace|debug|info|warn|error
    log_level: LevelFilter,
}

mod error {
    use crate::{docker_config, ecr};
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub(super) enum Error {
        #[snafu(context(false), display("{}", source))]
        DockerConfig { source: docker_config::Error },

        #[snafu(display("Unable to obtain ECR authorization token: {}", source))]
        Authorization { source: ecr::Error },

        #[snafu(display("Logger setup error: {}", source))]
        Logger { source: log::SetLoggerError },

        #[snafu(display("Failed to write to stdout: {}", source))]
        WriteStdout { source: std::io::Error },
    }
}

use error::Error;

type Result<T> = std::result::Result<T, Error>;

/// Print usage message. The credential file path is the one argument without
/// a usable default, so asking for nothing but help is not an error.
fn usage() -> ! {
    let program_name = env::args().next().unwrap_or_else(|| "creddog".to_string());
    eprintln!(
        "Usage: {} --config DOCKER_CONFIG_LOCATION [--region REGION] [--schema dockercfg|config.json] [--replace] [--strict]",
        program_name
    );
    process::exit(0);
}

/// Returns the region to use for the ECR call: the explicit argument when
/// given, otherwise whatever instance metadata reports. Metadata failures are
/// tolerated here; a missing region only becomes fatal at the authorization
/// call.
async fn resolve_region(explicit: Option<String>) -> Option<String> {
    if explicit.is_some() {
        return explicit;
    }
    match imds::ImdsClient::new().await {
        Ok(mut client) => match client.fetch_region().await {
            Ok(Some(region)) => Some(region),
            Ok(None) => {
                warn!("Instance metadata did not report a region");
                None
            }
            Err(e) => {
                warn!("Unable to read region from instance metadata: {}", e);
                None
            }
        },
        Err(e) => {
            warn!("Unable to reach instance metadata service: {}", e);
            None
        }
    }
}

async fn run() -> Result<()> {
    let args: Args = argh::from_env();

    // SimpleLogger will send errors to stderr and anything less to stdout.
    SimpleLogger::init(args.log_level, LogConfig::default()).context(error::LoggerSnafu)?;

    let config_path = match args.config {
        Some(path) => path,
        None => usage(),
    };

    // Resolve the schema before any network activity, so an unusable target
    // path fails fast.
    let version = match args.schema {
        Some(version) => version,
        None => SchemaVersion::detect(&config_path)?,
    };
    let mode = if args.strict {
        ParseMode::Strict
    } else {
        ParseMode::Lenient
    };

    let region = resolve_region(args.region).await;
    match &region {
        Some(region) => info!("Using region '{}'", region),
        None => warn!("Proceeding without a region"),
    }

    let records = ecr::get_authorization_token(region.as_deref())
        .await
        .context(error::AuthorizationSnafu)?;
    info!("Received {} authorization record(s) from ECR", records.len());

    let mut store = CredentialStore::load(&config_path, version, mode)?;
    store.merge(&records);
    let serialized = store.to_json()?;

    if args.replace {
        docker_config::persist(&serialized, &config_path)?;
        info!(
            "Wrote {} credential(s) to '{}'",
            store.len(),
            config_path.display()
        );
    } else {
        let mut stdout = io::stdout();
        stdout
            .write_all(&serialized)
            .context(error::WriteStdoutSnafu)?;
        stdout.write_all(b"\n").context(error::WriteStdoutSnafu)?;
    }

    Ok(())
}

// Returning a Result from main makes it print a Debug representation of the error, but with Snafu
// we have nice Display representations of the error, so we wrap "main" (run) and print any error.
// https://github.com/shepmaster/snafu/issues/110
#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{}", e);
        process::exit(1);
    }
}
