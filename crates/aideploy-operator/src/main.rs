//! AI deployment operator - runs inference engines for AIDeployment resources

mod controllers;

use clap::{Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};

use aideploy_common::crd::all_crds;
use aideploy_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use aideploy_common::FIELD_MANAGER;
use aideploy_workload::ingress::{
    IngressConfig, DEFAULT_AUTH_MIDDLEWARE, DEFAULT_RATE_LIMIT_MIDDLEWARE,
};

/// Kubernetes operator serving AI models through pluggable inference engines
#[derive(Parser, Debug)]
#[command(name = "aideploy", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Traefik middleware enforcing authentication on ingresses
    #[arg(long, env = "TRAEFIK_AUTH_MIDDLEWARE", default_value = DEFAULT_AUTH_MIDDLEWARE)]
    auth_middleware: String,

    /// Traefik middleware enforcing rate limits on ingresses
    #[arg(
        long,
        env = "TRAEFIK_RATE_LIMIT_MIDDLEWARE",
        default_value = DEFAULT_RATE_LIMIT_MIDDLEWARE
    )]
    rate_limit_middleware: String,

    /// Log line format (json or text)
    #[arg(long, env = "AIDEPLOY_LOG_FORMAT", default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    /// Do not install or upgrade CRDs on startup
    #[arg(long)]
    skip_crd_install: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controllers (default mode)
    ///
    /// Watches AIDeployment, AIModelMap and AutoNodeLabeler resources and
    /// reconciles them until a termination signal arrives.
    Controller,
}

impl Cli {
    fn ingress_config(&self) -> IngressConfig {
        IngressConfig {
            auth_middleware: self.auth_middleware.clone(),
            rate_limit_middleware: self.rate_limit_middleware.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crd_manifests()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        format: cli.log_format,
        ..Default::default()
    })?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(&cli).await,
    }
}

/// All CRDs as a multi-document YAML stream
fn crd_manifests() -> anyhow::Result<String> {
    let documents = all_crds()
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
    Ok(documents.join("---\n"))
}

/// Ensure all operator CRDs are installed
///
/// CRDs are applied server-side on every start so they always match the
/// running operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in all_crds() {
        let name = crd
            .metadata
            .name
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generated CRD has no name"))?;
        tracing::info!(crd = %name, "Installing CRD...");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install CRD {}: {}", name, e))?;
    }

    Ok(())
}

async fn run_controller(cli: &Cli) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if cli.skip_crd_install {
        tracing::info!("Skipping CRD installation");
    } else {
        ensure_crds_installed(&client).await?;
    }

    tracing::info!("Starting AI deployment controllers...");
    controllers::run(client, cli.ingress_config()).await;

    tracing::info!("AI deployment operator shutting down");
    Ok(())
}
