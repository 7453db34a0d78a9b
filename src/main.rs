//! Mesh operator - Istio control plane lifecycle on Kubernetes

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};

use mesh_operator::crd::{Istio, RemoteIstio};
use mesh_operator::reconcile::{EngineConfig, FIELD_MANAGER};
use mesh_operator::resources::rendered::RenderedComponent;
use mesh_operator::runner::{self, parse_bind_addr, RunnerConfig};
use mesh_operator::telemetry::{init_telemetry, TelemetryConfig};

/// Mesh operator - installs and reconciles an Istio service mesh
#[derive(Parser, Debug)]
#[command(name = "mesh-operator", version, about, long_about = None)]
struct Cli {
    /// Address the health endpoints bind to
    #[arg(long, env = "MESH_OPERATOR_METRICS_ADDR", default_value = ":8080")]
    metrics_addr: String,

    /// Human-readable logs instead of JSON
    #[arg(long, env = "MESH_OPERATOR_DEVEL_MODE")]
    devel_mode: bool,

    /// Directory of pre-rendered manifests, one component per YAML file
    #[arg(long, env = "MESH_OPERATOR_MANIFESTS")]
    manifests: Option<PathBuf>,

    /// Bound on each cluster call, in seconds
    #[arg(long, default_value = "30")]
    apply_timeout_secs: u64,

    /// Print CRD manifests and exit
    #[arg(long)]
    crd: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.crd {
        match crd_manifests() {
            Ok(yaml) => {
                println!("{yaml}");
                return;
            }
            Err(e) => {
                eprintln!("failed to serialize CRDs: {e:#}");
                std::process::exit(1);
            }
        }
    }

    if let Err(e) = init_telemetry(TelemetryConfig {
        devel_mode: cli.devel_mode,
        ..Default::default()
    }) {
        eprintln!("failed to initialize telemetry: {e}");
        std::process::exit(1);
    }

    if let Err(e) = run(cli).await {
        tracing::error!(error = %format!("{e:#}"), "mesh operator failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let metrics_addr = parse_bind_addr(&cli.metrics_addr).map_err(anyhow::Error::msg)?;
    let rendered = match &cli.manifests {
        Some(dir) => load_rendered(dir).await?,
        None => Vec::new(),
    };

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {}", e))?;
    ensure_crds_installed(&client).await?;

    tracing::info!(
        rendered = rendered.len(),
        apply_timeout_secs = cli.apply_timeout_secs,
        "mesh operator starting"
    );
    runner::run(
        client,
        RunnerConfig {
            metrics_addr,
            engine: EngineConfig {
                apply_timeout: Duration::from_secs(cli.apply_timeout_secs),
            },
            rendered,
        },
    )
    .await
}

fn crd_manifests() -> anyhow::Result<String> {
    let istio = serde_yaml::to_string(&Istio::crd())?;
    let remote = serde_yaml::to_string(&RemoteIstio::crd())?;
    Ok(format!("{istio}---\n{remote}"))
}

/// Operator installs its own CRDs on startup
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in [Istio::crd(), RemoteIstio::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install CRD {}: {}", name, e))?;
    }
    Ok(())
}

/// Load every `*.yaml`/`*.yml` file of a directory as a rendered component,
/// named after the file stem and ordered by file name
async fn load_rendered(dir: &Path) -> anyhow::Result<Vec<RenderedComponent>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| anyhow::anyhow!("failed to read manifests directory {:?}: {}", dir, e))?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        ) {
            files.push(path);
        }
    }
    files.sort();

    let mut components = Vec::with_capacity(files.len());
    for path in files {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to read {:?}: {}", path, e))?;
        components.push(RenderedComponent::from_yaml(name, &content)?);
    }
    Ok(components)
}
