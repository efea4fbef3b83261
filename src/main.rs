use clap::{Parser, Subcommand};
use eyre::{Result, WrapErr, eyre};
use hermes_media::{
    BatchCoordinator, BatchError, CdnResolver, FileId, ProvenanceTracker, ShopifyClient,
    TransportGovernor, UploadRequest, UploaderConfig, http::build_client,
};
use serde_json::json;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

/// Upload media into the catalog with provenance tracked beside each file.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload every request in a JSON array file and print the batch result
    Submit { requests: PathBuf },
    /// Find a public URL for an existing file
    Resolve {
        file_id: String,
        /// Attach to this product through REST if no record URL is reachable
        #[arg(long)]
        product: Option<String>,
    },
    /// List files whose provenance `key` currently equals `value`
    Find { key: String, value: String },
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "hermes.cli", "{err:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let args = Args::parse();

    let config = UploaderConfig::load().wrap_err("loading configuration")?;
    let client = ShopifyClient::new(
        build_client(&config.transport),
        TransportGovernor::new(&config.transport),
        config.shop.clone(),
    );

    match args.command {
        Command::Submit { requests } => submit(client, &config, requests).await,
        Command::Resolve { file_id, product } => resolve(client, &config, file_id, product).await,
        Command::Find { key, value } => {
            let tracker = ProvenanceTracker::new(client, config.provenance_namespace.clone());
            let ids = tracker.find_by_provenance(&key, &value).await?;
            print_json(&json!({ "key": key, "value": value, "files": ids }))
        }
    }
}

async fn submit(client: ShopifyClient, config: &UploaderConfig, path: PathBuf) -> Result<()> {
    let raw = tokio::fs::read_to_string(&path)
        .await
        .wrap_err_with(|| format!("reading {}", path.display()))?;
    let requests: Vec<UploadRequest> =
        serde_json::from_str(&raw).wrap_err("parsing upload requests")?;
    info!(target = "hermes.cli", count = requests.len(), "submitting");

    let coordinator = BatchCoordinator::new(client, config);
    match coordinator.submit(requests).await {
        Ok(result) => print_json(&result.summary()),
        Err(err) => {
            print_json(&err.partial().summary())?;
            let BatchError::Unreachable { chunks, .. } = err;
            Err(eyre!("batch aborted: catalog unreachable for {chunks} chunk(s)"))
        }
    }
}

async fn resolve(
    client: ShopifyClient,
    config: &UploaderConfig,
    file_id: String,
    product: Option<String>,
) -> Result<()> {
    let record = client.query_file(&FileId::new(file_id)).await?;
    let resolver = CdnResolver::new(client, config.resolver.clone());
    let resolved = match product.as_deref() {
        Some(product_id) => resolver.resolve_for_product(&record, product_id).await?,
        None => resolver.resolve(&record).await?,
    };
    print_json(&json!({
        "file_id": record.id,
        "status": record.status,
        "url": resolved.url,
        "source": format!("{:?}", resolved.source),
        "verified": resolved.verified,
    }))
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}
