use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gof_core::ScoredOpportunity;
use gof_storage::PgOpportunityStore;
use gof_sync::{DiscoveryConfig, SourceRegistry, YamlOrgProfileProvider};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "gof")]
#[command(about = "Grant opportunity discovery for nonprofit organizations")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one discovery for an organization and print ranked opportunities.
    Discover {
        #[arg(long)]
        org: Uuid,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Bypass cached source results.
        #[arg(long)]
        force_refresh: bool,
        #[arg(long)]
        json: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// List configured sources.
    Sources,
    /// List organizations from organizations.yaml.
    Orgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("gof=info".parse()?);
    if std::env::var("GOF_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let cli = Cli::parse();
    let config = DiscoveryConfig::from_env();

    match cli.command.unwrap_or(Commands::Sources) {
        Commands::Discover {
            org,
            limit,
            force_refresh,
            json,
        } => {
            let pipeline = gof_sync::pipeline_from_env().await?;
            let response = pipeline
                .discover(org, limit, force_refresh)
                .await
                .with_context(|| format!("discovery for {org}"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                println!(
                    "run {} state={:?} returned={} created={} updated={} duplicates={} failed_sources={:?}",
                    response.run_id,
                    response.state,
                    response.opportunities.len(),
                    response.stats.created,
                    response.stats.updated,
                    response.stats.duplicates,
                    response.stats.sources_failed,
                );
                for (rank, item) in response.opportunities.iter().enumerate() {
                    print_opportunity(rank + 1, item);
                }
            }
        }
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL must be set to run migrations");
            };
            let store = PgOpportunityStore::connect(url).await?;
            store.migrate().await?;
            info!("migrations applied");
        }
        Commands::Sources => {
            let registry = SourceRegistry::load(config.sources_path())?;
            for source in &registry.sources {
                println!(
                    "{:<26} {:<24} enabled={} {}",
                    source.source_id,
                    source.kind.api_label(),
                    source.enabled,
                    source.endpoint
                );
            }
        }
        Commands::Orgs => {
            let provider = YamlOrgProfileProvider::load(config.organizations_path())?;
            for org in provider.organizations().await {
                println!("{}  {}  keywords={:?}", org.id, org.name, org.keywords);
            }
        }
    }

    Ok(())
}

fn print_opportunity(rank: usize, item: &ScoredOpportunity) {
    let o = &item.opportunity;
    let amount = o
        .award_amount()
        .map(|a| format!("${a:.0}"))
        .unwrap_or_else(|| "amount n/a".to_string());
    let deadline = o
        .deadline
        .map(|d| d.to_string())
        .unwrap_or_else(|| "no deadline".to_string());
    println!("{rank:>3}. [{:>3}] {} ({}) {amount}, {deadline}", item.score, o.title, o.funder);
    for reason in &item.reasons {
        println!("         - {reason}");
    }
    if !item.flags.is_empty() {
        println!("         flags: {}", item.flags.iter().cloned().collect::<Vec<_>>().join("; "));
    }
    if let Some(url) = o.source_url.as_deref() {
        println!("         {url}");
    }
}
