use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use amendwatch_feed::{FeedClient, SearchParams};
use amendwatch_impact::ImpactAnalyzer;
use amendwatch_pipeline::{
    diff_listing, impact_listing, load_rules, open_repo, run_scan, ImpactRequest, PipelineConfig,
};
use amendwatch_store::PgSnapshotStore;
use amendwatch_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "amendwatch")]
#[command(about = "Opportunity change detection and amendment impact analysis")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the upstream feed and record listing snapshots.
    Scan {
        #[arg(long)]
        keyword: Option<String>,
        #[arg(long, default_value_t = 1)]
        days_back: u32,
        #[arg(long = "naics")]
        naics_codes: Vec<String>,
        #[arg(long = "set-aside")]
        set_asides: Vec<String>,
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
    /// Diff two snapshots of a listing (defaults to the two most recent).
    Diff {
        notice_id: String,
        #[arg(long)]
        from: Option<Uuid>,
        #[arg(long)]
        to: Option<Uuid>,
    },
    /// Score proposal sections from a JSON file against a listing's diff.
    Impact {
        notice_id: String,
        #[arg(long)]
        sections: PathBuf,
        #[arg(long, default_value_t = 10)]
        top_n: usize,
    },
    /// Serve the JSON API.
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Create the Postgres snapshot schema.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command {
        Commands::Scan {
            keyword,
            days_back,
            naics_codes,
            set_asides,
            limit,
        } => {
            let repo = open_repo(&config).await?;
            let feed = FeedClient::new(config.feed.clone())?;
            let params = SearchParams {
                keyword,
                days_back,
                naics_codes,
                set_asides,
                limit,
                ..SearchParams::default()
            };
            let summary = run_scan(repo.as_ref(), &feed, &params, None).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Diff {
            notice_id,
            from,
            to,
        } => {
            let repo = open_repo(&config).await?;
            let diff = diff_listing(repo.as_ref(), &notice_id, from, to).await?;
            println!("{}", serde_json::to_string_pretty(&diff)?);
        }
        Commands::Impact {
            notice_id,
            sections,
            top_n,
        } => {
            let repo = open_repo(&config).await?;
            let analyzer = ImpactAnalyzer::new(load_rules(&config)?);
            let text = std::fs::read_to_string(&sections)
                .with_context(|| format!("reading {}", sections.display()))?;
            let mut request: ImpactRequest = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", sections.display()))?;
            request.top_n = top_n;
            let result = impact_listing(repo.as_ref(), &analyzer, &notice_id, &request).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Serve { port } => {
            let repo = open_repo(&config).await?;
            let analyzer = Arc::new(ImpactAnalyzer::new(load_rules(&config)?));
            let feed = if config.feed.api_key.is_some() {
                Some(Arc::new(FeedClient::new(config.feed.clone())?))
            } else {
                None
            };
            amendwatch_web::serve(AppState::new(repo, analyzer, feed), port).await?;
        }
        Commands::Migrate => {
            let Some(url) = &config.database_url else {
                bail!("DATABASE_URL is not set; migrate targets the Postgres store");
            };
            let store = PgSnapshotStore::connect(url).await?;
            store.migrate().await?;
            println!("snapshot schema is up to date");
        }
    }

    Ok(())
}
