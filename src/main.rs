use anyhow::Result;
use clap::Parser;
use colored::*;
use sitesnap::{CrawlConfig, Crawler};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tokio::fs;

#[derive(Parser)]
#[command(name = "sitesnap")]
#[command(about = "Save the pages linked from a website as self-contained HTML for offline viewing")]
#[command(version = "0.1.0")]
struct Args {
    /// Base URL of the website to crawl, e.g. https://www.website.org
    url: String,

    /// Path under the base URL to discover links from, e.g. 'docs/'
    #[arg(short = 'p', long = "path", default_value = "")]
    crawl_path: String,

    /// CSS selector for the links to archive, e.g. 'a.article-link'
    #[arg(short = 's', long = "selector", default_value = "a")]
    selector: String,

    /// Output directory used to save files
    #[arg(short = 'o', long = "outDir", default_value = "output_sitesnap")]
    out_dir: String,

    /// Create a per-site subdirectory under the output directory
    #[arg(long = "site-dir")]
    site_dir: bool,

    /// Resource fetch timeout in seconds
    #[arg(short = 't', long = "timeout", default_value = "30.0", value_parser = parse_timeout)]
    timeout: f64,
}

fn parse_timeout(s: &str) -> Result<f64, String> {
    let value = s.parse::<f64>().map_err(|_| "Not a number.")?;
    if value < 0.0 {
        return Err("Must be zero or positive number.".to_string());
    }
    Ok(value)
}

async fn run(args: Args) -> Result<()> {
    let mut config = CrawlConfig::new(
        &args.url,
        &args.crawl_path,
        &args.selector,
        PathBuf::from(args.out_dir),
    )?;

    if args.site_dir {
        config.out_dir = config.out_dir.join(config.site_dir_name());
    }

    // A directory that cannot be created is the one fatal
    // configuration fault; nothing is crawled without it.
    info!("Creating directory: {}", config.out_dir.display());
    fs::create_dir_all(&config.out_dir)
        .await
        .map_err(|e| anyhow::anyhow!("Error creating output directory: {}", e))?;

    let crawler = Crawler::new(config, Duration::from_secs_f64(args.timeout))?;
    let summary = crawler.run().await?;

    info!(
        "Archiving complete: {} discovered, {} saved, {} failed",
        summary.discovered,
        summary.archived.to_string().green(),
        summary.failed
    );

    Ok(())
}

#[tokio::main]
async fn main() {
    // Set up logging with chromiumoxide errors suppressed
    let filter = EnvFilter::from_default_env()
        .add_directive("chromiumoxide::conn=off".parse().unwrap())
        .add_directive("chromiumoxide::handler=off".parse().unwrap())
        .add_directive("sitesnap=info".parse().unwrap());

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("{}", format!("Error: {}", e).red());
        process::exit(1);
    }
}
