use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use counsel_edge::config;
use counsel_edge::db;
use counsel_edge::feeds::{load_index, render_rss, render_sitemap};

#[derive(Debug, Parser)]
#[command(about = "Render sitemap.xml and rss.xml to a directory for static hosting.")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output directory
    #[arg(long, default_value = "public")]
    out: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let index = load_index(&pool, &cfg.site).await?;
    let now = Utc::now();
    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;

    let sitemap_path = args.out.join("sitemap.xml");
    fs::write(&sitemap_path, render_sitemap(&cfg.site.base_url, &index, now.date_naive()))
        .with_context(|| format!("failed to write {}", sitemap_path.display()))?;
    let rss_path = args.out.join("rss.xml");
    fs::write(&rss_path, render_rss(&cfg.site, &index, now))
        .with_context(|| format!("failed to write {}", rss_path.display()))?;

    println!(
        "wrote {} entries ({} articles, {} pages) to {}",
        index.len(),
        index.articles.len(),
        index.pages.len(),
        args.out.display()
    );
    Ok(())
}
