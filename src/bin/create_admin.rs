use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use counsel_edge::auth::issue_token;
use counsel_edge::config;
use counsel_edge::db;
use counsel_edge::model::UserRole;

const MAX_TTL_HOURS: u64 = 24 * 365 * 10;

#[derive(Debug, Parser)]
#[command(about = "Create (or reuse) a user, grant the admin role and print a fresh bearer token.")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Email address of the administrator
    #[arg(long)]
    email: String,

    /// Display name stored with the user
    #[arg(long)]
    name: Option<String>,

    /// Token lifetime in hours; defaults to session.token_ttl_hours
    #[arg(long)]
    ttl_hours: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let user_id = db::create_user(&pool, &args.email, args.name.as_deref())
        .await
        .with_context(|| format!("failed to create user {}", args.email))?;
    db::grant_role(&pool, user_id, UserRole::Admin).await?;

    let hours = args
        .ttl_hours
        .unwrap_or(cfg.session.token_ttl_hours)
        .min(MAX_TTL_HOURS);
    let ttl = chrono::Duration::hours(hours as i64);
    let issued = issue_token(&pool, user_id, ttl).await?;

    println!("user_id:    {user_id}");
    println!("expires_at: {}", issued.expires_at.to_rfc3339());
    println!("token:      {}", issued.token);
    Ok(())
}
