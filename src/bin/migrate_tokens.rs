use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use counsel_edge::config;
use counsel_edge::crypto::TokenCipher;
use counsel_edge::db;
use counsel_edge::tokens::{load_token, migrate_plaintext_tokens};

#[derive(Debug, Parser)]
#[command(about = "Manage encrypted integration tokens.")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Encrypt every token still stored in clear text
    Migrate,
    /// Store a token for a provider and encrypt it right away
    Store {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        token: String,
    },
    /// Check that a provider's token decrypts with the configured key
    Check {
        #[arg(long)]
        provider: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let cipher = TokenCipher::new(&cfg.token_key_bytes()?)?;

    match args.command {
        Command::Migrate => {
            let migrated = migrate_plaintext_tokens(&pool, &cipher).await?;
            println!("encrypted {migrated} token(s)");
        }
        Command::Store { provider, token } => {
            db::upsert_plaintext_token(&pool, &provider, &token)
                .await
                .with_context(|| format!("failed to store token for {provider}"))?;
            migrate_plaintext_tokens(&pool, &cipher).await?;
            println!("stored encrypted token for {provider}");
        }
        Command::Check { provider } => match load_token(&pool, &cipher, &provider).await? {
            Some(token) => println!("{provider}: ok ({} chars)", token.chars().count()),
            None => println!("{provider}: no encrypted token stored"),
        },
    }
    Ok(())
}
