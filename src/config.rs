use anyhow::{Context, Result};
use clap::Parser;
use std::{env, time::Duration};
use uuid::Uuid;

/// Longest presigned URL lifetime accepted, matching S3's seven-day cap.
pub const MAX_PRESIGN_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Base URL clients use to reach this process; presigned URLs start with it.
    pub public_url: String,
    pub signing_secret: String,
    pub presign_ttl: Duration,
    /// Age after which an open upload session is reported as stale.
    pub stale_after: Duration,
}

// Hand-written so the signing secret never ends up in logs.
impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("storage_dir", &self.storage_dir)
            .field("database_url", &self.database_url)
            .field("public_url", &self.public_url)
            .field("signing_secret", &"<redacted>")
            .field("presign_ttl", &self.presign_ttl)
            .field("stale_after", &self.stale_after)
            .finish()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Chunked upload orchestration for video trees")]
pub struct Args {
    /// Host to bind to (overrides VIDEO_TREE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides VIDEO_TREE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides VIDEO_TREE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides VIDEO_TREE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Public base URL for presigned links (overrides VIDEO_TREE_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// Lifetime of presigned URLs in seconds (overrides VIDEO_TREE_PRESIGN_TTL_SECS)
    #[arg(long)]
    pub presign_ttl_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::merge(args, |name| env::var(name).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI overrides over the environment (looked up through `env`)
    /// and built-in defaults.
    pub fn merge(args: Args, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = env("VIDEO_TREE_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = parse_var(&env, "VIDEO_TREE_PORT", 3000)?;
        let env_storage = env("VIDEO_TREE_STORAGE_DIR").unwrap_or_else(|| "./data/objects".into());
        let env_db = env("VIDEO_TREE_DATABASE_URL")
            .unwrap_or_else(|| "sqlite://./data/meta/video_tree.db".into());
        let env_ttl = parse_var(&env, "VIDEO_TREE_PRESIGN_TTL_SECS", 900)?;
        let stale_after_secs = parse_var(&env, "VIDEO_TREE_STALE_AFTER_SECS", 86_400)?;

        let signing_secret = match env("VIDEO_TREE_SIGNING_SECRET").filter(|s| !s.is_empty()) {
            Some(secret) => secret,
            None => {
                tracing::warn!(
                    "VIDEO_TREE_SIGNING_SECRET is not set; presigned URLs will not survive a restart"
                );
                format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
            }
        };

        // --- Merge ---
        let port = args.port.unwrap_or(env_port);
        let public_url = args
            .public_url
            .or_else(|| env("VIDEO_TREE_PUBLIC_URL"))
            .unwrap_or_else(|| format!("http://127.0.0.1:{port}"));

        let presign_ttl_secs = args.presign_ttl_secs.unwrap_or(env_ttl);
        if !(1..=MAX_PRESIGN_TTL_SECS).contains(&presign_ttl_secs) {
            anyhow::bail!(
                "presign TTL must be between 1 and {MAX_PRESIGN_TTL_SECS} seconds, got {presign_ttl_secs}"
            );
        }

        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port,
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            public_url: public_url.trim_end_matches('/').to_string(),
            signing_secret,
            presign_ttl: Duration::from_secs(presign_ttl_secs),
            stale_after: Duration::from_secs(stale_after_secs),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T>(env: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env(name) {
        Some(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        None => Ok(default),
    }
}
