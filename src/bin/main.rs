use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coa_gateway::config::CorsModeSetting;
use coa_gateway::{AuthSettings, Settings, create_app};
use std::path::PathBuf;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "coa-gateway")]
#[command(about = "Authenticating, CORS-aware API gateway for the COA document processor")]
struct Cli {
    /// Settings file (defaults to $COA_CONFIG, then ./coa.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Bind address, e.g. 0.0.0.0:8000
        #[arg(long, env = "COA_BIND")]
        bind: Option<String>,
        /// Development mode: debug identity fallback and error text in 500s
        #[arg(long, env = "COA_DEBUG")]
        debug: bool,
        /// Expected token issuer
        #[arg(long, env = "COA_ISSUER")]
        issuer: Option<String>,
        /// Accepted token audience (repeatable)
        #[arg(long = "audience", env = "COA_AUDIENCE", value_delimiter = ',')]
        audiences: Vec<String>,
        /// JWKS endpoint URL for RS256 signature verification
        #[arg(long, env = "COA_JWKS_URL")]
        jwks_url: Option<String>,
        /// Azure AD tenant; with --client-id derives issuer, audiences and JWKS URL
        #[arg(long, env = "AZURE_TENANT_ID")]
        tenant_id: Option<String>,
        /// Azure AD application (client) id
        #[arg(long, env = "AZURE_CLIENT_ID")]
        client_id: Option<String>,
        /// Echo any request origin (emergency CORS mode)
        #[arg(long, env = "COA_CORS_PERMISSIVE")]
        cors_permissive: bool,
    },
    /// Load and validate settings, then print the effective configuration
    CheckConfig,
}

struct Overrides {
    bind: Option<String>,
    debug: bool,
    issuer: Option<String>,
    audiences: Vec<String>,
    jwks_url: Option<String>,
    tenant_id: Option<String>,
    client_id: Option<String>,
    cors_permissive: bool,
}

fn apply_overrides(settings: &mut Settings, overrides: Overrides) -> Result<()> {
    if let Some(bind) = overrides.bind {
        settings.server.bind = bind;
    }
    if overrides.debug {
        settings.debug = true;
    }
    if overrides.cors_permissive {
        settings.cors.mode = CorsModeSetting::Permissive;
    }

    if let (Some(tenant), Some(client)) = (&overrides.tenant_id, &overrides.client_id) {
        settings.auth = Some(AuthSettings::azure_ad(tenant, client));
    }

    let explicit = overrides.issuer.is_some()
        || overrides.jwks_url.is_some()
        || !overrides.audiences.is_empty();
    if explicit && settings.auth.is_none() {
        let issuer = overrides
            .issuer
            .clone()
            .context("--issuer is required when no auth settings are configured")?;
        let jwks_url = overrides
            .jwks_url
            .clone()
            .context("--jwks-url is required when no auth settings are configured")?;
        settings.auth = Some(AuthSettings::new(issuer, Vec::new(), jwks_url));
    }

    if let Some(auth) = settings.auth.as_mut() {
        if let Some(issuer) = overrides.issuer {
            auth.issuer = issuer;
        }
        if let Some(jwks_url) = overrides.jwks_url {
            auth.jwks_url = jwks_url;
        }
        if !overrides.audiences.is_empty() {
            auth.audiences = overrides.audiences;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("coa_gateway=info".parse()?)
                .add_directive("tower_http=info".parse()?),
        )
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref()).context("loading settings")?;

    match cli.command {
        Commands::Serve {
            bind,
            debug,
            issuer,
            audiences,
            jwks_url,
            tenant_id,
            client_id,
            cors_permissive,
        } => {
            apply_overrides(
                &mut settings,
                Overrides {
                    bind,
                    debug,
                    issuer,
                    audiences,
                    jwks_url,
                    tenant_id,
                    client_id,
                    cors_permissive,
                },
            )?;

            if settings.debug {
                warn!(
                    "Debug mode is ON: optional routes fall back to a synthetic identity and 500 responses include error text. Never enable this in production."
                );
            }
            if settings.cors.mode == CorsModeSetting::Permissive {
                warn!("Permissive CORS is ON: every request origin is echoed back");
            }
            match &settings.auth {
                Some(auth) => info!(
                    issuer = %auth.issuer,
                    audiences = ?auth.audiences,
                    jwks_url = %auth.jwks_url,
                    "Identity provider configured"
                ),
                None => warn!("No identity provider configured"),
            }

            let app = create_app(&settings).context("building application")?;

            if let (Some(jwks), Some(every)) = (&app.jwks, app.jwks_refresh_interval) {
                match jwks.refresh().await {
                    Ok(count) => info!("Loaded {} signing keys", count),
                    Err(e) => {
                        warn!("Initial signing-key fetch failed, will retry on demand: {}", e)
                    }
                }
                jwks.spawn_refresh_task(every);
            }

            let listener = tokio::net::TcpListener::bind(&settings.server.bind)
                .await
                .with_context(|| format!("binding {}", settings.server.bind))?;
            info!(
                "Server listening on http://{} (api prefix `{}`)",
                settings.server.bind, settings.server.api_prefix
            );

            axum::serve(listener, app.router)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }
        Commands::CheckConfig => {
            settings.validate()?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
