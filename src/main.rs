use std::{net::SocketAddr, path::Path, sync::Arc};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use waypoint::{
    adapters::{HttpClientAdapter, HttpHandler, MemoryCacheStore, RedisCacheStore},
    config::{CacheBackend, GatewayConfig, GatewayConfigValidator, loader::load_config},
    core::{CircuitBreakerRegistry, Forwarder, ResponseCache, ServiceRegistry, VersionNegotiator},
    metrics,
    ports::{cache_store::CacheStore, http_client::HttpClient},
    tracing_setup,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "waypoint.toml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "waypoint.toml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "waypoint.toml")]
        config: String,
    },
    /// Start the gateway server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "waypoint.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config).await,
        None => serve(&args.config).await,
    }
}

async fn connect_store(config: &GatewayConfig) -> Result<Arc<dyn CacheStore>> {
    match config.cache.store {
        CacheBackend::Memory => Ok(Arc::new(MemoryCacheStore::new())),
        CacheBackend::Redis => {
            let url = config
                .cache
                .redis_url
                .as_deref()
                .ok_or_else(|| eyre!("cache.redis_url is required for the redis store"))?;
            let store = RedisCacheStore::connect(url)
                .await
                .context("Failed to connect the Redis cache store")?;
            store
                .ping()
                .await
                .context("Redis cache store did not answer PING")?;
            Ok(Arc::new(store))
        }
    }
}

async fn serve(config_path: &str) -> Result<()> {
    let config = load_config(config_path)
        .await
        .with_context(|| format!("Failed to load config from {config_path}"))?;
    GatewayConfigValidator::validate(&config)
        .map_err(|e| eyre!("Invalid configuration in {config_path}: {e}"))?;

    tracing_setup::init_from_config(&config.logging)
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;
    metrics::init_metrics().map_err(|e| eyre!("Failed to initialize metrics: {}", e))?;

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("Failed to parse listen address")?;

    let store = connect_store(&config).await?;
    let cache = ResponseCache::new(store, &config.cache);

    let http_client: Arc<dyn HttpClient> =
        Arc::new(HttpClientAdapter::new().context("Failed to create HTTP client adapter")?);

    let registry = Arc::new(
        ServiceRegistry::from_config(&config, http_client.clone(), cache.clone())
            .await
            .context("Failed to register configured services")?,
    );
    let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker));
    let forwarder = Arc::new(Forwarder::new(
        registry.clone(),
        breakers,
        http_client,
        &config.proxy,
    ));
    let negotiator = Arc::new(
        VersionNegotiator::new(config.versioning.clone())
            .map_err(|e| eyre!("Invalid versioning configuration: {e}"))?,
    );

    for service in registry.list_services().await {
        tracing::info!("Registered service: {} -> {}", service.name, service.base_url);
    }

    let app = HttpHandler::new(forwarder, cache, negotiator)
        .with_version_requirements(&config)
        .router();

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    tracing::info!(
        "Waypoint API Gateway starting on {} ({} services, cache: {:?})",
        addr,
        registry.len(),
        config.cache.store
    );

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    registry.shutdown().await;
    tracing::info!("Final service health: {:?}", metrics::get_current_metrics());
    tracing::info!("Graceful shutdown completed");

    server_result
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
    }
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    match GatewayConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!("   • Services: {}", config.services.len());
            println!("   • Health Checks: {}", config.health_check.enabled);
            println!("   • Cache Store: {:?}", config.cache.store);
            println!(
                "   • Versioning: default v{}, strategies {:?}",
                config.versioning.default_version, config.versioning.strategies
            );
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Ensure all service URLs start with http:// or https://");
            println!("   • Verify listen address format (e.g., '127.0.0.1:3000')");
            println!("   • Use numeric versions such as '1', 'v2' or '2.1'");
            println!("   • Set cache.redis_url when cache.store = \"redis\"");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Waypoint API Gateway Configuration

# The address to listen on
listen_addr = "127.0.0.1:8080"

[[services]]
name = "user-service"
url = "http://localhost:3001"
health_path = "/health"
health_check_interval_secs = 30

[[services]]
name = "order-service"
url = "http://localhost:3002"
versions = ["1", "2"]

[health_check]
enabled = true
timeout_secs = 5
address_cache_ttl_secs = 60

[circuit_breaker]
failure_threshold = 5
reset_timeout_secs = 60

[proxy]
default_timeout_ms = 30000

[versioning]
strategies = ["uri", "header", "query", "media_type"]
header = "X-API-Version"
default_version = "1"
supported_versions = ["1", "2"]

# [[versioning.deprecated]]
# version = "1"
# removal_date = "2027-01-01T00:00:00Z"
# migration_guide = "https://docs.example.com/migrate-to-v2"

[cache]
store = "memory"
# store = "redis"
# redis_url = "redis://127.0.0.1:6379"
default_ttl_secs = 300

[logging]
level = "info"
json = true
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'waypoint serve --config {config_path}' to start the server");
    Ok(())
}
