// Graphdesk - interactive client for a schema-served graph editing backend

use clap::Parser;
use tracing::warn;

use graphdesk::api::auth::SessionStore;
use graphdesk::api::ApiClient;
use graphdesk::cache::SummaryCache;
use graphdesk::config::Config;
use graphdesk::service::DeskService;
use graphdesk::shell::Shell;

/// Browse and edit entities of a graph database server from the
/// terminal, driven entirely by the schema the server provides.
#[derive(Debug, Parser)]
#[command(name = "graphdesk", version, about)]
struct Cli {
    /// Server root URL (overrides SERVER_URL)
    #[arg(long)]
    server: Option<String>,

    /// Summary cache path (overrides CACHE_PATH)
    #[arg(long)]
    cache: Option<String>,

    /// Session file path (overrides SESSION_FILE)
    #[arg(long)]
    session: Option<String>,

    /// Page to open on start, e.g. /entity/person/
    #[arg(long)]
    route: Option<String>,

    /// Prefetch the list cache for every listable type
    #[arg(long)]
    warm: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    // Load configuration, command line flags winning over environment
    let mut config = Config::from_env()?;
    if let Some(server) = cli.server {
        config.server.url = server;
    }
    if let Some(cache) = cli.cache {
        config.cache.path = cache;
    }
    if let Some(session) = cli.session {
        config.shell.session_file = session;
    }

    let store = SessionStore::new(&config.shell.session_file);
    let api = ApiClient::new(&config.server, store)?;

    println!("Fetching schema from {} ...", config.server.url);
    let schema = api.fetch_schema().await?;
    if let Err(problems) = schema.validate() {
        for problem in problems {
            warn!("schema: {}", problem);
        }
    }
    println!("Loaded {} entity types.", schema.len());

    let cache = SummaryCache::open(&config.cache.path).await?;
    let service = DeskService::new(api, cache, schema, config.cache.autocomplete_capacity);

    if cli.warm {
        let warmed = service.warm_up().await;
        println!("Warmed list caches for {} types.", warmed);
    }

    let mut shell = Shell::new(service, config.shell.max_inline_depth);
    if let Some(route) = cli.route {
        let reply = shell.handle_line(&format!("go {}", route)).await;
        if !reply.output.is_empty() {
            println!("{}", reply.output.trim_end());
        }
    }
    shell.run().await?;

    Ok(())
}
