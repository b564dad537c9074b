use std::collections::BTreeMap;

use clap::Parser;
use serde_json::json;
use threadsearch::{
    ConfigDb,
    DataDir,
    ResultCache,
    SearchEngine,
    Settings,
    VectorDb,
    cli::{AskArgs, CacheAction, Cli, Command, ConfigAction, IngestArgs, SearchArgs},
    embedder::ColbertEmbedder,
    error::{self, Error},
    generation::{self, ChatClient},
    ingestion,
    mcp,
    model_manager::{self, ModelManager},
    search::{self, ResultSource, SearchRequest},
    settings,
};
use tracing_subscriber::EnvFilter;

const LOG_ENV_VAR: &str = "THREADSEARCH_LOG";

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var(LOG_ENV_VAR) {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> error::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let config_db = ConfigDb::open(&data_dir.config_db())?;
    let settings = Settings::resolve(&cli.overrides(), &config_db)?;

    match cli.command {
        Command::Ingest(args) => cmd_ingest(&data_dir, &settings, &args)?,
        Command::Search(args) => cmd_search(&data_dir, &settings, &args)?,
        Command::Ask(args) => cmd_ask(&data_dir, &settings, &args)?,
        Command::Status(args) => cmd_status(&data_dir, &settings, args.json)?,
        Command::Cache { action } => match action {
            CacheAction::Stats { json } => {
                let cache = ResultCache::open(&data_dir.cache_file())?;
                if json {
                    println!(
                        "{}",
                        json!({
                            "path": cache.path(),
                            "entries": cache.len(),
                        })
                    );
                } else {
                    println!("Cache file: {}", cache.path().display());
                    println!("Entries: {}", cache.len());
                }
            }
            CacheAction::Clear => cache_clear(&data_dir)?,
            CacheAction::Forget {
                query,
                top_k,
                thread,
            } => {
                let cache = ResultCache::open(&data_dir.cache_file())?;
                let fingerprint = SearchRequest::new(query.as_str())
                    .top_k(top_k)
                    .thread(thread)
                    .fingerprint();
                if cache.remove(fingerprint.as_str())? {
                    println!("Removed cached results for {query:?}");
                } else {
                    println!("No cached results for {query:?}");
                }
            }
        },
        Command::Config { action } => match action {
            ConfigAction::Show { json } => config_show(&config_db, &settings, json)?,
            ConfigAction::Set { key, value } => {
                settings::validate_setting(&key, &value)?;
                config_db.set_setting(&key, value.trim())?;
                println!("Set {key} = {}", value.trim());
            }
            ConfigAction::Unset { key } => {
                if config_db.remove_setting(&key)? {
                    println!("Removed {key}");
                } else {
                    return Err(Error::NotFound {
                        kind: "setting",
                        name: key,
                    });
                }
            }
        },
        Command::Mcp => mcp::run_mcp(data_dir, settings)?,
        Command::Completions(_) => {}
    }

    Ok(())
}

fn cache_clear(data_dir: &DataDir) -> error::Result<()> {
    match ResultCache::open(&data_dir.cache_file()) {
        Ok(cache) => {
            let removed = cache.clear()?;
            println!("Removed {removed} cached result(s)");
        }
        Err(Error::CacheCorrupt { path, source }) => {
            tracing::warn!(path = %path.display(), error = %source, "deleting corrupt cache file");
            std::fs::remove_file(&path)?;
            println!("Removed corrupt cache file {}", path.display());
        }
        Err(e) => return Err(e),
    }
    Ok(())
}

fn cmd_ingest(
    data_dir: &DataDir,
    settings: &Settings,
    args: &IngestArgs,
) -> error::Result<()> {
    let records = ingestion::read_jsonl(&args.path)?;
    eprintln!("Read {} emails from {}", records.len(), args.path.display());

    let vectors = VectorDb::open(&data_dir.vectors_db())?;
    let collection = vectors.get_or_create_collection(&settings.collection)?;
    let model = model_manager::shared(ModelManager::new(settings.model.clone()));
    let embedder = ColbertEmbedder::new(model);

    let stats =
        ingestion::ingest_emails(&records, &embedder, &collection, args.batch_size)?;

    if stats.added > 0 {
        let cache = ResultCache::open(&data_dir.cache_file())?;
        let dropped = cache.clear()?;
        tracing::info!(dropped, "cleared result cache after ingestion");
    }

    println!(
        "Added {} chunks to '{}' ({} already stored, {} emails without usable text)",
        stats.added,
        collection.name(),
        stats.existing,
        stats.empty
    );
    Ok(())
}

fn cmd_search(
    data_dir: &DataDir,
    settings: &Settings,
    args: &SearchArgs,
) -> error::Result<()> {
    let engine = SearchEngine::open(data_dir, settings)?;
    let request = SearchRequest::new(args.query.as_str())
        .top_k(args.top_k)
        .thread(args.thread);
    let outcome = engine.execute(&request)?;

    if args.json {
        let value = json!({
            "query": args.query,
            "source": outcome.source,
            "results": outcome.results,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        search::format_human(&outcome.results);
        if outcome.source == ResultSource::Cache {
            println!("(cached)");
        }
    }
    Ok(())
}

fn cmd_ask(
    data_dir: &DataDir,
    settings: &Settings,
    args: &AskArgs,
) -> error::Result<()> {
    let chat = ChatClient::from_settings(settings)?;
    let engine = SearchEngine::open(data_dir, settings)?;
    let request = SearchRequest::new(args.query.as_str())
        .top_k(args.top_k)
        .thread(args.thread);
    let results = engine.execute(&request)?.results;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Config(format!("failed to start tokio runtime: {e}")))?;
    let answer = runtime.block_on(generation::generate_answer(
        &chat,
        &args.query,
        &results,
    ));

    println!("{answer}");
    if args.sources {
        println!();
        search::format_human(&results);
    }
    Ok(())
}

fn cmd_status(
    data_dir: &DataDir,
    settings: &Settings,
    json: bool,
) -> error::Result<()> {
    let vectors = VectorDb::open(&data_dir.vectors_db())?;
    let chunks = vectors
        .get_or_create_collection(&settings.collection)?
        .count()?;
    let cached = ResultCache::open(&data_dir.cache_file())?.len();

    if json {
        println!(
            "{}",
            json!({
                "data_dir": data_dir.root(),
                "model": settings.model,
                "collection": settings.collection,
                "chunks": chunks,
                "cached_queries": cached,
            })
        );
    } else {
        println!("Data directory: {}", data_dir.root().display());
        println!("Model: {}", settings.model);
        println!("Collection: {}", settings.collection);
        println!("Chunks: {chunks}");
        println!("Cached queries: {cached}");
    }
    Ok(())
}

fn config_show(
    config_db: &ConfigDb,
    settings: &Settings,
    json: bool,
) -> error::Result<()> {
    let stored = config_db.list_settings()?;
    let api_key = if settings.api_key.is_some() {
        "set"
    } else {
        "unset"
    };
    let timeout = settings.request_timeout.as_secs();

    if json {
        let stored_map: BTreeMap<String, String> = stored.into_iter().collect();
        println!(
            "{}",
            json!({
                "model": settings.model,
                "collection": settings.collection,
                "llm_model": settings.llm_model,
                "llm_base_url": settings.llm_base_url,
                "request_timeout_secs": timeout,
                "api_key": api_key,
                "stored": stored_map,
            })
        );
    } else {
        println!("{}: {}", settings::KEY_MODEL, settings.model);
        println!("{}: {}", settings::KEY_COLLECTION, settings.collection);
        println!("{}: {}", settings::KEY_LLM_MODEL, settings.llm_model);
        println!("{}: {}", settings::KEY_LLM_BASE_URL, settings.llm_base_url);
        println!("{}: {timeout}", settings::KEY_REQUEST_TIMEOUT);
        println!("api_key: {api_key}");
        if !stored.is_empty() {
            println!("\nStored in config.redb:");
            for (key, value) in &stored {
                println!("  {key} = {value}");
            }
        }
    }
    Ok(())
}
