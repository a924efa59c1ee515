//! CLI argument parsing and command handlers

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::CacheStore;
use crate::config::AppConfig;
use crate::coordinator::CacheCoordinator;
use crate::elaborate::report;
use crate::elaborate::{ElaborationOverrides, ElaborationSettings, LlmElaborator};
use crate::formatter::OutputFormatter;
use crate::mcp::McpServer;
use crate::models::{CacheMode, CacheNamespace, CacheStats, Finding, Match, Query};
use crate::output;

/// scopecache: pattern search and LLM elaboration with a fingerprinted result cache
#[derive(Parser, Debug)]
#[command(
    name = "scache",
    version,
    about = "Search code trees and explain matches, with results cached per file state",
    long_about = "scache searches files for literal or regex patterns and can ask an LLM to explain \
                  individual matches. Results are cached against the size and modification time of \
                  every file in scope, so repeated and narrowed searches over unchanged files are \
                  served from the cache."
)]
pub struct Cli {
    /// Enable verbose logging (can be repeated for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (default: $SCOPECACHE_CONFIG, then the platform config dir)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Cache flags shared by every command that searches or elaborates
#[derive(Args, Debug, Clone, Default)]
pub struct CacheArgs {
    /// Cache directory
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Days before a cached result expires (0 = always recompute)
    #[arg(long, value_name = "DAYS")]
    pub ttl_days: Option<u64>,

    /// Size the cache is evicted down to, in megabytes
    #[arg(long, value_name = "MB")]
    pub size_limit_mb: Option<u64>,

    /// Bypass the cache for this run without touching stored entries
    #[arg(long)]
    pub no_cache: bool,

    /// Delete every cached entry before running
    #[arg(long)]
    pub clear_cache: bool,
}

impl CacheArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(dir) = &self.cache_dir {
            config.cache.dir = Some(dir.clone());
        }
        if let Some(days) = self.ttl_days {
            config.cache.ttl_days = days;
        }
        if let Some(mb) = self.size_limit_mb {
            config.cache.size_limit_mb = mb;
        }
    }

    /// Coordinator for this run. A store that cannot be opened leaves the run uncached.
    fn coordinator(&self, config: &AppConfig) -> Result<CacheCoordinator> {
        let mut coordinator = CacheCoordinator::open(config.cache_dir(), config.cache_limits())
            .with_budget(config.search_budget());

        if coordinator.store().is_none() && !self.no_cache {
            output::warn("Cache unavailable, results will not be stored for this run.");
        }

        if self.clear_cache {
            let removed = coordinator.clear_cache(None).context("Failed to clear cache")?;
            log::info!("Cleared {} cache entries before running", removed);
        }
        if self.no_cache {
            coordinator.set_cache_mode(CacheMode::Disabled);
        }
        Ok(coordinator)
    }
}

/// Model and credential flags for elaboration
#[derive(Args, Debug, Clone, Default)]
pub struct ElaborationArgs {
    /// Model as provider/model (e.g. openai/gpt-4o-mini); a bare name uses gemini
    #[arg(long)]
    pub model: Option<String>,

    /// API key for the provider (default: config file, then {PROVIDER}_API_KEY)
    #[arg(long)]
    pub api_key: Option<String>,

    /// Base URL for an OpenAI-compatible or self-hosted endpoint
    #[arg(long)]
    pub api_base: Option<String>,

    /// Lines of source on each side of the finding sent to the model
    #[arg(long, value_name = "N")]
    pub context_window: Option<usize>,

    /// Seconds to wait for the model (0 = no limit)
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

impl ElaborationArgs {
    fn settings(&self, config: &AppConfig) -> ElaborationSettings {
        let overrides = ElaborationOverrides {
            model: self.model.clone(),
            api_key: self.api_key.clone(),
            api_base: self.api_base.clone(),
            context_window_lines: self.context_window,
            timeout_secs: self.timeout,
        };
        ElaborationSettings::resolve(&overrides, config)
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Search files for a pattern
    ///
    /// Examples:
    ///   scache search "TODO" src/
    ///   scache search -r "fn \w+_test" . --exclude-dirs target
    ///   scache search "unsafe" src --output report.json
    Search {
        /// Text or regular expression to find
        pattern: String,

        /// Files or directories to search
        #[arg(required = true, value_name = "PATHS")]
        paths: Vec<PathBuf>,

        /// Treat the pattern as a regular expression
        #[arg(short, long)]
        regex: bool,

        /// Match case exactly
        #[arg(short = 'c', long)]
        case_sensitive: bool,

        /// Lines of context on each side of a match
        #[arg(short = 'C', long, value_name = "N")]
        context: Option<usize>,

        /// Extra directory globs to skip (comma-separated)
        #[arg(long, value_delimiter = ',')]
        exclude_dirs: Vec<String>,

        /// Extra file globs to skip (comma-separated)
        #[arg(long, value_delimiter = ',')]
        exclude_files: Vec<String>,

        /// Search dot-files and dot-directories
        #[arg(long)]
        include_hidden: bool,

        /// Ask the model to explain every match
        #[arg(short, long)]
        elaborate: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,

        /// Pretty-print JSON output (only with --json)
        #[arg(long)]
        pretty: bool,

        /// Also write the matches to a JSON report file
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Plain text output (no colors)
        #[arg(long)]
        plain: bool,

        #[command(flatten)]
        elaboration: ElaborationArgs,

        #[command(flatten)]
        cache: CacheArgs,
    },

    /// Explain one finding from a report written by `search --output`
    ///
    /// Examples:
    ///   scache elaborate --report report.json --finding 0
    ///   scache elaborate --report report.json --finding 3 --model openai/gpt-4o-mini
    Elaborate {
        /// Report file
        #[arg(long, value_name = "FILE")]
        report: PathBuf,

        /// 0-based index of the finding in the report
        #[arg(long, value_name = "N")]
        finding: usize,

        /// Output as JSON
        #[arg(long)]
        json: bool,

        /// Plain text output (no colors)
        #[arg(long)]
        plain: bool,

        #[command(flatten)]
        elaboration: ElaborationArgs,

        #[command(flatten)]
        cache: CacheArgs,
    },

    /// Inspect or maintain the cache
    Cache {
        /// Cache directory
        #[arg(long, value_name = "DIR", global = true)]
        cache_dir: Option<PathBuf>,

        #[command(subcommand)]
        command: CacheCommand,
    },

    /// Start the MCP server on stdio
    Mcp {
        #[command(flatten)]
        elaboration: ElaborationArgs,

        #[command(flatten)]
        cache: CacheArgs,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// Show entries and size per namespace
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,

        /// Pretty-print JSON output (only with --json)
        #[arg(long)]
        pretty: bool,
    },

    /// Delete cached entries
    Clear {
        /// Only clear this namespace (search or elaborate)
        #[arg(long)]
        namespace: Option<CacheNamespace>,

        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Delete expired entries
    Sweep,
}

impl Cli {
    /// Execute the CLI command
    pub fn execute(self) -> Result<()> {
        let log_level = match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

        let mut config = AppConfig::load(self.config.as_deref())?;

        match self.command {
            Command::Search {
                pattern,
                paths,
                regex,
                case_sensitive,
                context,
                exclude_dirs,
                exclude_files,
                include_hidden,
                elaborate,
                json,
                pretty,
                output,
                plain,
                elaboration,
                cache,
            } => {
                cache.apply(&mut config);
                let mut options = config.query_options();
                options.is_regex = regex;
                options.case_sensitive = case_sensitive;
                if let Some(n) = context {
                    options.context_lines = n;
                }
                options.exclude_dirs.extend(exclude_dirs);
                options.exclude_files.extend(exclude_files);
                options.include_hidden |= include_hidden;

                let query = Query::new(pattern, &paths, options);
                let display = SearchDisplay { json, pretty, plain, output };
                let settings = elaborate.then(|| elaboration.settings(&config));
                handle_search(&query, &display, settings, &cache, &config)
            }
            Command::Elaborate {
                report,
                finding,
                json,
                plain,
                elaboration,
                cache,
            } => {
                cache.apply(&mut config);
                let settings = elaboration.settings(&config);
                handle_elaborate(&report, finding, json, plain, &settings, &cache, &config)
            }
            Command::Cache { cache_dir, command } => {
                if let Some(dir) = cache_dir {
                    config.cache.dir = Some(dir);
                }
                match command {
                    CacheCommand::Stats { json, pretty } => handle_cache_stats(&config, json, pretty),
                    CacheCommand::Clear { namespace, yes } => handle_cache_clear(&config, namespace, yes),
                    CacheCommand::Sweep => handle_cache_sweep(&config),
                }
            }
            Command::Mcp { elaboration, cache } => {
                cache.apply(&mut config);
                handle_mcp(&elaboration.settings(&config), &cache, &config)
            }
        }
    }
}

struct SearchDisplay {
    json: bool,
    pretty: bool,
    plain: bool,
    output: Option<PathBuf>,
}

/// A match with its explanation, for `search --elaborate --json`
#[derive(Serialize)]
struct ElaboratedMatch<'a> {
    #[serde(flatten)]
    found: &'a Match,
    #[serde(skip_serializing_if = "Option::is_none")]
    elaboration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    elaboration_error: Option<String>,
}

fn handle_search(
    query: &Query,
    display: &SearchDisplay,
    settings: Option<ElaborationSettings>,
    cache: &CacheArgs,
    config: &AppConfig,
) -> Result<()> {
    log::info!("Searching for '{}' in {} path(s)", query.pattern(), query.paths().len());

    // A bad pattern must fail before --clear-cache touches the store
    CacheCoordinator::validate(query)?;
    let coordinator = cache.coordinator(config)?;
    let outcome = coordinator.search_with_outcome(query)?;
    log::info!("Search returned {} matches ({:?})", outcome.value.len(), outcome.source);
    let matches = outcome.value;

    if let Some(path) = &display.output {
        report::write_report(path, &matches)?;
    }

    let elaborations = match settings {
        Some(settings) if !matches.is_empty() => {
            Some(elaborate_all(&coordinator, &matches, &settings, !display.json)?)
        }
        _ => None,
    };

    close_quietly(&coordinator);

    if display.json {
        let json_output = match &elaborations {
            Some(results) => {
                let rows: Vec<ElaboratedMatch> = matches
                    .iter()
                    .zip(results)
                    .map(|(found, result)| ElaboratedMatch {
                        found,
                        elaboration: result.as_ref().ok().cloned(),
                        elaboration_error: result.as_ref().err().cloned(),
                    })
                    .collect();
                to_json(&rows, display.pretty)?
            }
            None => to_json(&matches, display.pretty)?,
        };
        println!("{}", json_output);
        return Ok(());
    }

    let formatter = OutputFormatter::new(display.plain);
    formatter.print_matches(&matches)?;

    if let Some(results) = elaborations {
        for (found, result) in matches.iter().zip(results) {
            let target = format!("{}:{}", found.file_path, found.line_number);
            match result {
                Ok(text) => {
                    println!();
                    formatter.print_elaboration(&target, &text);
                }
                Err(message) => output::warn(&format!("Could not elaborate {}: {}", target, message)),
            }
        }
    }

    Ok(())
}

/// Elaborate every match in order. One failure does not stop the rest.
fn elaborate_all(
    coordinator: &CacheCoordinator,
    matches: &[Match],
    settings: &ElaborationSettings,
    show_progress: bool,
) -> Result<Vec<std::result::Result<String, String>>> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
    let elaborator = LlmElaborator::new(settings.api_key.clone());

    let spinner = output::spinner(format!("Elaborating {} match(es)", matches.len()), show_progress);
    let results = runtime.block_on(async {
        let mut results = Vec::with_capacity(matches.len());
        for (idx, found) in matches.iter().enumerate() {
            spinner.set_message(format!("Elaborating match {}/{}", idx + 1, matches.len()));
            let finding = Finding::from(found);
            let result = coordinator
                .elaborate(
                    &finding,
                    settings.context_window_lines,
                    &settings.params,
                    &elaborator,
                    settings.timeout,
                )
                .await
                .map_err(|e| e.to_string());
            results.push(result);
        }
        results
    });
    spinner.finish_and_clear();

    Ok(results)
}

fn handle_elaborate(
    report_path: &Path,
    index: usize,
    json: bool,
    plain: bool,
    settings: &ElaborationSettings,
    cache: &CacheArgs,
    config: &AppConfig,
) -> Result<()> {
    let finding = report::finding_at(report_path, index)?;
    let target = format!("{}:{}", finding.file_path, finding.line_number);
    log::info!("Elaborating finding {} ({})", index, target);

    let coordinator = cache.coordinator(config)?;
    let runtime = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
    let elaborator = LlmElaborator::new(settings.api_key.clone());

    let spinner = output::spinner(format!("Elaborating {}", target), !json);
    let result = runtime.block_on(coordinator.elaborate_with_outcome(
        &finding,
        settings.context_window_lines,
        &settings.params,
        &elaborator,
        settings.timeout,
    ));
    spinner.finish_and_clear();
    close_quietly(&coordinator);

    let outcome = result?;
    log::info!("Elaboration for {} ({:?})", target, outcome.source);

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "file_path": finding.file_path,
                "line_number": finding.line_number,
                "elaboration": outcome.value,
            }))?
        );
    } else {
        OutputFormatter::new(plain).print_elaboration(&target, &outcome.value);
    }
    Ok(())
}

fn open_store(config: &AppConfig) -> Result<CacheStore> {
    let dir = config.cache_dir();
    CacheStore::open(&dir, config.cache_limits())
        .with_context(|| format!("Failed to open cache at {}", dir.display()))
}

fn handle_cache_stats(config: &AppConfig, as_json: bool, pretty_json: bool) -> Result<()> {
    let store = open_store(config)?;
    let stats = store.stats()?;
    close_quietly_store(&store);

    if as_json {
        println!("{}", to_json(&stats, pretty_json)?);
        return Ok(());
    }

    print!("{}", render_stats(&stats));
    Ok(())
}

fn render_stats(stats: &CacheStats) -> String {
    let mut out = String::new();
    out.push_str("scopecache statistics\n");
    out.push_str("=====================\n");
    out.push_str(&format!("Location:       {}\n", stats.cache_dir));
    for ns in &stats.namespaces {
        out.push_str(&format!(
            "{:<15} {} entries, {}\n",
            format!("{}:", ns.namespace),
            ns.entries,
            output::format_bytes(ns.bytes)
        ));
    }
    out.push_str(&format!(
        "Total:          {} entries, {} of {}\n",
        stats.total_entries,
        output::format_bytes(stats.total_bytes),
        output::format_bytes(stats.size_limit_bytes)
    ));
    out.push_str(&format!("Expired:        {}\n", stats.expired_entries));
    out
}

fn handle_cache_clear(config: &AppConfig, namespace: Option<CacheNamespace>, skip_confirm: bool) -> Result<()> {
    let dir = config.cache_dir();
    if !dir.join(crate::cache::CACHE_DB).exists() {
        println!("No cache to clear.");
        return Ok(());
    }

    if !skip_confirm {
        use std::io::{self, Write};

        let what = namespace.map(|ns| format!("{} entries", ns)).unwrap_or_else(|| "all entries".into());
        println!("This will delete {} in the cache at: {}", what, dir.display());
        print!("Are you sure? [y/N] ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    let store = open_store(config)?;
    let removed = store.clear(namespace)?;
    close_quietly_store(&store);
    println!("Removed {} cache entries.", removed);
    Ok(())
}

fn handle_cache_sweep(config: &AppConfig) -> Result<()> {
    let store = open_store(config)?;
    // open() already swept; a second pass catches entries that expired since
    let removed = store.sweep_expired()?;
    close_quietly_store(&store);
    println!("Removed {} expired entries.", removed);
    Ok(())
}

fn handle_mcp(settings: &ElaborationSettings, cache: &CacheArgs, config: &AppConfig) -> Result<()> {
    let coordinator = cache.coordinator(config)?;
    let server = McpServer::new(
        coordinator,
        config.query_options(),
        settings.clone(),
        Arc::new(LlmElaborator::new(settings.api_key.clone())),
    )?;
    server.run()
}

fn to_json<T: Serialize + ?Sized>(value: &T, pretty: bool) -> Result<String> {
    Ok(if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    })
}

fn close_quietly(coordinator: &CacheCoordinator) {
    if let Err(e) = coordinator.close() {
        log::warn!("Failed to close cache store: {}", e);
    }
}

fn close_quietly_store(store: &CacheStore) {
    if let Err(e) = store.close() {
        log::warn!("Failed to close cache store: {}", e);
    }
}
