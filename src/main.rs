use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use logscope_logs::{LogItem, ProgressReporter};
use logscope_session::{
    FileConfigStorage, IN_MEMORY_STORAGE_ID, ImportSource, LogSession, PageRequest,
};

mod config;

use config::AppConfig;

/// Logscope - import structured log files into a session and query them
#[derive(Parser, Debug)]
#[command(name = "logscope")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Session directory
    #[arg(value_name = "SESSION_DIR")]
    session_dir: PathBuf,

    /// Create the session if the directory does not hold one
    #[arg(long)]
    new: bool,

    /// Add an import source: a file name glob, relative to the session directory
    #[arg(long = "source", value_name = "GLOB")]
    sources: Vec<String>,

    /// Importer profile for sources added with --source
    #[arg(long, default_value = "CLEF")]
    profile: String,

    /// Grouping properties of the filter tree
    #[arg(long, value_delimiter = ',')]
    group_by: Vec<String>,

    /// Only import events at or after this time (RFC 3339)
    #[arg(long)]
    from: Option<DateTime<Utc>>,

    /// Only import events at or before this time (RFC 3339)
    #[arg(long)]
    to: Option<DateTime<Utc>>,

    /// Advanced filter expression kept with the session's view
    #[arg(long)]
    advanced: Option<String>,

    /// Filter expression for this query only
    #[arg(long)]
    filter: Option<String>,

    /// Sort as `field [asc|desc]`
    #[arg(long)]
    sort: Option<String>,

    /// Items to skip
    #[arg(long, default_value = "0")]
    skip: usize,

    /// Items to print
    #[arg(long)]
    take: Option<usize>,

    /// Application config file (default: logscope.toml in the session directory)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run_app(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

async fn run_app(args: Args) -> Result<()> {
    let app_config = AppConfig::load(args.config.as_deref(), &args.session_dir)?;
    let importers = Arc::new(app_config.importer_registry());
    let storage = Arc::new(FileConfigStorage);

    let created = !LogSession::exists(&args.session_dir).await;
    let session = if created {
        if !args.new {
            anyhow::bail!(
                "No session in '{}', use --new to create one",
                args.session_dir.display()
            );
        }
        LogSession::create_with(&args.session_dir, IN_MEMORY_STORAGE_ID, importers, storage)
            .await
            .context("Failed to create session")?
    } else {
        LogSession::open_with(&args.session_dir, importers, storage)
            .await
            .context("Failed to open session")?
    };
    let session = Arc::new(session);

    // Sources and time range are part of the persisted session config
    if !args.sources.is_empty() || args.from.is_some() || args.to.is_some() {
        session
            .update_config(|config| {
                for glob in &args.sources {
                    let source = ImportSource::glob(glob.clone(), args.profile.clone(), glob.clone());
                    if !config.add_source(source) {
                        info!(source = %glob, "Source already in session");
                    }
                }
                if args.from.is_some() {
                    config.start_time = args.from;
                }
                if args.to.is_some() {
                    config.end_time = args.to;
                }
            })
            .await
            .context("Failed to save session config")?;
    }

    let group_by = if args.group_by.is_empty() && created {
        app_config.group_by.clone()
    } else {
        args.group_by.clone()
    };
    if !group_by.is_empty() {
        session.set_grouping_properties(group_by).await?;
    }

    import(&session).await?;

    session
        .set_advanced_filter(args.advanced.as_deref())
        .context("Invalid advanced filter")?;

    let mut request = PageRequest::new()
        .skip(args.skip)
        .take(args.take.unwrap_or_else(|| app_config.page_size()));
    request.sort = args.sort.clone();
    request.filter = args.filter.clone();

    let store = session.store();
    let context = store.open_context();
    let page = session
        .load_page(&request, context, &CancellationToken::new())
        .context("Query failed")?;
    store.close_context(context)?;

    for item in &page.items {
        println!("{}", format_item(item));
    }
    eprintln!(
        "Showing {} of {} matching events ({} loaded)",
        page.items.len(),
        page.total_count,
        store.len()
    );

    Ok(())
}

/// Run an import, logging progress and cancelling on Ctrl-C
async fn import(session: &Arc<LogSession>) -> Result<()> {
    let progress = tokio::spawn(log_progress(session.progress().clone()));
    let interrupt = tokio::spawn({
        let session = Arc::clone(session);
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling import");
                session.cancel_import();
            }
        }
    });

    let result = session.import().await;
    interrupt.abort();
    progress.abort();

    match result {
        Ok(report) => {
            for failure in report.failures() {
                if let Err(e) = &failure.result {
                    warn!(path = %failure.path.display(), error = %e, "File not fully imported");
                }
            }
            info!(events = report.imported(), files = report.files.len(), "Imported");
            Ok(())
        }
        // Events read before the cancel stay queryable
        Err(e) if e.is_cancelled() => {
            warn!("Import cancelled");
            Ok(())
        }
        Err(e) => Err(e).context("Import failed"),
    }
}

/// Log each whole percent of import progress
async fn log_progress(reporter: ProgressReporter) {
    let mut rx = reporter.subscribe();
    let mut last = None;
    while rx.changed().await.is_ok() {
        let (action, item, percent) = {
            let p = rx.borrow_and_update();
            let percent = (!p.main.indeterminate).then(|| p.main.percent().floor() as u32);
            (p.action.clone(), p.item.clone(), percent)
        };
        let key = (action.clone(), percent);
        if last.as_ref() == Some(&key) {
            continue;
        }
        last = Some(key);

        match percent {
            Some(percent) => info!(action, item = item.as_deref().unwrap_or(""), percent, "Progress"),
            None => info!(action, "Progress"),
        }
    }
}

fn format_item(item: &LogItem) -> String {
    let mut line = format!(
        "{} {} [{}] {}",
        item.id,
        item.timestamp().format("%Y-%m-%d %H:%M:%S%.3f"),
        item.level().as_str(),
        item.event.render_message()
    );
    if let Some(exception) = &item.event.exception {
        line.push('\n');
        line.push_str(exception);
    }
    line
}
