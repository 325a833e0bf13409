use anyhow::{bail, Context};
use clap::{Args as ClapArgs, Parser, Subcommand};
use futures_util::StreamExt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tracing::{info, warn};
use webrefine::digest::sha1_base32;
use webrefine::{
    ArchiveConfig, CaptureReference, CdxQuery, CommonCrawlQuery, ReqwestTransport,
    TransportConfig, WarcFileQuery, WebArchive,
};

#[derive(Parser, Debug)]
#[command(name = "webrefine")]
#[command(about = "Find and fetch archived captures from the Wayback Machine and Common Crawl", long_about = None)]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// How long the Common Crawl index listing is cached (e.g. "24h", "10m")
    #[arg(long, global = true, default_value = "24h", value_parser = humantime::parse_duration)]
    catalog_ttl: Duration,

    /// Per-request timeout (e.g. "30s"); unbounded by default
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Retries after a server error or connection failure
    #[arg(long, global = true, default_value_t = 5)]
    max_retries: usize,

    /// Idle connections kept per host
    #[arg(long, global = true, default_value_t = 8)]
    max_connections: usize,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Query the Wayback Machine CDX index
    Wayback(QueryArgs),
    /// Query Common Crawl indexes
    Commoncrawl {
        #[command(flatten)]
        query: QueryArgs,

        /// Crawl ids to search (comma-separated); chosen from --from/--to when omitted
        #[arg(long, value_delimiter = ',')]
        shards: Vec<String>,

        /// Results per page
        #[arg(long)]
        page_size: Option<u32>,
    },
    /// List the Common Crawl indexes covering a time window
    Shards {
        /// Earliest timestamp prefix (YYYY[MM[DD[hh[mm[ss]]]]])
        #[arg(long)]
        from: Option<String>,

        /// Latest timestamp prefix (YYYY[MM[DD[hh[mm[ss]]]]])
        #[arg(long)]
        to: Option<String>,
    },
    /// Index the response records of a local WARC file
    Warc {
        /// WARC file, plain or per-record gzip
        path: PathBuf,
    },
    /// Fetch content for capture references (JSON lines on stdin)
    Fetch {
        /// A single JSON capture reference instead of stdin
        #[arg(long)]
        reference: Option<String>,

        /// Directory to write payloads to; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Request unmodified archived bytes from Wayback replay
        #[arg(long)]
        original: bool,

        /// Warn when a payload does not match its recorded digest
        #[arg(long)]
        verify: bool,
    },
}

#[derive(ClapArgs, Debug)]
struct QueryArgs {
    /// URL (or URL pattern) to look up
    url: String,

    /// Earliest timestamp prefix (YYYY[MM[DD[hh[mm[ss]]]]])
    #[arg(long)]
    from: Option<String>,

    /// Latest timestamp prefix (YYYY[MM[DD[hh[mm[ss]]]]])
    #[arg(long)]
    to: Option<String>,

    /// MIME patterns to keep (comma-separated, e.g. "text/*,application/pdf")
    #[arg(long, value_delimiter = ',')]
    mime: Vec<String>,

    /// Keep captures with any HTTP status, not only 200
    #[arg(long)]
    all_status: bool,

    /// Maximum number of results
    #[arg(long)]
    limit: Option<u64>,

    /// Results to skip
    #[arg(long)]
    offset: Option<u64>,
}

impl QueryArgs {
    fn to_query(&self) -> CdxQuery {
        CdxQuery::new(&self.url)
            .between(self.from.clone(), self.to.clone())
            .status_ok(!self.all_status)
            .mime(self.mime.iter().cloned())
            .limit(self.limit)
            .offset(self.offset)
    }
}

fn spinner(message: &str) -> anyhow::Result<Option<indicatif::ProgressBar>> {
    if !atty::is(atty::Stream::Stderr) {
        return Ok(None);
    }
    let pb = indicatif::ProgressBar::new_spinner();
    pb.set_style(
        indicatif::ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg} {pos} | {elapsed_precise} elapsed")
            .context("invalid progress template")?,
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(Some(pb))
}

fn print_reference(reference: &CaptureReference) -> anyhow::Result<()> {
    let line = serde_json::to_string(reference)?;
    writeln!(std::io::stdout().lock(), "{}", line)?;
    Ok(())
}

async fn read_references(inline: Option<String>) -> anyhow::Result<Vec<CaptureReference>> {
    if let Some(json) = inline {
        return Ok(vec![serde_json::from_str(&json).context("invalid --reference")?]);
    }
    let mut references = Vec::new();
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut line_number = 0;
    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        let reference = serde_json::from_str(&line)
            .with_context(|| format!("invalid capture reference on line {}", line_number))?;
        references.push(reference);
    }
    Ok(references)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing; stdout carries results
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("webrefine={}", log_level))
        .with_writer(std::io::stderr)
        .init();

    let transport = Arc::new(ReqwestTransport::new(TransportConfig {
        max_connections: args.max_connections,
        max_retries: args.max_retries,
        timeout: args.timeout,
        ..TransportConfig::default()
    })?);
    let mut config = ArchiveConfig {
        catalog_ttl: args.catalog_ttl,
        ..ArchiveConfig::default()
    };
    if let Command::Fetch {
        original, verify, ..
    } = &args.command
    {
        config.replay_original = *original;
        config.verify_digests = *verify;
    }
    let archive = WebArchive::new(transport, config);

    match args.command {
        Command::Wayback(query) => {
            let references = archive.wayback(&query.to_query()).await?;
            for reference in &references {
                print_reference(reference)?;
            }
            info!("✅ {} capture(s) found", references.len());
        }
        Command::Commoncrawl {
            query,
            shards,
            page_size,
        } => {
            let query = CommonCrawlQuery::new(query.to_query())
                .shards((!shards.is_empty()).then_some(shards))
                .page_size(page_size);
            let pb = spinner("🔎 Searching Common Crawl")?;
            let mut found = 0u64;
            let mut results = Box::pin(archive.common_crawl(&query));
            while let Some(reference) = results.next().await {
                print_reference(&reference?)?;
                found += 1;
                if let Some(pb) = &pb {
                    pb.set_position(found);
                }
            }
            if let Some(pb) = pb {
                pb.finish_and_clear();
            }
            info!("✅ {} capture(s) found", found);
        }
        Command::Shards { from, to } => {
            let ids = archive
                .catalog()
                .resolve(from.as_deref(), to.as_deref())
                .await?;
            let listing = archive.catalog().shards().await?;
            let mut stdout = std::io::stdout().lock();
            for shard in listing.iter().filter(|s| ids.contains(&s.id)) {
                writeln!(stdout, "{}\t{}\t{}", shard.id, shard.name, shard.cdx_api)?;
            }
        }
        Command::Warc { path } => {
            let query = WarcFileQuery::new(path);
            let references = tokio::task::spawn_blocking(move || query.query())
                .await
                .map_err(|e| std::io::Error::other(format!("Task join error: {}", e)))??;
            for reference in &references {
                print_reference(reference)?;
            }
            info!("✅ {} response record(s) indexed", references.len());
        }
        Command::Fetch {
            reference, output, ..
        } => {
            let references = read_references(reference).await?;
            if let Some(dir) = &output {
                tokio::fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("cannot create {}", dir.display()))?;
            } else if references.len() > 1 {
                bail!("fetching more than one reference requires --output");
            }

            let pb = spinner("📥 Fetching captures")?;
            let mut missing = 0;
            for reference in &references {
                let Some(content) = archive.fetch(reference).await? else {
                    warn!("❌ No content for {} at {}", reference.url, reference.timestamp_str());
                    missing += 1;
                    continue;
                };
                match &output {
                    Some(dir) => {
                        let name = format!("{}-{}", reference.timestamp_str(), sha1_base32(&content));
                        tokio::fs::write(dir.join(&name), &content).await?;
                        info!("{} -> {}", reference.url, name);
                    }
                    None => std::io::stdout().lock().write_all(&content)?,
                }
                if let Some(pb) = &pb {
                    pb.inc(1);
                }
            }
            if let Some(pb) = pb {
                pb.finish_and_clear();
            }
            info!(
                "✅ Fetched {} of {} capture(s), {} missing",
                references.len() - missing,
                references.len(),
                missing
            );
        }
    }

    Ok(())
}
