use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use titlebot_core::archive::{ArchiveFetcher, ArchiveOrigin, ArchiveSource};
use titlebot_core::config::{BotConfig, RunOptions, credentials_from_env, load_config};
use titlebot_core::extract::extract_titles;
use titlebot_core::lua_table::{last_issue_in, render_titles_module, validate_module};
use titlebot_core::overlay::{apply_corrections, standard_corrections};
use titlebot_core::publish::{MediaWikiClient, MediaWikiClientConfig, WikiPageApi};
use titlebot_core::runner::{
    Confirmation, CycleOutcome, Prompter, SystemClock, run_until_published,
};

#[derive(Debug, Parser)]
#[command(
    name = "titlebot",
    version,
    about = "Scrapes the comic archive listing and keeps the wiki titles module up to date"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH", default_value = "titlebot.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Extract and reconcile titles, write the Lua module locally")]
    Render(RenderArgs),
    #[command(about = "Report extraction gaps without writing anything")]
    Check(CheckArgs),
    #[command(about = "Run the full download-parse-reconcile-publish cycle")]
    Update(UpdateArgs),
}

#[derive(Debug, Args)]
struct RenderArgs {
    #[arg(long, value_name = "PATH", help = "Archive listing to read instead of the cache file")]
    archive: Option<PathBuf>,
    #[arg(long, value_name = "PATH", default_value = "data.lua")]
    file: PathBuf,
}

#[derive(Debug, Args)]
struct CheckArgs {
    #[arg(long, value_name = "PATH", help = "Archive listing to read instead of the cache file")]
    archive: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct UpdateArgs {
    #[arg(long, value_name = "TITLE", help = "Page to update (default from config)")]
    page: Option<String>,
    #[arg(long, value_name = "PATH", default_value = "data.lua")]
    file: PathBuf,
    #[arg(long, value_name = "TEXT", help = "Note appended to the edit summary")]
    summary: Option<String>,
    #[arg(long, help = "Skip interactive confirmation")]
    auto: bool,
    #[arg(long, help = "Use the local archive copy, do not download")]
    no_download: bool,
    #[arg(long, default_value_t = 1, help = "Retry failed cycles up to this many times")]
    max_cycles: usize,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Render(args) => run_render(&config, args),
        Commands::Check(args) => run_check(&config, args),
        Commands::Update(args) => run_update(&config, args),
    }
}

fn run_render(config: &BotConfig, args: RenderArgs) -> Result<()> {
    let text = read_listing(config, args.archive.as_deref())?;
    let extraction = extract_titles(&text)?;
    print_gaps(&extraction.missing);

    let mut table = extraction.table;
    let applied = apply_corrections(&mut table, standard_corrections())?;
    let rendered = render_titles_module(&table);
    validate_module(&rendered)?;
    std::fs::write(&args.file, &rendered)
        .with_context(|| format!("failed to write {}", args.file.display()))?;

    println!("raw_records: {}", extraction.raw_records);
    println!("corrections_applied: {}", applied.len());
    println!("titles: {}", table.len());
    println!(
        "last_issue: {}",
        last_issue_in(&rendered)
            .map(|number| number.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("wrote: {}", args.file.display());
    Ok(())
}

fn run_check(config: &BotConfig, args: CheckArgs) -> Result<()> {
    let text = read_listing(config, args.archive.as_deref())?;
    let extraction = extract_titles(&text)?;
    print_gaps(&extraction.missing);

    let mut table = extraction.table;
    apply_corrections(&mut table, standard_corrections())?;
    println!("raw_records: {}", extraction.raw_records);
    println!("titles: {}", table.len());
    println!(
        "last_issue: {}",
        table
            .keys()
            .next_back()
            .map(|number| number.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    Ok(())
}

fn run_update(config: &BotConfig, args: UpdateArgs) -> Result<()> {
    let options = RunOptions {
        page: args.page.unwrap_or_else(|| config.page_title()),
        data_file: args.file,
        summary_note: args.summary,
        auto: args.auto,
        no_download: args.no_download,
        max_cycles: args.max_cycles,
    };
    options.validate()?;
    let credentials = credentials_from_env()?;

    let archive = ArchiveFetcher::from_config(config)?;
    let mut wiki = MediaWikiClient::new(MediaWikiClientConfig::from_config(config)?)?;
    let mut prompter = ConsolePrompter;
    let clock = SystemClock;

    println!("page: {}", options.page);
    println!("data_file: {}", options.data_file.display());
    println!("auto: {}", options.auto);

    let report = run_until_published(
        config,
        &options,
        &credentials,
        &archive,
        &mut wiki,
        &mut prompter,
        &clock,
    )?;

    match &report.outcome {
        CycleOutcome::Published { summary } => {
            println!("saved '{}' with summary: {summary}", options.page);
        }
        CycleOutcome::NoChange => println!("published table is already up to date"),
        CycleOutcome::Declined => println!("okay, doing nothing"),
        CycleOutcome::Rejected { reason, detail } => {
            println!("edit not saved: {} ({detail})", reason.describe());
        }
    }
    println!("titles: {}", report.table_len);
    println!(
        "last_issue: {}",
        report
            .last_issue
            .map(|number| number.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("requests: {}", wiki.request_count());
    if !report.is_success() {
        bail!("update did not complete; see cycle output above");
    }
    Ok(())
}

fn read_listing(config: &BotConfig, archive_path: Option<&std::path::Path>) -> Result<String> {
    match archive_path {
        Some(path) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
        None => {
            let fetcher = ArchiveFetcher::from_config(config)?;
            let listing = fetcher
                .load(true)
                .context("no local archive copy; pass --archive or run `update` first")?;
            debug_assert_eq!(listing.origin, ArchiveOrigin::LocalOnly);
            Ok(listing.text)
        }
    }
}

fn print_gaps(missing: &[u32]) {
    for number in missing {
        println!("warning: missing comic #{number}");
    }
}

struct ConsolePrompter;

impl Prompter for ConsolePrompter {
    fn confirm(&mut self, summary: &str, diff: &str) -> Result<Confirmation> {
        println!("{diff}");
        println!("summary: {summary}");
        let stdin = io::stdin();
        loop {
            print!("Accept these changes? [y]es / [n]o / [q]uit: ");
            io::stdout().flush().context("failed to flush stdout")?;
            let mut line = String::new();
            let read = stdin
                .lock()
                .read_line(&mut line)
                .context("failed to read confirmation input")?;
            if read == 0 {
                // stdin closed; treat like a quit.
                return Ok(Confirmation::Quit);
            }
            match line.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" => return Ok(Confirmation::Yes),
                "n" | "no" => return Ok(Confirmation::No),
                "q" | "quit" => return Ok(Confirmation::Quit),
                other => println!("unrecognized answer: {other}"),
            }
        }
    }

    fn notify(&mut self, message: &str) {
        println!("{message}");
    }
}
