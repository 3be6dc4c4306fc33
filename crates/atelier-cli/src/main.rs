use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use atelier_contracts::logs::aggregate::{LogTable, Pivot};
use atelier_contracts::logs::purge::purge;
use atelier_contracts::logs::writer::UsageLogger;
use atelier_contracts::logs::ANONYMOUS_USER;
use atelier_contracts::presets::{builtin_style, builtin_styles, PresetStore};
use atelier_contracts::prompt::ImageSize;
use atelier_contracts::session::{Session, SessionStore};
use atelier_engine::client::ImagesClient;
use atelier_engine::codec;
use atelier_engine::studio::{load_session, GenerateRequest, Studio};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};

const APP_NAME: &str = "atelier";

#[derive(Debug, Parser)]
#[command(name = "atelier", version, about = "Prompt-driven image generation and editing")]
struct Cli {
    /// Root for sessions, presets, and the usage log.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// User recorded in the usage log.
    #[arg(long, global = true)]
    user: Option<String>,
    /// Named workflow session.
    #[arg(long, global = true, default_value = "default")]
    session: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate images from a composed prompt; the first becomes the source.
    Generate(GenerateArgs),
    /// Edit the current source image with a prompt.
    Edit(EditArgs),
    /// Load a local image file into the source slot.
    Upload(UploadArgs),
    /// Promote the pending result to the source slot.
    Promote,
    /// Clear the session.
    Reset,
    /// Show the session state and the actions it allows.
    Status,
    /// Write the current image to a file.
    Save(SaveArgs),
    /// Manage prompt presets.
    #[command(subcommand)]
    Preset(PresetCommand),
    /// Aggregate the usage log.
    Report(ReportArgs),
    /// Physically delete log records for whole months.
    Purge(PurgeArgs),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    /// Free prompt text, appended after the style and preset snippets.
    #[arg(long, default_value = "")]
    prompt: String,
    /// Built-in style name (see `preset styles`).
    #[arg(long)]
    style: Option<String>,
    /// Saved preset name.
    #[arg(long)]
    preset: Option<String>,
    #[arg(long, default_value = "1024x1024", value_parser = parse_size)]
    size: ImageSize,
    /// Number of candidates, 1 to 4.
    #[arg(long, default_value_t = 1)]
    n: u64,
    /// Directory for candidates beyond the first.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct EditArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value = "1024x1024", value_parser = parse_edit_size)]
    size: ImageSize,
    /// Mask PNG; transparent pixels mark the editable region.
    #[arg(long)]
    mask: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct UploadArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Parser)]
struct SaveArgs {
    /// Defaults to a timestamped name in the current directory.
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long, default_value = "png")]
    format: SaveFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum SaveFormat {
    Png,
    Webp,
}

#[derive(Debug, Subcommand)]
enum PresetCommand {
    /// List built-in styles.
    Styles,
    /// List saved presets.
    List,
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        text: String,
    },
    Remove {
        #[arg(long)]
        name: String,
    },
}

#[derive(Debug, Parser)]
struct ReportArgs {
    /// Inclusive start date (YYYY-MM-DD).
    #[arg(long, value_parser = parse_date)]
    from: Option<NaiveDate>,
    /// Inclusive end date (YYYY-MM-DD).
    #[arg(long, value_parser = parse_date)]
    to: Option<NaiveDate>,
    /// Restrict to these users (repeatable).
    #[arg(long = "user-filter")]
    users: Vec<String>,
    /// Write every pivot as CSV into this directory.
    #[arg(long)]
    csv_dir: Option<PathBuf>,
    /// Chart monthly totals for these users (repeatable).
    #[arg(long = "chart-user")]
    chart_users: Vec<String>,
}

#[derive(Debug, Parser)]
struct PurgeArgs {
    /// Year-month bucket to delete, e.g. 2026-03 (repeatable).
    #[arg(long = "month", required = true)]
    months: Vec<String>,
    /// Must be the literal DELETE.
    #[arg(long)]
    confirm: String,
}

fn parse_size(value: &str) -> Result<ImageSize, String> {
    value.parse::<ImageSize>().map_err(|err| err.to_string())
}

fn parse_edit_size(value: &str) -> Result<ImageSize, String> {
    let size = parse_size(value)?;
    if size == ImageSize::Auto {
        return Err("edits need an explicit size".to_string());
    }
    Ok(size)
}

fn parse_date(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|err| err.to_string())
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("atelier error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let data_dir = cli
        .data_dir
        .clone()
        .or_else(|| env::var("ATELIER_HOME").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(".atelier"));
    let user = cli
        .user
        .clone()
        .or_else(|| env::var("ATELIER_USER").ok())
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| ANONYMOUS_USER.to_string());
    let store = SessionStore::new(data_dir.join("sessions").join(&cli.session));
    let presets = PresetStore::new(data_dir.join("presets_user.json"));

    match cli.command {
        Command::Generate(args) => run_generate(&data_dir, &user, &store, &presets, args),
        Command::Edit(args) => run_edit(&data_dir, &user, &store, args),
        Command::Upload(args) => run_upload(&data_dir, &user, &store, args),
        Command::Promote => run_promote(&store),
        Command::Reset => run_reset(&data_dir, &user, &store),
        Command::Status => run_status(&store),
        Command::Save(args) => run_save(&store, args),
        Command::Preset(command) => run_preset(&presets, command),
        Command::Report(args) => run_report(&data_dir, args),
        Command::Purge(args) => run_purge(&data_dir, args),
    }
}

fn studio(data_dir: &std::path::Path, user: &str, page: &str) -> Result<Studio> {
    let client = ImagesClient::from_env()?;
    let logger = UsageLogger::new(data_dir, APP_NAME, page);
    Ok(Studio::new(client, logger, user))
}

fn log_path(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("logs").join(format!("{APP_NAME}.log.jsonl"))
}

fn run_generate(
    data_dir: &std::path::Path,
    user: &str,
    store: &SessionStore,
    presets: &PresetStore,
    args: GenerateArgs,
) -> Result<i32> {
    if !(1..=4).contains(&args.n) {
        bail!("n must be between 1 and 4");
    }
    let style = match args.style.as_deref() {
        None => String::new(),
        Some(name) => builtin_style(name)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("unknown style '{name}' (see `atelier preset styles`)"))?,
    };
    let preset = match args.preset.as_deref() {
        None => String::new(),
        Some(name) => presets
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("unknown preset '{name}' (see `atelier preset list`)"))?,
    };

    let studio = studio(data_dir, user, "generate")?;
    let mut session = load_session(store);
    let request = GenerateRequest {
        style,
        preset,
        free: args.prompt.clone(),
        size: args.size,
        n: args.n,
    };
    let outcome = studio.generate(&mut session, &request)?;
    store.save(&session)?;

    println!("prompt: {}", outcome.prompt);
    if outcome.choice.fell_back {
        println!(
            "fallback: {} only supports {}, size was constrained",
            outcome.choice.model, outcome.choice.size
        );
    }
    println!(
        "generated with {} at {} ({} candidate(s))",
        outcome.choice.model,
        outcome.choice.size,
        outcome.extra_images.len() + 1
    );
    println!("source slot updated in session '{}'", session_label(store));

    if !outcome.extra_images.is_empty() {
        let out_dir = args
            .out
            .unwrap_or_else(|| store.dir().join("candidates"));
        fs::create_dir_all(&out_dir)
            .with_context(|| format!("failed to create {}", out_dir.display()))?;
        for (idx, png) in outcome.extra_images.iter().enumerate() {
            let path = out_dir.join(format!("candidate-{:02}.png", idx + 2));
            fs::write(&path, png).with_context(|| format!("failed to write {}", path.display()))?;
            println!("candidate written: {}", path.display());
        }
    }
    print_warnings(&outcome.warnings);
    Ok(0)
}

fn run_edit(
    data_dir: &std::path::Path,
    user: &str,
    store: &SessionStore,
    args: EditArgs,
) -> Result<i32> {
    let mask = args
        .mask
        .as_ref()
        .map(|path| fs::read(path).with_context(|| format!("failed to read {}", path.display())))
        .transpose()?;

    let studio = studio(data_dir, user, "edit")?;
    let mut session = load_session(store);
    let outcome = studio.edit(&mut session, &args.prompt, args.size, mask.as_deref())?;
    store.save(&session)?;

    if outcome.choice.fell_back {
        println!(
            "fallback: {} only supports {}, size was constrained",
            outcome.choice.model, outcome.choice.size
        );
    }
    println!(
        "edit complete with {} at {}; result is pending promotion",
        outcome.choice.model, outcome.choice.size
    );
    print_warnings(&outcome.warnings);
    Ok(0)
}

fn run_upload(
    data_dir: &std::path::Path,
    user: &str,
    store: &SessionStore,
    args: UploadArgs,
) -> Result<i32> {
    let bytes =
        fs::read(&args.file).with_context(|| format!("failed to read {}", args.file.display()))?;
    let file_name = args
        .file
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "image.png".to_string());

    let studio = studio(data_dir, user, "upload")?;
    let mut session = load_session(store);
    let warnings = studio.upload(&mut session, &file_name, &bytes)?;
    store.save(&session)?;

    println!("loaded {} into the source slot", file_name);
    print_warnings(&warnings);
    Ok(0)
}

fn run_promote(store: &SessionStore) -> Result<i32> {
    let mut session = load_session(store);
    session.promote_result_to_source()?;
    store.save(&session)?;
    println!("result promoted; the next edit chains off it");
    Ok(0)
}

fn run_reset(data_dir: &std::path::Path, user: &str, store: &SessionStore) -> Result<i32> {
    let studio = studio(data_dir, user, "reset")?;
    let mut session = load_session(store);
    let warnings = studio.reset(&mut session);
    store.save(&session)?;
    println!("session cleared");
    print_warnings(&warnings);
    Ok(0)
}

fn run_status(store: &SessionStore) -> Result<i32> {
    let session = load_session(store);
    println!("session: {} ({})", session_label(store), session.id);

    match session.source() {
        Some(source) => {
            let (width, height) = codec::dimensions(&source.bytes)?;
            println!("source: {}x{} ({} bytes)", width, height, source.bytes.len());
        }
        None => println!("source: (empty)"),
    }
    match session.result() {
        Some(result) => {
            let (width, height) = codec::dimensions(&result.bytes)?;
            println!("result: {}x{} ({} bytes)", width, height, result.bytes.len());
        }
        None => println!("result: (none)"),
    }
    if !session.meta.last_prompt.is_empty() {
        println!("last prompt: {}", session.meta.last_prompt);
    }
    if let Some(size) = session.meta.last_size {
        println!("last size: {size}");
    }
    if !session.meta.last_model.is_empty() {
        println!("last model: {}", session.meta.last_model);
    }

    let mut actions = vec!["generate", "upload", "reset"];
    if session.can_edit() {
        actions.push("edit");
    }
    if session.can_promote() {
        actions.push("promote");
    }
    if session.source().is_some() || session.result().is_some() {
        actions.push("save");
    }
    println!("available actions: {}", actions.join(", "));
    Ok(0)
}

fn run_save(store: &SessionStore, args: SaveArgs) -> Result<i32> {
    let session = load_session(store);
    // Prefer the freshest image: a pending result, otherwise the source.
    let artifact = session
        .result()
        .or_else(|| session.source())
        .ok_or_else(|| anyhow::anyhow!("nothing to save; generate or upload an image first"))?;

    let (bytes, extension) = match args.format {
        SaveFormat::Png => (artifact.bytes.clone(), "png"),
        SaveFormat::Webp => (codec::encode_webp(&artifact.bytes)?, "webp"),
    };
    let prefix = if session.result().is_some() {
        "edited"
    } else {
        "generated"
    };
    let out = args
        .out
        .unwrap_or_else(|| PathBuf::from(codec::download_name(prefix, extension)));
    fs::write(&out, bytes).with_context(|| format!("failed to write {}", out.display()))?;
    println!("saved {}", out.display());
    Ok(0)
}

fn run_preset(presets: &PresetStore, command: PresetCommand) -> Result<i32> {
    match command {
        PresetCommand::Styles => {
            for (name, snippet) in builtin_styles() {
                if snippet.is_empty() {
                    println!("{name}");
                } else {
                    println!("{name}: {snippet}");
                }
            }
        }
        PresetCommand::List => {
            let map = presets.load();
            if map.is_empty() {
                println!("no saved presets ({})", presets.path().display());
            }
            for (name, text) in map {
                println!("{name}: {text}");
            }
        }
        PresetCommand::Add { name, text } => {
            presets.add(&name, &text)?;
            println!("preset '{}' saved", name.trim());
        }
        PresetCommand::Remove { name } => {
            if presets.remove(&name)? {
                println!("preset '{name}' removed");
            } else {
                println!("no preset named '{name}'");
            }
        }
    }
    Ok(0)
}

fn run_report(data_dir: &std::path::Path, args: ReportArgs) -> Result<i32> {
    let path = log_path(data_dir);
    let table = LogTable::load(&path)?;
    if table.is_empty() {
        println!("no log records at {}", path.display());
        return Ok(0);
    }

    let users: Option<BTreeSet<String>> = if args.users.is_empty() {
        None
    } else {
        Some(args.users.iter().cloned().collect())
    };
    let filtered = table.filter(args.from, args.to, users.as_ref());
    println!("records: {} / {}", filtered.len(), table.len());

    let summary = filtered.summary();
    println!(
        "generate: {}  edit: {}  unique users: {}",
        summary.generate_count, summary.edit_count, summary.unique_users
    );

    let by_user = filtered.user_action_pivot();
    let by_month = filtered.month_action_pivot();
    let by_user_month_total = filtered.user_month_pivot(None);
    let by_user_month_generate = filtered.user_month_pivot(Some("generate"));
    let by_user_month_edit = filtered.user_month_pivot(Some("edit"));

    print_pivot("per user", &by_user);
    print_pivot("per month", &by_month);
    print_pivot("user x month (total)", &by_user_month_total);
    print_pivot("user x month (generate)", &by_user_month_generate);
    print_pivot("user x month (edit)", &by_user_month_edit);

    if !args.chart_users.is_empty() {
        let picked: BTreeSet<String> = args.chart_users.iter().cloned().collect();
        print_chart(&by_user_month_total.select_rows(&picked));
    }

    if let Some(csv_dir) = args.csv_dir {
        fs::create_dir_all(&csv_dir)
            .with_context(|| format!("failed to create {}", csv_dir.display()))?;
        let exports = [
            ("user_summary.csv", &by_user),
            ("monthly_summary.csv", &by_month),
            ("user_by_month_total.csv", &by_user_month_total),
            ("user_by_month_generate.csv", &by_user_month_generate),
            ("user_by_month_edit.csv", &by_user_month_edit),
        ];
        for (name, pivot) in exports {
            let path = csv_dir.join(name);
            fs::write(&path, pivot.to_csv())
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("csv written: {}", path.display());
        }
    }
    Ok(0)
}

fn run_purge(data_dir: &std::path::Path, args: PurgeArgs) -> Result<i32> {
    let mut months = BTreeSet::new();
    for month in &args.months {
        let month = month.trim();
        let valid = month.len() == 7
            && month.as_bytes()[4] == b'-'
            && month[..4].chars().all(|ch| ch.is_ascii_digit())
            && month[5..].chars().all(|ch| ch.is_ascii_digit());
        if !valid {
            bail!("'{month}' is not a year-month (expected YYYY-MM)");
        }
        months.insert(month.to_string());
    }

    let outcome = purge(&log_path(data_dir), &months, &args.confirm)?;
    println!(
        "removed {} record(s), kept {}",
        outcome.removed, outcome.kept
    );
    if outcome.kept_unknown_bucket > 0 {
        eprintln!(
            "warning: {} record(s) had no readable timestamp and were kept",
            outcome.kept_unknown_bucket
        );
    }
    println!("backup: {}", outcome.backup_path.display());
    Ok(0)
}

fn session_label(store: &SessionStore) -> String {
    store
        .dir()
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| store.dir().display().to_string())
}

fn print_warnings(warnings: &[String]) {
    for warning in warnings {
        eprintln!("warning: {warning}");
    }
}

fn print_pivot(title: &str, pivot: &Pivot) {
    println!("\n{title}");
    if pivot.rows.is_empty() {
        println!("  (no data)");
        return;
    }

    let key_width = pivot
        .rows
        .iter()
        .map(|row| row.key.len())
        .chain([pivot.index_name.len()])
        .max()
        .unwrap_or(0);
    let col_widths: Vec<usize> = pivot
        .columns
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            pivot
                .rows
                .iter()
                .map(|row| row.values[idx].to_string().len())
                .chain([column.len()])
                .max()
                .unwrap_or(0)
        })
        .collect();

    print!("  {:<key_width$}", pivot.index_name);
    for (column, width) in pivot.columns.iter().zip(col_widths.iter().copied()) {
        print!("  {column:>width$}");
    }
    println!();
    for row in &pivot.rows {
        print!("  {:<key_width$}", row.key);
        for (value, width) in row.values.iter().zip(col_widths.iter().copied()) {
            print!("  {value:>width$}");
        }
        println!();
    }
}

/// Monthly totals per selected user as text bars.
fn print_chart(pivot: &Pivot) {
    println!("\nmonthly totals");
    if pivot.rows.is_empty() {
        println!("  (no matching users)");
        return;
    }
    for row in &pivot.rows {
        println!("  {}", row.key);
        for (month, value) in pivot.columns.iter().zip(&row.values) {
            let bar = "#".repeat(*value as usize);
            println!("    {month} | {bar} {value}");
        }
    }
}
