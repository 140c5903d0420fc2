use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fxbatch_contracts::cookies::{load_netscape_cookies, AuthCookies, SERVICE_COOKIE_DOMAIN};
use fxbatch_contracts::events::{EventWriter, ProgressUpdate};
use fxbatch_contracts::models::{AspectRatio, ModelRegistry};
use fxbatch_contracts::runs::{write_report, GenerationRequest};
use fxbatch_engine::{
    BatchRunner, PackagingError, ResultPackager, RetryPolicy, SessionClient, SessionConfig,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fxbatch", version, about = "Batch image generation against ImageFX")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate images for a list of prompts and package the results.
    Run(RunArgs),
    /// Check which authentication cookies a cookie file provides.
    Cookies(CookiesArgs),
    /// List model variants and the aspect ratios they accept.
    Models,
}

#[derive(Debug, Parser)]
struct CookieSource {
    /// Netscape cookie export, or a file holding a raw `Cookie` header.
    #[arg(long, conflicts_with = "cookie")]
    cookie_file: Option<PathBuf>,
    /// Raw `Cookie` header value.
    #[arg(long)]
    cookie: Option<String>,
}

impl CookieSource {
    fn is_given(&self) -> bool {
        self.cookie_file.is_some() || self.cookie.is_some()
    }
}

/// `TITLE=FILE`: prompts read from FILE are packaged under TITLE.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ProjectSource {
    title: String,
    file: PathBuf,
}

impl FromStr for ProjectSource {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (title, file) = raw
            .split_once('=')
            .ok_or_else(|| format!("expected TITLE=FILE, got '{raw}'"))?;
        if title.trim().is_empty() || file.trim().is_empty() {
            return Err(format!("expected TITLE=FILE, got '{raw}'"));
        }
        Ok(Self {
            title: title.trim().to_string(),
            file: PathBuf::from(file.trim()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PromptEntry {
    prompt: String,
    project: Option<String>,
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[command(flatten)]
    cookies: CookieSource,
    /// Ready bearer token; skips the cookie exchange until the service rejects it.
    #[arg(long, env = "FXBATCH_AUTH", hide_env_values = true)]
    auth: Option<String>,
    #[arg(long = "prompt")]
    prompts: Vec<String>,
    /// One prompt per line; blank lines and `#` comments are skipped.
    #[arg(long)]
    prompts_file: Option<PathBuf>,
    /// `TITLE=FILE`, repeatable. Each file's prompts are named after TITLE in
    /// the archive.
    #[arg(long = "project", value_name = "TITLE=FILE")]
    projects: Vec<ProjectSource>,
    #[arg(long, default_value = "IMAGEN_4")]
    model: String,
    #[arg(long, default_value = "landscape")]
    ratio: AspectRatio,
    #[arg(long, default_value_t = 4)]
    count: u32,
    #[arg(long)]
    seed: Option<i64>,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct CookiesArgs {
    #[command(flatten)]
    cookies: CookieSource,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("fxbatch error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_batch(args),
        Command::Cookies(args) => run_cookies(args),
        Command::Models => {
            print_models(&ModelRegistry::default());
            Ok(0)
        }
    }
}

fn run_batch(args: RunArgs) -> Result<i32> {
    let cookies = if args.auth.is_some() && !args.cookies.is_given() {
        AuthCookies::default()
    } else {
        load_cookies(&args.cookies)?
    };
    let prompts = collect_prompts(
        &args.prompts,
        args.prompts_file.as_deref(),
        &args.projects,
    )?;
    let requests: Vec<GenerationRequest> = prompts
        .into_iter()
        .map(|entry| {
            let request = GenerationRequest::new(entry.prompt)
                .with_aspect_ratio(args.ratio)
                .with_count(args.count)
                .with_model(args.model.clone())
                .with_seed(args.seed);
            match entry.project {
                Some(project) => request.with_project(project),
                None => request,
            }
        })
        .collect();

    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed creating output dir {}", args.out.display()))?;
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let events = EventWriter::new(events_path, uuid::Uuid::new_v4().to_string());

    tracing::info!(
        prompts = requests.len(),
        projects = args.projects.len(),
        model = %args.model,
        cookies = cookies.len(),
        preset_token = args.auth.is_some(),
        "starting batch"
    );
    let mut client = SessionClient::new(cookies, SessionConfig::from_env())?;
    if let Some(token) = args.auth {
        client = client.with_access_token(token);
    }
    let runner = BatchRunner::new(client)
        .with_retry_policy(RetryPolicy::from_env())
        .with_events(events)
        .with_observer(print_progress);
    let report = runner.run(requests);

    let report_path = args.out.join("report.json");
    write_report(&report_path, &report)?;
    println!("{}", serde_json::to_string_pretty(&report.summary())?);
    if !report.refreshed_cookies().is_empty() {
        println!(
            "Service rotated {} cookie(s) during the batch; re-export cookies before the next run.",
            report.refreshed_cookies().len()
        );
    }

    let packager = ResultPackager::new().with_title(args.title.as_deref().unwrap_or_default());
    match packager.package(&report) {
        Ok(archive) => {
            let zip_path = args.out.join(archive.file_name());
            archive.write_zip(&zip_path)?;
            println!(
                "Wrote {} image(s) to {}",
                archive.entries().len(),
                zip_path.display()
            );
            Ok(0)
        }
        Err(PackagingError::EmptyArchive) => {
            eprintln!("No images were generated; see {}", report_path.display());
            Ok(1)
        }
        Err(err) => Err(err.into()),
    }
}

fn run_cookies(args: CookiesArgs) -> Result<i32> {
    let cookies = load_cookies(&args.cookies)?;
    println!("{} cookie(s) for {SERVICE_COOKIE_DOMAIN}", cookies.len());
    for name in cookies.names() {
        println!("  {name}");
    }
    let mark = |present: bool| if present { "found" } else { "missing" };
    println!("session token: {}", mark(cookies.session_token().is_some()));
    println!("security token: {}", mark(cookies.csrf_token().is_some()));
    match cookies.require_auth() {
        Ok(()) => Ok(0),
        Err(err) => {
            eprintln!("{err}");
            Ok(1)
        }
    }
}

fn print_models(registry: &ModelRegistry) {
    for variant in registry.list() {
        let ratios: Vec<&str> = variant
            .aspect_ratios
            .iter()
            .map(|ratio| ratio.wire_name())
            .collect();
        println!("{} (wire {}): {}", variant.name, variant.wire_model, ratios.join(", "));
    }
}

fn print_progress(update: &ProgressUpdate<'_>) {
    let detail = match update.error {
        Some(error) => error.to_string(),
        None => format!("{} image(s)", update.images),
    };
    println!(
        "[{}/{}] {} after {} attempt(s): {detail}",
        update.index + 1,
        update.total,
        update.status.as_str(),
        update.attempts
    );
}

fn load_cookies(source: &CookieSource) -> Result<AuthCookies> {
    let cookies = match (&source.cookie_file, &source.cookie) {
        (Some(path), _) => load_cookie_file(path)?,
        (None, Some(raw)) => AuthCookies::from_cookie_header(raw),
        (None, None) => bail!("pass --cookie-file or --cookie"),
    };
    if cookies.is_empty() {
        bail!("no cookies for {SERVICE_COOKIE_DOMAIN} found");
    }
    Ok(cookies)
}

/// Netscape export first; a file without any matching cookie line is read
/// as a raw `Cookie` header instead.
fn load_cookie_file(path: &Path) -> Result<AuthCookies> {
    let cookies = load_netscape_cookies(path, SERVICE_COOKIE_DOMAIN)?;
    if !cookies.is_empty() {
        return Ok(cookies);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading cookie file {}", path.display()))?;
    Ok(AuthCookies::from_cookie_header(&raw))
}

fn collect_prompts(
    inline: &[String],
    file: Option<&Path>,
    projects: &[ProjectSource],
) -> Result<Vec<PromptEntry>> {
    let untitled = |prompt: String| PromptEntry {
        prompt,
        project: None,
    };
    let mut prompts: Vec<PromptEntry> = inline.iter().cloned().map(untitled).collect();
    if let Some(path) = file {
        prompts.extend(read_prompt_lines(path)?.into_iter().map(untitled));
    }
    for project in projects {
        let lines = read_prompt_lines(&project.file)?;
        if lines.is_empty() {
            tracing::warn!(project = %project.title, "project file holds no prompts");
        }
        prompts.extend(lines.into_iter().map(|prompt| PromptEntry {
            prompt,
            project: Some(project.title.clone()),
        }));
    }
    if prompts.is_empty() {
        bail!("no prompts given; pass --prompt, --prompts-file or --project");
    }
    Ok(prompts)
}

fn read_prompt_lines(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed reading prompts file {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}
