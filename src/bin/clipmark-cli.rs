use anyhow::{Context, Result, bail};
use clap::Parser;

use std::fs::File;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use clipmark::api::AnnotationApi;
use clipmark::clip::ClipSelection;
use clipmark::clock;
use clipmark::export_format::ExportFormat;
use clipmark::headless::HeadlessFactory;
use clipmark::http::{API_URL_ENV, DEFAULT_API_URL, HttpApi};
use clipmark::identity::{FileStore, IdentityContext};
use clipmark::logging;
use clipmark::region::{RegionId, ValidityPolicy};
use clipmark::waveform::format_time;
use clipmark::{AdvanceOutcome, AnnotationSession, FetchRetry, SessionOpts};

type Session<A> = AnnotationSession<A, HeadlessFactory>;

fn main() -> Result<()> {
    logging::init();
    let params = Params::parse();

    let api = HttpApi::new(&params.api_url)?;
    let store = FileStore::open(&params.credentials_path).with_context(|| {
        format!(
            "failed to open credential store {}",
            params.credentials_path.display()
        )
    })?;
    let mut identity = IdentityContext::load(store);
    sign_in(&mut identity, &api, &params)?;

    let opts = SessionOpts {
        validity: params.policy,
        clip_selection: params.selection.clone(),
        fetch_retry: match params.auto_retry {
            0 => FetchRetry::Manual,
            attempts => FetchRetry::Automatic {
                attempts,
                backoff: Duration::from_millis(params.retry_backoff_ms),
            },
        },
        ..SessionOpts::default()
    };

    let mut session = AnnotationSession::new(
        api,
        HeadlessFactory::default(),
        identity,
        clock::system(),
        opts,
    );

    match session.start() {
        Ok(outcome) => report(&session, &outcome),
        Err(err) => eprintln!("{}", err.user_message()),
    }

    let stdin = io::stdin();
    let mut out = io::stdout();
    prompt(&mut out)?;
    for line in stdin.lock().lines() {
        let line = line?;
        match run_command(&mut session, line.trim()) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => break,
            Err(err) => eprintln!("error: {err:#}"),
        }
        prompt(&mut out)?;
    }
    Ok(())
}

#[derive(Parser, Debug)]
#[command(name = "clipmark")]
#[command(about = "Annotate audio clips from the terminal")]
struct Params {
    #[arg(long = "api-url", env = API_URL_ENV, default_value = DEFAULT_API_URL)]
    pub api_url: String,

    /// Where the token, user id and username persist between runs.
    #[arg(long = "credentials", default_value = "clipmark-credentials.json")]
    pub credentials_path: PathBuf,

    #[arg(short = 'u', long = "username")]
    pub username: Option<String>,

    #[arg(short = 'p', long = "password", env = "CLIPMARK_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Create the account instead of logging in.
    #[arg(long = "register", default_value_t = false)]
    pub register: bool,

    #[arg(long = "policy", value_enum, default_value_t = ValidityPolicy::LabelOrComment)]
    pub policy: ValidityPolicy,

    /// `random`, `random:annotated`, `random:unannotated`, `user`, `user:scoped` or `pool:<name>`.
    #[arg(long = "selection", default_value = "user")]
    pub selection: ClipSelection,

    /// Extra attempts when fetching the next clip fails. 0 leaves retrying to you.
    #[arg(long = "auto-retry", default_value_t = 0)]
    pub auto_retry: u32,

    #[arg(long = "retry-backoff-ms", default_value_t = 500)]
    pub retry_backoff_ms: u64,
}

fn sign_in(identity: &mut IdentityContext, api: &HttpApi, params: &Params) -> Result<()> {
    let (Some(username), Some(password)) = (&params.username, &params.password) else {
        if identity.is_authenticated() {
            // A stored token may have expired since the last run.
            match identity.verify(api) {
                Ok(true) => return Ok(()),
                Ok(false) => bail!("stored session has expired; pass --username and --password"),
                Err(err) => {
                    eprintln!("{}", err.user_message());
                    return Ok(());
                }
            }
        }
        bail!("not signed in; pass --username and --password");
    };

    let result = if params.register {
        identity.register(api, username, password)
    } else {
        identity.login(api, username, password)
    };
    match result {
        Ok(who) => {
            println!("signed in as {} (id {})", who.username, who.user_id);
            Ok(())
        }
        // Credential failures carry the server's own wording.
        Err(clipmark::Error::Auth(reason)) => bail!(reason),
        Err(err) => bail!(err.user_message()),
    }
}

enum Flow {
    Continue,
    Quit,
}

const HELP: &str = "\
commands:
  play                 toggle playback
  skip+ | skip-        skip forward / back
  seek SECS            seek relative to the playhead
  tick SECS            let SECS of playback elapse
  volume LEVEL         set volume (0..1)
  add                  add a region at the playhead
  label N TEXT         set the class of region N
  comment N TEXT       set the comment of region N
  rm N                 remove region N
  list                 show regions
  next                 submit and load the next clip
  rebind               retry loading the current clip's audio
  export json|vtt PATH write this session's submissions
  quit";

fn run_command<A: AnnotationApi>(session: &mut Session<A>, line: &str) -> Result<Flow> {
    let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    session.clicked();

    match cmd {
        "" => {}
        "help" | "?" => println!("{HELP}"),
        "quit" | "exit" => return Ok(Flow::Quit),
        "play" => {
            let playing = session.play_pause().map_err(user_error)?;
            println!("{}", if playing { "playing" } else { "paused" });
        }
        "skip+" => print_time(session.skip_forward().map_err(user_error)?),
        "skip-" => print_time(session.skip_backward().map_err(user_error)?),
        "seek" => {
            let delta: f64 = rest.parse().context("seek takes a number of seconds")?;
            print_time(session.seek_relative(delta).map_err(user_error)?);
        }
        "tick" => {
            let secs: f64 = rest.parse().context("tick takes a number of seconds")?;
            match session.waveform_mut().surface_mut() {
                Some(surface) => surface.tick(secs),
                None => bail!("no audio loaded"),
            }
            session.pump_surface();
            print_time(session.current_time().map_err(user_error)?);
        }
        "volume" => {
            let level: f64 = rest.parse().context("volume takes a number")?;
            let applied = session.set_volume(level).map_err(user_error)?;
            println!("volume {applied:.2}");
        }
        "add" => {
            let id = session.add_region().map_err(user_error)?;
            println!("added region {}", session.regions().len());
            tracing::debug!(%id, "region added from terminal");
        }
        "label" | "comment" => {
            let (n, text) = rest.split_once(' ').unwrap_or((rest, ""));
            let id = region_at(session, n)?;
            let updated = if cmd == "label" {
                session.label_region(&id, text)
            } else {
                session.comment_region(&id, text)
            };
            if !updated {
                bail!("region {n} no longer exists");
            }
        }
        "rm" => {
            let id = region_at(session, rest)?;
            session.remove_region(&id);
        }
        "list" => list_regions(session),
        "next" => match session.advance() {
            Ok(outcome) => report(session, &outcome),
            Err(err) => bail!(err.user_message()),
        },
        "rebind" => session.rebind_waveform().map_err(user_error)?,
        "export" => {
            let (format, path) = rest.split_once(' ').context("usage: export json|vtt PATH")?;
            let format = match format {
                "json" => ExportFormat::Json,
                "vtt" => ExportFormat::Vtt,
                other => bail!("unknown export format '{other}'"),
            };
            let file = File::create(path.trim())
                .with_context(|| format!("failed to create {}", path.trim()))?;
            let written = session.export_history(file, format)?;
            println!("exported {written} submission(s)");
        }
        other => bail!("unknown command '{other}' (try 'help')"),
    }
    Ok(Flow::Continue)
}

fn user_error(err: clipmark::Error) -> anyhow::Error {
    anyhow::anyhow!(err.user_message())
}

fn region_at<A: AnnotationApi>(session: &Session<A>, n: &str) -> Result<RegionId> {
    let idx: usize = n.parse().context("regions are numbered from 1 (see 'list')")?;
    idx.checked_sub(1)
        .and_then(|i| session.regions().regions().get(i))
        .map(|r| r.id.clone())
        .with_context(|| format!("no region {idx}"))
}

fn list_regions<A: AnnotationApi>(session: &Session<A>) {
    if session.regions().is_empty() {
        println!("(no regions)");
        return;
    }
    for (i, region) in session.regions().regions().iter().enumerate() {
        let label = if region.has_label() {
            region.annotation.as_str()
        } else {
            "-"
        };
        print!(
            "{:>3}  {} - {}  {label}",
            i + 1,
            format_time(region.start),
            format_time(region.end)
        );
        if region.has_comment() {
            print!("  ({})", region.comment.trim());
        }
        println!();
    }
}

fn report<A: AnnotationApi>(session: &Session<A>, outcome: &AdvanceOutcome) {
    match outcome {
        AdvanceOutcome::Advanced {
            clip_id,
            suggested_regions,
        } => {
            let duration = session
                .waveform()
                .duration()
                .map(format_time)
                .unwrap_or_else(|| "?".to_owned());
            println!("clip {clip_id} ({duration})");
            if *suggested_regions > 0 {
                println!("{suggested_regions} suggested region(s); 'list' to review");
            }
        }
        AdvanceOutcome::Exhausted => println!("no more clips"),
    }
}

fn print_time(t: f64) {
    println!("{}", format_time(t));
}

fn prompt(out: &mut impl Write) -> io::Result<()> {
    write!(out, "> ")?;
    out.flush()
}
