//! Purpose: `itsdb` CLI entry point for inspecting and copying test-suite profiles.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Commands emit stable stdout formats (JSON lines, or raw rows for `--mode row`).
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: All profile access goes through `api::TestSuite`.
#![allow(clippy::result_large_err)]
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser, Subcommand, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use itsdb::api::{Error, ErrorKind, JoinHow, SelectMode, TextEncoding, to_exit_code};
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

mod command_dispatch;

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                let args: Vec<String> = std::env::args().collect();
                let message = clap_error_summary(&err);
                let hint = usage_hint(&args);
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(message)
                        .with_hint(hint),
                    ColorMode::Auto,
                ));
            }
        },
    };

    let color_mode = cli.color;
    command_dispatch::dispatch_command(cli.command, cli.encoding)
        .map_err(add_hint)
        .map_err(|err| (err, color_mode))
}

#[derive(Parser)]
#[command(
    name = "itsdb",
    version,
    about = "Inspect and copy [incr tsdb()] test-suite profiles",
    long_about = None,
    after_help = r#"EXAMPLES
  $ itsdb schema ./profile
  $ itsdb info ./profile item parse
  $ itsdb select ./profile item:i-id@i-input
  $ itsdb join ./profile item parse --how left --cols i-id@parse:readings
  $ itsdb path ./profile item result
  $ itsdb copy ./profile ./backup --gzip

NOTES
  - Set RUST_LOG=debug to see table loads and file rewrites on stderr."#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        default_value = "utf-8",
        value_parser = parse_encoding,
        help = "Text encoding of table files: utf-8|latin-1"
    )]
    encoding: TextEncoding,
    #[arg(
        long,
        global = true,
        default_value = "auto",
        value_enum,
        help = "Colorize error text on a terminal: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

fn parse_encoding(input: &str) -> Result<TextEncoding, String> {
    input
        .parse::<TextEncoding>()
        .map_err(|err| err.message().unwrap_or("invalid encoding").to_string())
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ModeCli {
    List,
    Dict,
    Row,
}

impl From<ModeCli> for SelectMode {
    fn from(mode: ModeCli) -> Self {
        match mode {
            ModeCli::List => SelectMode::List,
            ModeCli::Dict => SelectMode::Dict,
            ModeCli::Row => SelectMode::Row,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Print the relations schema of a profile",
        after_help = r#"EXAMPLES
  $ itsdb schema ./profile"#
    )]
    Schema {
        #[arg(help = "Profile directory", value_hint = ValueHint::DirPath)]
        profile: PathBuf,
    },
    #[command(
        about = "Report which tables exist, their on-disk size and row counts",
        after_help = r#"EXAMPLES
  $ itsdb info ./profile
  $ itsdb info ./profile item parse"#
    )]
    Info {
        #[arg(help = "Profile directory", value_hint = ValueHint::DirPath)]
        profile: PathBuf,
        #[arg(help = "Tables to report (default: all)")]
        tables: Vec<String>,
    },
    #[command(
        about = "Select columns from a table",
        long_about = r#"Select columns from a table using a data specifier.

Specifiers: `table`, `table:col`, `table:col1@col2`, or `:col` (the table is
found by searching the schema)."#,
        after_help = r#"EXAMPLES
  $ itsdb select ./profile item
  $ itsdb select ./profile item:i-id@i-input --mode dict
  $ itsdb select ./profile :i-input --mode row"#
    )]
    Select {
        #[arg(help = "Profile directory", value_hint = ValueHint::DirPath)]
        profile: PathBuf,
        #[arg(help = "Data specifier, e.g. item:i-id@i-input")]
        spec: String,
        #[arg(long, value_enum, default_value = "list", help = "Output shape: list|dict|row")]
        mode: ModeCli,
    },
    #[command(
        about = "Join two tables and print the joined rows",
        after_help = r#"EXAMPLES
  $ itsdb join ./profile item parse
  $ itsdb join ./profile item parse --on i-id --how left --mode dict"#
    )]
    Join {
        #[arg(help = "Profile directory", value_hint = ValueHint::DirPath)]
        profile: PathBuf,
        #[arg(help = "Left table")]
        left: String,
        #[arg(help = "Right table")]
        right: String,
        #[arg(long, help = "Pivot columns joined by @ (default: shared key fields)")]
        on: Option<String>,
        #[arg(long, default_value = "inner", help = "Join method: inner|left")]
        how: String,
        #[arg(long, help = "Columns to print, joined by @ (default: all)")]
        cols: Option<String>,
        #[arg(long, value_enum, default_value = "list", help = "Output shape: list|dict|row")]
        mode: ModeCli,
    },
    #[command(
        about = "Show the key hops linking two tables",
        after_help = r#"EXAMPLES
  $ itsdb path ./profile item result"#
    )]
    Path {
        #[arg(help = "Profile directory", value_hint = ValueHint::DirPath)]
        profile: PathBuf,
        #[arg(help = "Source table (may be a + joined name)")]
        source: String,
        #[arg(help = "Target table (may be a + joined name)")]
        target: String,
    },
    #[command(
        about = "Write a profile (or some of its tables) to another directory",
        after_help = r#"EXAMPLES
  $ itsdb copy ./profile ./backup
  $ itsdb copy ./profile ./subset --table item --table parse --gzip"#
    )]
    Copy {
        #[arg(help = "Profile directory", value_hint = ValueHint::DirPath)]
        profile: PathBuf,
        #[arg(help = "Destination directory (created if missing)", value_hint = ValueHint::DirPath)]
        dest: PathBuf,
        #[arg(long = "table", help = "Table to copy (repeatable; default: all)")]
        tables: Vec<String>,
        #[arg(long, help = "Compress non-empty tables with gzip")]
        gzip: bool,
    },
    #[command(
        about = "Generate shell completions",
        after_help = r#"EXAMPLES
  $ itsdb completion bash > ~/.local/share/bash-completion/completions/itsdb
  $ itsdb completion zsh > ~/.zfunc/_itsdb"#
    )]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    let message = match err.kind() {
        ErrorKind::NotFound => "profile or table not found",
        ErrorKind::SchemaParse => "invalid relations file",
        ErrorKind::FieldCountMismatch => "row does not match its relation",
        ErrorKind::AmbiguousColumn => "column name matches more than one table",
        ErrorKind::NoPath => "tables are not linked by any key",
        ErrorKind::InvalidValue => "value cannot be read as its field's datatype",
        ErrorKind::Io => "profile i/o failed",
        kind => return format!("{kind:?} error").to_lowercase(),
    };
    message.to_string()
}

fn root_cause(err: &Error) -> Option<String> {
    let mut cause = std::error::Error::source(err)?;
    while let Some(next) = cause.source() {
        cause = next;
    }
    Some(cause.to_string())
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(row) = err.row() {
        inner.insert("row".to_string(), json!(row));
    }
    if let Some(line) = err.line() {
        inner.insert("line".to_string(), json!(line));
    }
    if let Some(cause) = root_cause(err) {
        inner.insert("cause".to_string(), json!(cause));
    }
    json!({ "error": inner })
}

fn error_text(err: &Error, use_color: bool) -> String {
    let label = |name: &str| {
        if use_color {
            format!("\u{1b}[33m{name}:\u{1b}[0m")
        } else {
            format!("{name}:")
        }
    };
    let mut text = if use_color {
        format!("\u{1b}[31merror:\u{1b}[0m {}", error_message(err))
    } else {
        format!("error: {}", error_message(err))
    };
    let location = match (err.path(), err.line(), err.row()) {
        (Some(path), Some(line), _) => Some(format!("{}:{line}", path.display())),
        (Some(path), None, Some(row)) => Some(format!("{} (row {row})", path.display())),
        (Some(path), None, None) => Some(path.display().to_string()),
        (None, Some(line), _) => Some(format!("line {line}")),
        (None, None, Some(row)) => Some(format!("row {row}")),
        (None, None, None) => None,
    };
    if let Some(location) = location {
        text.push_str(&format!("\n{} {location}", label("at")));
    }
    if let Some(hint) = err.hint() {
        text.push_str(&format!("\n{} {hint}", label("hint")));
    }
    if let Some(cause) = root_cause(err) {
        text.push_str(&format!("\n{} {cause}", label("caused by")));
    }
    text
}

/// Attach a next step to errors that reach the CLI without one.
fn add_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    let hint = match err.kind() {
        ErrorKind::NotFound => "Check the profile path and table names; `itsdb schema <profile>` lists the tables.",
        ErrorKind::NoPath => "Run `itsdb schema <profile>` to see which key fields the tables share.",
        ErrorKind::FieldCountMismatch => "Each row needs one @-separated value per field in the relations file.",
        ErrorKind::InvalidValue => "Check the file's text encoding (--encoding) and the field datatypes.",
        ErrorKind::Io => "Check that the profile directory is readable and writable.",
        _ => return err,
    };
    err.with_hint(hint)
}

/// First line of a clap error without its `error:` prefix.
fn clap_error_summary(err: &clap::Error) -> String {
    err.to_string()
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.strip_prefix("error:").unwrap_or(line).trim().to_string())
        .unwrap_or_else(|| "invalid arguments".to_string())
}

/// `--help` pointer for the subcommand named on the command line, if any.
fn usage_hint(args: &[String]) -> String {
    let cmd = Cli::command();
    let subcommand = args
        .iter()
        .skip(1)
        .find_map(|arg| cmd.find_subcommand(arg).map(|sub| sub.get_name().to_string()));
    match subcommand {
        Some(name) => format!("Try `itsdb {name} --help`."),
        None => "Try `itsdb --help`.".to_string(),
    }
}
