//! Purpose: Hold top-level CLI command dispatch for `itsdb`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: `info` reports missing tables without creating their files.
//! Invariants: Output helpers in `main.rs` own every stdout/stderr envelope.

use super::*;
use itsdb::api::{
    Selected, SuiteOptions, SuiteWriteOptions, TablesToWrite, TestSuite, split_columns,
};

pub(super) fn dispatch_command(
    command: Command,
    encoding: TextEncoding,
) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "itsdb", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Schema { profile } => {
            let suite = open_suite(&profile, encoding)?;
            println!("{}", suite.relations());
            Ok(RunOutcome::ok())
        }
        Command::Info { profile, tables } => {
            let mut suite = open_suite(&profile, encoding)?;
            let names = if tables.is_empty() {
                suite.relations().names().map(str::to_string).collect()
            } else {
                tables
            };
            let mut reports = Vec::with_capacity(names.len());
            for name in names {
                suite.relations().relation(&name)?;
                let exists = suite.exists(Some(&name));
                let (size, rows) = if exists {
                    (suite.size(Some(&name))?, Some(suite.table(&name)?.len()))
                } else {
                    (0, None)
                };
                reports.push(json!({
                    "table": name,
                    "exists": exists,
                    "size": size,
                    "rows": rows,
                }));
            }
            emit_json(json!({
                "path": profile.display().to_string(),
                "encoding": encoding.as_str(),
                "size": suite.size(None)?,
                "tables": reports,
            }));
            Ok(RunOutcome::ok())
        }
        Command::Select {
            profile,
            spec,
            mode,
        } => {
            let mut suite = open_suite(&profile, encoding)?;
            let rows = suite.select(&spec, None, mode.into())?;
            emit_rows(&rows);
            Ok(RunOutcome::ok())
        }
        Command::Join {
            profile,
            left,
            right,
            on,
            how,
            cols,
            mode,
        } => {
            let mut suite = open_suite(&profile, encoding)?;
            let on = on.as_deref().map(split_columns);
            let joined = suite.join(&left, &right, on.as_deref(), JoinHow::from(how.as_str()))?;
            let cols = match cols {
                Some(cols) => split_columns(&cols),
                None => joined.relation().field_names(),
            };
            let rows = joined.select(&cols, mode.into())?;
            emit_rows(&rows);
            Ok(RunOutcome::ok())
        }
        Command::Path {
            profile,
            source,
            target,
        } => {
            let suite = open_suite(&profile, encoding)?;
            let hops = suite
                .relations()
                .path(&source, &target)?
                .into_iter()
                .map(|(table, key)| json!({ "table": table, "key": key }))
                .collect::<Vec<_>>();
            emit_json(Value::Array(hops));
            Ok(RunOutcome::ok())
        }
        Command::Copy {
            profile,
            dest,
            tables,
            gzip,
        } => {
            let mut suite = open_suite(&profile, encoding)?;
            let selection = if tables.is_empty() {
                TablesToWrite::All
            } else {
                TablesToWrite::Named(tables.clone())
            };
            let written = if tables.is_empty() {
                suite.relations().names().map(str::to_string).collect()
            } else {
                tables
            };
            let path = suite.write(
                selection,
                &SuiteWriteOptions {
                    path: Some(dest),
                    gzip: gzip.then_some(true),
                    ..SuiteWriteOptions::default()
                },
            )?;
            emit_json(json!({
                "path": path.display().to_string(),
                "tables": written,
            }));
            Ok(RunOutcome::ok())
        }
    }
}

fn open_suite(profile: &Path, encoding: TextEncoding) -> Result<TestSuite, Error> {
    TestSuite::open_with(
        profile,
        SuiteOptions {
            encoding,
            ..SuiteOptions::default()
        },
    )
}

fn emit_rows(rows: &[Selected]) {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for row in rows {
        if writeln!(out, "{row}").is_err() {
            break;
        }
    }
}
