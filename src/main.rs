//! Thin CLI layer: parse args, styled output, and call into biddle-core.
//! Crash-proof: panic caught and reported; all errors return Result.

use clap::{Arg, ArgAction, ArgMatches, Command};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::env;
use std::future::Future;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use biddle_core::{
    BiddleError, CatalogStore, Fetcher, HashContext, InstallSession, Layout,
    ListKind, PublishSession, ShellTaskRunner, TarGzArchiver,
};

// ---- UI helpers (no-op when stdout isn't a TTY) ----

fn use_color() -> bool {
    std::io::stdout().is_terminal()
        && env::var("NO_COLOR").unwrap_or_default().is_empty()
}

fn success(msg: &str) {
    if use_color() {
        println!("{}", msg.green());
    } else {
        println!("{}", msg);
    }
}

fn error(msg: &str) {
    if use_color() {
        eprintln!("{}", msg.red());
    } else {
        eprintln!("{}", msg);
    }
}

fn warning(msg: &str) {
    if use_color() {
        eprintln!("{}", msg.yellow());
    } else {
        eprintln!("{}", msg);
    }
}

fn info(msg: &str) {
    if use_color() {
        println!("{}", msg.cyan());
    } else {
        println!("{}", msg);
    }
}

fn dim(msg: &str) {
    if use_color() {
        println!("{}", msg.dimmed());
    } else {
        println!("{}", msg);
    }
}

/// Await a long-running operation; in quiet mode show a spinner until done.
async fn with_spinner<F, T>(message: &str, quiet: bool, fut: F) -> T
where
    F: Future<Output = T>,
{
    if !quiet || !std::io::stderr().is_terminal() {
        return fut.await;
    }
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner()
        .tick_chars("⠁⠂⠄⠈⠐⠠⠰⠸⠹")
        .template("{spinner:.dim} {msg}")
    {
        spinner.set_style(style);
    }
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(80));
    let out = fut.await;
    spinner.finish_and_clear();
    out
}

fn quiet_arg() -> Arg {
    Arg::new("quiet")
        .short('q')
        .long("quiet")
        .action(ArgAction::SetTrue)
        .help("Minimal output; show spinner when busy")
}

fn cli() -> Command {
    Command::new("biddle")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Publish applications as hashed archives and install them with verification")
        .after_help(
            "Examples:\n  biddle publish ./myapp\n  biddle install ~/.biddle/publications/myapp/myapp_1.0.0.tgz\n  biddle status\n  biddle list installed\n  biddle hash --string hello",
        )
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("copy")
                .about("Copy a file or directory tree into a destination directory")
                .arg(Arg::new("source").required(true).help("File or directory to copy"))
                .arg(Arg::new("destination").required(true).help("Directory to copy into")),
        )
        .subcommand(
            Command::new("get")
                .about("Fetch a URL or file into the downloads directory")
                .arg(Arg::new("location").required(true).help("URL or path"))
                .arg(Arg::new("directory").help("Directory to save into (default: downloads)")),
        )
        .subcommand(
            Command::new("hash")
                .about("Print the SHA-512 digest of a file or a string")
                .arg(Arg::new("file").required_unless_present("string").help("File to hash"))
                .arg(
                    Arg::new("string")
                        .long("string")
                        .value_name("TEXT")
                        .conflicts_with("file")
                        .help("Hash this text instead of a file"),
                ),
        )
        .subcommand(
            Command::new("install")
                .about("Install a published archive after verifying its hash")
                .arg(Arg::new("archive").required(true).help("Archive URL or path (.tgz)"))
                .arg(Arg::new("directory").help("Install location (default: applications/<name>)"))
                .arg(quiet_arg()),
        )
        .subcommand(
            Command::new("list")
                .about("List installed and/or published applications")
                .arg(
                    Arg::new("kind")
                        .value_parser(["installed", "published", "both"])
                        .default_value("both")
                        .help("Which catalog to list"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output machine-readable JSON"),
                ),
        )
        .subcommand(
            Command::new("publish")
                .about("Stage, archive, and hash an application and its variants")
                .arg(Arg::new("directory").required(true).help("Application directory containing package.json"))
                .arg(Arg::new("destination").help("Publications root (default: publications)"))
                .arg(quiet_arg()),
        )
        .subcommand(
            Command::new("remove")
                .about("Delete a file or directory tree")
                .arg(Arg::new("path").required(true).help("Path to remove")),
        )
        .subcommand(
            Command::new("status")
                .about("Compare installed versions with the latest published versions")
                .arg(Arg::new("name").help("Installed application (default: all)")),
        )
        .subcommand(
            Command::new("uninstall")
                .about("Remove an installed application")
                .arg(Arg::new("name").required(true).help("Application name")),
        )
        .subcommand(
            Command::new("unpublish")
                .about("Remove a published application and all of its archives")
                .arg(Arg::new("name").required(true).help("Application name")),
        )
        .subcommand(
            Command::new("unzip")
                .about("Unpack an archive")
                .arg(Arg::new("archive").required(true).help("Archive to unpack"))
                .arg(Arg::new("destination").help("Directory to unpack into (default: ./<archive name>)")),
        )
        .subcommand(
            Command::new("zip")
                .about("Archive a directory")
                .arg(Arg::new("path").required(true).help("Directory to archive"))
                .arg(Arg::new("destination").help("Directory for the archive (default: current directory)")),
        )
}

fn arg<'a>(m: &'a ArgMatches, name: &str) -> Option<&'a str> {
    m.get_one::<String>(name).map(|s| s.as_str())
}

fn required<'a>(m: &'a ArgMatches, name: &str) -> Result<&'a str, String> {
    arg(m, name).ok_or_else(|| format!("Missing argument: {}", name))
}

fn cwd() -> Result<PathBuf, String> {
    env::current_dir().map_err(|e| format!("Cannot read current directory: {}", e))
}

/// Home layout with `.biddlerc` applied; directories resolve against `base`.
fn layout_with_rc(rc_dir: &Path, base: Option<&Path>) -> Layout {
    let layout = Layout::from_env();
    let rc = biddle_core::load_rc(rc_dir);
    let base = base.map(Path::to_path_buf).unwrap_or_else(|| layout.home.clone());
    layout.with_rc(&rc, &base)
}

async fn prepare(layout: &Layout) -> Result<CatalogStore, String> {
    biddle_core::init_home(&layout.home)
        .map_err(|e| format!("Failed to initialize {}: {}", layout.home.display(), e))?;
    layout.ensure().await.map_err(|e| e.to_string())?;
    CatalogStore::load(layout).map_err(|e| e.to_string())
}

/// Absent entries are reported, not failed.
fn absent_or_err(err: BiddleError, verb: &str, name: &str, list: &str) -> Result<(), String> {
    match err {
        BiddleError::NotFound { .. } => {
            warning(&format!(
                "Attempted to {} {} which is absent from the list of {} applications.",
                verb, name, list
            ));
            Ok(())
        }
        other => Err(other.to_string()),
    }
}

async fn dispatch(matches: &ArgMatches) -> Result<(), String> {
    match matches.subcommand() {
        Some(("copy", sub)) => {
            let source = required(sub, "source")?;
            let destination = required(sub, "destination")?;
            let counts = biddle_core::copy(Path::new(source), Path::new(destination), &[])
                .await
                .map_err(|e| e.to_string())?;
            success(&format!(
                "Copied {} to {}: {} file(s), {} director(ies), {} symbolic link(s).",
                source, destination, counts.files, counts.dirs, counts.links
            ));
        }
        Some(("get", sub)) => {
            let location = required(sub, "location")?;
            let layout = layout_with_rc(&cwd()?, None);
            prepare(&layout).await?;
            let dir = arg(sub, "directory")
                .map(PathBuf::from)
                .unwrap_or_else(|| layout.downloads.clone());
            let fetcher = Fetcher::new().map_err(|e| e.to_string())?;
            let (path, _) = biddle_core::fetch::get(&fetcher, location, &dir)
                .await
                .map_err(|e| e.to_string())?;
            success(&format!("Saved {}", path.display()));
        }
        Some(("hash", sub)) => {
            let digest = match arg(sub, "string") {
                Some(text) => biddle_core::digest_str(text),
                None => {
                    let file = required(sub, "file")?;
                    biddle_core::digest_file(Path::new(file), HashContext::General)
                        .await
                        .map_err(|e| e.to_string())?
                }
            };
            println!("{}", digest);
        }
        Some(("install", sub)) => {
            let archive = required(sub, "archive")?;
            let quiet = sub.get_flag("quiet");
            let layout = layout_with_rc(&cwd()?, None);
            let mut store = prepare(&layout).await?;
            let fetcher = Fetcher::new().map_err(|e| e.to_string())?;
            let target = arg(sub, "directory").map(PathBuf::from);
            let mut session =
                InstallSession::new(&layout, &mut store, Arc::new(TarGzArchiver), &fetcher);
            let report = with_spinner(
                &format!("Installing {}", archive),
                quiet,
                session.run(archive, target.as_deref()),
            )
            .await
            .map_err(|e| e.to_string())?;
            success(&format!(
                "Installed {} {} at {}",
                report.name,
                report.version,
                report.location.display()
            ));
            dim(&format!("sha512 {}", report.digest));
        }
        Some(("list", sub)) => {
            let layout = layout_with_rc(&cwd()?, None);
            let store = prepare(&layout).await?;
            let kinds: &[(ListKind, &str)] = match arg(sub, "kind") {
                Some("installed") => &[(ListKind::Installed, "installed")],
                Some("published") => &[(ListKind::Published, "published")],
                _ => &[
                    (ListKind::Installed, "installed"),
                    (ListKind::Published, "published"),
                ],
            };
            if sub.get_flag("json") {
                let mut out = serde_json::Map::new();
                for (kind, label) in kinds {
                    let rows = serde_json::to_value(store.rows(*kind)).map_err(|e| e.to_string())?;
                    out.insert(label.to_string(), rows);
                }
                println!(
                    "{}",
                    serde_json::to_string_pretty(&out).map_err(|e| e.to_string())?
                );
                return Ok(());
            }
            for (kind, label) in kinds {
                let rows = store.rows(*kind);
                if rows.is_empty() {
                    dim(&format!("No applications {} by biddle.", label));
                    continue;
                }
                info(&format!("{} applications ({})", capitalize(label), rows.len()));
                let width = rows.iter().map(|r| r.name.len()).max().unwrap_or(0);
                for row in rows {
                    println!("  {:width$}  {}  {}", row.name, row.version, row.location, width = width);
                }
            }
        }
        Some(("publish", sub)) => {
            let source = PathBuf::from(required(sub, "directory")?);
            let quiet = sub.get_flag("quiet");
            let source_abs = biddle_core::utils::absolutize(&source).map_err(|e| e.to_string())?;
            let layout = layout_with_rc(&source_abs, Some(&source_abs));
            let mut store = prepare(&layout).await?;
            let destination = arg(sub, "destination").map(PathBuf::from);
            let mut session = PublishSession::new(
                &layout,
                &mut store,
                Arc::new(TarGzArchiver),
                Arc::new(ShellTaskRunner::default()),
            );
            let report = with_spinner(
                &format!("Publishing {}", source.display()),
                quiet,
                session.run(&source_abs, destination.as_deref()),
            )
            .await
            .map_err(|e| e.to_string())?;
            success(&format!(
                "Published {} {}{} to {}",
                report.name,
                report.version,
                if report.latest { " (latest)" } else { "" },
                report.directory.display()
            ));
            for archive in &report.archives {
                dim(&format!("  {}", archive.display()));
            }
            if report.task_failures > 0 {
                warning(&format!(
                    "{} task(s) failed; see {}",
                    report.task_failures,
                    layout.log_file().display()
                ));
            }
        }
        Some(("remove", sub)) => {
            let path = required(sub, "path")?;
            biddle_core::utils::remove_path(Path::new(path))
                .await
                .map_err(|e| e.to_string())?;
            success(&format!("Removed {}", path));
        }
        Some(("status", sub)) => {
            let layout = layout_with_rc(&cwd()?, None);
            let store = prepare(&layout).await?;
            let fetcher = Fetcher::new().map_err(|e| e.to_string())?;
            let reports = biddle_core::status(&store, &fetcher, arg(sub, "name"))
                .await
                .map_err(|e| e.to_string())?;
            for report in reports {
                match &report.published {
                    _ if report.is_current() => success(&format!(
                        "{} is up to date at version {}.",
                        report.name, report.installed
                    )),
                    Some(latest) => warning(&format!(
                        "{} is installed at version {}; the latest published version is {}.",
                        report.name, report.installed, latest
                    )),
                    None => dim(&format!(
                        "{} is installed at version {}; the published version could not be read.",
                        report.name, report.installed
                    )),
                }
            }
        }
        Some(("uninstall", sub)) => {
            let name = required(sub, "name")?;
            let layout = layout_with_rc(&cwd()?, None);
            let mut store = prepare(&layout).await?;
            match biddle_core::uninstall(&mut store, name).await {
                Ok(entry) => success(&format!("Uninstalled {} from {}", name, entry.location)),
                Err(e) => absent_or_err(e, "uninstall", name, "installed")?,
            }
        }
        Some(("unpublish", sub)) => {
            let name = required(sub, "name")?;
            let layout = layout_with_rc(&cwd()?, None);
            let mut store = prepare(&layout).await?;
            match biddle_core::unpublish(&mut store, name).await {
                Ok(entry) => success(&format!("Unpublished {} from {}", name, entry.directory)),
                Err(e) => absent_or_err(e, "unpublish", name, "published")?,
            }
        }
        Some(("unzip", sub)) => {
            let archive = PathBuf::from(required(sub, "archive")?);
            let destination = match arg(sub, "destination") {
                Some(d) => PathBuf::from(d),
                None => {
                    let stem = archive
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "unzipped".to_string());
                    cwd()?.join(stem)
                }
            };
            let (from, to) = (archive.clone(), destination.clone());
            tokio::task::spawn_blocking(move || {
                biddle_core::ArchiveTool::unarchive(&TarGzArchiver, &from, &to)
            })
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())?;
            success(&format!("Unpacked {} to {}", archive.display(), destination.display()));
        }
        Some(("zip", sub)) => {
            let source = PathBuf::from(required(sub, "path")?);
            let source = biddle_core::utils::absolutize(&source).map_err(|e| e.to_string())?;
            let dir = match arg(sub, "destination") {
                Some(d) => PathBuf::from(d),
                None => cwd()?,
            };
            let name = source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| format!("Cannot archive {}", source.display()))?;
            let out = dir.join(format!("{}.{}", name, biddle_core::archive::ARCHIVE_EXTENSION));
            let (from, to) = (source.clone(), out.clone());
            let written = tokio::task::spawn_blocking(move || {
                biddle_core::ArchiveTool::archive(&TarGzArchiver, &from, &to)
            })
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())?;
            let digest = biddle_core::digest_file(&written, HashContext::General)
                .await
                .map_err(|e| e.to_string())?;
            success(&format!("Archive written at {}", written.display()));
            dim(&format!("sha512 {}", digest));
        }
        _ => return Err("Unknown command. Run `biddle --help` for usage.".to_string()),
    }
    Ok(())
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn run() -> Result<(), String> {
    let matches = cli().get_matches();

    let quiet = matches
        .subcommand()
        .map(|(_, sub)| sub.try_get_one::<bool>("quiet").ok().flatten().copied().unwrap_or(false))
        .unwrap_or(false);
    if quiet {
        // set before the runtime starts any threads
        env::set_var("BIDDLE_QUIET", "1");
    }

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| format!("Failed to start async runtime: {}", e))?;
    runtime.block_on(dispatch(&matches))
}

fn main() {
    if !use_color() {
        colored::control::set_override(false);
    }

    let code = match std::panic::catch_unwind(run) {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            error(&e);
            1
        }
        Err(_) => {
            error("An unexpected error occurred. Please report this issue.");
            1
        }
    };
    std::process::exit(code);
}
