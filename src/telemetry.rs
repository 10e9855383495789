use std::cmp::Reverse;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt};

use crate::config::{TelemetrySettings, TraceSettings, project_dirs};

const TRACE_EXTENSION: &str = ".trace.jsonl";

/// Flushes the export writer when the process exits.
static EXPORT_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static EXPORT_PATH: OnceCell<PathBuf> = OnceCell::new();

/// Where dispatch traces go and what is already on disk.
#[derive(Debug, Clone)]
pub struct TraceReport {
    pub enabled: bool,
    pub directory: Option<PathBuf>,
    pub active_file: Option<PathBuf>,
    pub recent_files: Vec<PathBuf>,
}

/// An opened JSON export file and its background writer.
struct TraceExport {
    writer: NonBlocking,
    guard: WorkerGuard,
    path: PathBuf,
}

/// Console logging filtered by `RUST_LOG` (default `agrilink=info`, or `debug` when verbose),
/// plus a debug-level JSON export when traces are enabled. Later calls are no-ops.
pub fn init_tracing(service: &str, verbose: bool, telemetry: &TelemetrySettings) -> Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let fallback = if verbose { "agrilink=debug" } else { "agrilink=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let (export_layer, export) = match open_export(service, &telemetry.traces)? {
        Some(TraceExport {
            writer,
            guard,
            path,
        }) => {
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_current_span(true)
                .with_span_list(true)
                .with_filter(LevelFilter::DEBUG);
            (Some(layer), Some((guard, path)))
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(export_layer)
        .try_init()
        .is_ok();

    if let (true, Some((guard, path))) = (installed, export) {
        let _ = EXPORT_GUARD.set(guard);
        let _ = EXPORT_PATH.set(path);
    }
    Ok(())
}

pub fn trace_report(settings: &TelemetrySettings) -> Result<TraceReport> {
    let traces = &settings.traces;
    let directory = match export_directory(traces) {
        Ok(dir) => Some(dir),
        Err(err) if traces.enabled => return Err(err),
        Err(_) => None,
    };
    let recent_files = match &directory {
        Some(dir) => traces_newest_first(dir)?
            .into_iter()
            .take(traces.max_files)
            .collect(),
        None => Vec::new(),
    };

    Ok(TraceReport {
        enabled: traces.enabled,
        directory,
        active_file: EXPORT_PATH.get().cloned(),
        recent_files,
    })
}

fn open_export(service: &str, settings: &TraceSettings) -> Result<Option<TraceExport>> {
    if !settings.enabled {
        return Ok(None);
    }

    let directory = export_directory(settings)?;
    fs::create_dir_all(&directory)
        .with_context(|| format!("cannot create trace directory {}", directory.display()))?;
    let (file, path) = open_trace_file(service, &directory)?;
    prune_traces(&directory, settings.max_files, &path)?;

    let (writer, guard) = tracing_appender::non_blocking(file);
    Ok(Some(TraceExport {
        writer,
        guard,
        path,
    }))
}

fn export_directory(settings: &TraceSettings) -> Result<PathBuf> {
    match &settings.directory {
        Some(dir) => Ok(dir.clone()),
        None => Ok(project_dirs()?.cache_dir().join("traces")),
    }
}

/// Creates `<service>-<utc stamp>[-n].trace.jsonl`, numbering past files that already exist.
fn open_trace_file(service: &str, directory: &Path) -> Result<(File, PathBuf)> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    for attempt in 0u32.. {
        let name = match attempt {
            0 => format!("{service}-{stamp}{TRACE_EXTENSION}"),
            n => format!("{service}-{stamp}-{n}{TRACE_EXTENSION}"),
        };
        let path = directory.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((file, path)),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("cannot open trace file {}", path.display()));
            }
        }
    }
    anyhow::bail!("no free trace file name in {}", directory.display())
}

fn is_trace_file(path: &Path) -> bool {
    path.is_file()
        && path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(TRACE_EXTENSION))
}

fn traces_newest_first(directory: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("cannot list trace directory {}", directory.display()));
        }
    };

    let mut traces: Vec<_> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| is_trace_file(path))
        .filter_map(|path| {
            let modified = fs::metadata(&path).and_then(|meta| meta.modified()).ok()?;
            Some((modified, path))
        })
        .collect();
    traces.sort_by_key(|(modified, _)| Reverse(*modified));
    Ok(traces.into_iter().map(|(_, path)| path).collect())
}

/// Deletes older traces so at most `max_files` remain, `active` included. Zero keeps everything.
fn prune_traces(directory: &Path, max_files: usize, active: &Path) -> Result<()> {
    if max_files == 0 {
        return Ok(());
    }
    let stale = traces_newest_first(directory)?
        .into_iter()
        .filter(|path| path != active)
        .skip(max_files - 1);
    for path in stale {
        if let Err(err) = fs::remove_file(&path) {
            tracing::debug!(path = %path.display(), error = %err, "could not prune trace file");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_trace(directory: &Path, name: &str) -> PathBuf {
        let path = directory.join(name);
        fs::write(&path, b"{}\n").unwrap();
        path
    }

    #[test]
    fn pruning_keeps_the_active_file() {
        let dir = tempdir().unwrap();
        for index in 0..4 {
            write_trace(dir.path(), &format!("agrilink-{index}{TRACE_EXTENSION}"));
        }
        let unrelated = write_trace(dir.path(), "notes.txt");
        let (_, active) = open_trace_file("agrilink", dir.path()).unwrap();

        prune_traces(dir.path(), 3, &active).unwrap();

        let remaining = traces_newest_first(dir.path()).unwrap();
        assert_eq!(remaining.len(), 3);
        assert!(remaining.contains(&active));
        assert!(unrelated.exists());
    }

    #[test]
    fn report_lists_traces_even_when_export_is_off() {
        let dir = tempdir().unwrap();
        write_trace(dir.path(), &format!("agrilink-a{TRACE_EXTENSION}"));
        let settings = TelemetrySettings {
            traces: TraceSettings {
                enabled: false,
                directory: Some(dir.path().to_path_buf()),
                max_files: 10,
            },
        };
        let report = trace_report(&settings).unwrap();
        assert!(!report.enabled);
        assert_eq!(report.directory.as_deref(), Some(dir.path()));
        assert_eq!(report.recent_files.len(), 1);
    }

    #[test]
    fn trace_files_opened_in_the_same_second_get_distinct_names() {
        let dir = tempdir().unwrap();
        let (_, first) = open_trace_file("agrilink", dir.path()).unwrap();
        let (_, second) = open_trace_file("agrilink", dir.path()).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn missing_directory_lists_nothing() {
        let dir = tempdir().unwrap();
        assert!(traces_newest_first(&dir.path().join("absent")).unwrap().is_empty());
    }
}
