use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use chrono::{Days, NaiveDate};
use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::{debug, info, warn};

use simbridge_types::{ArchiveConfig, BridgeError, Result};

type DiskUsage = Box<dyn Fn(&Path) -> io::Result<f64> + Send + Sync>;

/// What one archive pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArchiveReport {
    pub compressed: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    pub failures: Vec<String>,
}

/// Compresses finished engine log files and prunes old run outputs when the
/// disk fills up.
///
/// Run outputs live side by side under one root (the parent of the current
/// log directory unless configured), each named with a `YYYYMMDD` prefix.
/// Log files are named `<kind>.<period>.log` where the period is
/// `HHMMSS-HHMMSS` or `DDHHMMSS-DDHHMMSS` of simulation time.
pub struct LogArchiver {
    config: ArchiveConfig,
    disk_usage: DiskUsage,
}

impl LogArchiver {
    pub fn new(config: ArchiveConfig) -> Self {
        Self {
            config,
            disk_usage: Box::new(filesystem_usage),
        }
    }

    /// Replace the disk usage reader, which returns the used fraction in `[0, 1]`.
    pub fn with_disk_usage(mut self, usage: impl Fn(&Path) -> io::Result<f64> + Send + Sync + 'static) -> Self {
        self.disk_usage = Box::new(usage);
        self
    }

    pub fn log_root(&self, log_dir: &str) -> Option<PathBuf> {
        match &self.config.outputs_dir {
            Some(dir) => Some(PathBuf::from(dir)),
            None => Path::new(log_dir).parent().map(Path::to_path_buf),
        }
    }

    /// Compress every log whose period ended before `simulation_timestamp`.
    /// With `start`, logs of earlier runs are compressed regardless of period.
    pub fn run(
        &self,
        log_dir: Option<&str>,
        simulation_timestamp: i64,
        start: bool,
        today: NaiveDate,
    ) -> Result<ArchiveReport> {
        let mut report = ArchiveReport::default();
        let Some(log_dir) = log_dir else {
            return Ok(report);
        };
        let Some(root) = self.log_root(log_dir) else {
            return Ok(report);
        };
        let current = Path::new(log_dir);

        for output_dir in list(&root)? {
            if !output_dir.is_dir() {
                continue;
            }
            let earlier_run = start && !same_path(&output_dir, current);
            let log_files = match list(&output_dir) {
                Ok(files) => files,
                Err(e) => {
                    report.failures.push(e.to_string());
                    continue;
                }
            };
            for log_file in log_files {
                let Some(end) = log_file
                    .file_name()
                    .and_then(|n| n.to_str())
                    .filter(|n| n.ends_with(".log"))
                    .and_then(log_period_end)
                else {
                    continue;
                };
                if end >= simulation_timestamp && !earlier_run {
                    continue;
                }
                match compress(&log_file) {
                    Ok(archive) => {
                        debug!(file = %log_file.display(), archive = %archive.display(), "log compressed");
                        report.compressed.push(archive);
                    }
                    Err(e) => report
                        .failures
                        .push(format!("failed to compress {}: {e}", log_file.display())),
                }
            }
        }
        if !report.compressed.is_empty() {
            info!(count = report.compressed.len(), "compressed finished log files");
        }

        self.enforce_retention(&root, today, &mut report)?;
        Ok(report)
    }

    fn enforce_retention(&self, root: &Path, today: NaiveDate, report: &mut ArchiveReport) -> Result<()> {
        let usage = |path: &Path| (self.disk_usage)(path).map_err(|e| BridgeError::Archive(e.to_string()));
        if usage(root)? <= self.config.disk_usage_limit {
            return Ok(());
        }
        let cutoff = today
            .checked_sub_days(Days::new(self.config.retention_days.max(0) as u64))
            .unwrap_or(today);
        warn!(limit = self.config.disk_usage_limit, %cutoff, "disk usage over limit, removing old outputs");

        let mut outputs = list(root)?;
        outputs.sort_by_key(|p| name_prefix(p, 13));
        for output in outputs {
            let Some(date) = name_prefix(&output, 8).and_then(|d| NaiveDate::parse_from_str(&d, "%Y%m%d").ok())
            else {
                continue;
            };
            if date >= cutoff {
                continue;
            }
            let removed = if output.is_dir() {
                std::fs::remove_dir_all(&output)
            } else if output.extension().is_some_and(|e| e == "gz" || e == "zip") {
                std::fs::remove_file(&output)
            } else {
                continue;
            };
            match removed {
                Ok(()) => {
                    info!(output = %output.display(), "removed old output");
                    report.removed.push(output);
                    if usage(root)? <= self.config.disk_usage_limit {
                        break;
                    }
                }
                Err(e) => report
                    .failures
                    .push(format!("failed to remove {}: {e}", output.display())),
            }
        }
        Ok(())
    }
}

fn list(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| BridgeError::Archive(format!("failed to list {}: {e}", dir.display())))?;
    Ok(entries.flatten().map(|e| e.path()).collect())
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn name_prefix(path: &Path, len: usize) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    Some(name.chars().take(len).collect())
}

/// Simulation time (ns) at which the period of a log file ends.
fn log_period_end(file_name: &str) -> Option<i64> {
    let period = file_name.split('.').nth(1)?;
    let end = period.split('-').nth(1)?;
    let field = |range: std::ops::Range<usize>| end.get(range)?.parse::<i64>().ok();
    let seconds = if period.len() == 13 {
        field(0..2)? * 3_600 + field(2..4)? * 60 + field(4..end.len())?
    } else {
        field(0..2)? * 86_400 + field(2..4)? * 3_600 + field(4..6)? * 60 + field(6..end.len())?
    };
    Some(seconds * 1_000_000_000)
}

/// Gzip `path` to `path.gz` and remove the original.
fn compress(path: &Path) -> io::Result<PathBuf> {
    let mut archive = path.as_os_str().to_owned();
    archive.push(".gz");
    let archive = PathBuf::from(archive);

    let mut input = BufReader::new(File::open(path)?);
    let mut encoder = GzEncoder::new(BufWriter::new(File::create(&archive)?), Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    std::fs::remove_file(path)?;
    Ok(archive)
}

#[cfg(unix)]
fn filesystem_usage(path: &Path) -> io::Result<f64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: statvfs is plain old data and is fully written on success.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    if stat.f_blocks == 0 {
        return Ok(0.0);
    }
    Ok(1.0 - stat.f_bavail as f64 / stat.f_blocks as f64)
}

#[cfg(not(unix))]
fn filesystem_usage(_path: &Path) -> io::Result<f64> {
    Ok(0.0)
}
