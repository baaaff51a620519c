//! The build log (§4.H): an append-only, TSV-per-line record of the last
//! successful invocation of each output, used by dependency scanning to
//! detect command-line changes (`command_hash`). Grounded in the teacher's
//! `db.rs` for its open-or-create-and-append idiom, but the on-disk format
//! here is the text format the spec requires rather than n2's binary one.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};

pub const CURRENT_VERSION: u32 = 5;
const MAX_LINE_LEN: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry {
    pub command_hash: u64,
    pub start_ms: u32,
    pub end_ms: u32,
    pub mtime: i64,
}

#[derive(Default)]
pub struct BuildLog {
    entries: HashMap<String, LogEntry>,
}

impl BuildLog {
    pub fn entries(&self) -> &HashMap<String, LogEntry> {
        &self.entries
    }

    pub fn lookup(&self, output: &str) -> Option<&LogEntry> {
        self.entries.get(output)
    }

    /// Parse an already-read buildlog text blob. Lines over `MAX_LINE_LEN`
    /// are skipped; a duplicate `# ninja log vN` header mid-file is
    /// tolerated. Later entries for the same output win.
    pub fn load(text: &str) -> Self {
        let mut entries = HashMap::new();
        for line in text.lines() {
            if line.len() > MAX_LINE_LEN {
                continue;
            }
            if line.starts_with("# ninja log v") {
                continue;
            }
            let mut fields = line.splitn(5, '\t');
            let (Some(start), Some(end), Some(mtime), Some(output), Some(hash)) = (
                fields.next(),
                fields.next(),
                fields.next(),
                fields.next(),
                fields.next(),
            ) else {
                continue;
            };
            let (Ok(start_ms), Ok(end_ms), Ok(mtime), Ok(command_hash)) = (
                start.parse::<u32>(),
                end.parse::<u32>(),
                mtime.parse::<i64>(),
                u64::from_str_radix(hash, 16),
            ) else {
                continue;
            };
            entries.insert(
                output.to_owned(),
                LogEntry {
                    command_hash,
                    start_ms,
                    end_ms,
                    mtime,
                },
            );
        }
        BuildLog { entries }
    }

    pub fn from_map(entries: HashMap<String, LogEntry>) -> Self {
        BuildLog { entries }
    }
}

/// An open, append-mode handle to the on-disk log.
pub struct BuildLogWriter {
    file: File,
}

impl BuildLogWriter {
    /// Open (creating if absent) the log at `path`, returning both the
    /// parsed in-memory log and a writer for appending further entries.
    pub fn open(path: &str) -> Result<(BuildLog, Self)> {
        match OpenOptions::new().read(true).open(path) {
            Ok(f) => {
                let mut reader = BufReader::new(f);
                let mut text = String::new();
                let mut line = String::new();
                loop {
                    line.clear();
                    let n = reader.read_line(&mut line).unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    if line.len() <= MAX_LINE_LEN {
                        text.push_str(&line);
                    }
                }
                let log = BuildLog::load(&text);
                let file = OpenOptions::new()
                    .append(true)
                    .open(path)
                    .with_context(|| format!("reopening build log {path} for append"))?;
                Ok((log, BuildLogWriter { file }))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let mut file = File::create(path)
                    .with_context(|| format!("creating build log {path}"))?;
                writeln!(file, "# ninja log v{CURRENT_VERSION}")?;
                file.flush()?;
                Ok((BuildLog::default(), BuildLogWriter { file }))
            }
            Err(err) => bail!(err),
        }
    }

    /// Append one record per output of the edge, all sharing `command_hash`,
    /// and mirror it into `log` so a lookup later in the same process sees
    /// it without a reload (same pattern as `DepsLogWriter::record_deps`).
    pub fn record(
        &mut self,
        log: &mut BuildLog,
        outputs: &[String],
        start_ms: u32,
        end_ms: u32,
        mtime: i64,
        command_hash: u64,
    ) -> Result<()> {
        for output in outputs {
            writeln!(
                self.file,
                "{start_ms}\t{end_ms}\t{mtime}\t{output}\t{command_hash:x}"
            )?;
            log.entries.insert(
                output.clone(),
                LogEntry {
                    command_hash,
                    start_ms,
                    end_ms,
                    mtime,
                },
            );
        }
        self.file.flush()?;
        Ok(())
    }
}

/// Rewrite `path` keeping only entries whose output `is_live` accepts,
/// atomically replacing the original file (§4.H recompaction).
pub fn recompact(path: &str, log: &BuildLog, is_live: impl Fn(&str) -> bool) -> Result<()> {
    let tmp_path = format!("{path}.recompact");
    let mut tmp = File::create(&tmp_path)?;
    writeln!(tmp, "# ninja log v{CURRENT_VERSION}")?;
    for (output, entry) in &log.entries {
        if is_live(output) {
            writeln!(
                tmp,
                "{}\t{}\t{}\t{}\t{:x}",
                entry.start_ms, entry.end_ms, entry.mtime, output, entry.command_hash
            )?;
        }
    }
    tmp.flush()?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
