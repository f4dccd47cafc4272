use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::event::IndexedEvent;

#[derive(Debug, Default)]
pub struct WrittenFiles {
    pub compliant: usize,
    pub non_compliant: usize,
    pub paths: Vec<PathBuf>,
}

/// Write one host's events, replacing any files from a previous run.
/// A side with no events gets no file.
pub fn write_host_events(dir: &Path, hostname: &str, events: &[IndexedEvent]) -> Result<WrittenFiles> {
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;

    let stem = file_stem(hostname);
    let (passed, failed): (Vec<&IndexedEvent>, Vec<&IndexedEvent>) =
        events.iter().partition(|e| e.passed());

    let mut written = WrittenFiles {
        compliant: passed.len(),
        non_compliant: failed.len(),
        paths: Vec::new(),
    };
    for (suffix, batch) in [("compliant", &passed), ("noncompliant", &failed)] {
        let path = dir.join(format!("{}_{}.json", stem, suffix));
        if batch.is_empty() {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            continue;
        }
        write_ndjson(&path, batch)?;
        written.paths.push(path);
    }
    Ok(written)
}

fn write_ndjson(path: &Path, events: &[&IndexedEvent]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
    let mut out = BufWriter::new(file);
    for event in events {
        serde_json::to_writer(&mut out, event)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

/// Read every `*.json` file in `dir`, in file name order. Blank lines are skipped.
pub fn read_events(dir: &Path) -> Result<Vec<IndexedEvent>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read {:?}", dir))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();

    let mut events = Vec::new();
    for path in files {
        let reader = BufReader::new(File::open(&path)?);
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event = serde_json::from_str(&line)
                .with_context(|| format!("{}:{}: invalid event", path.display(), i + 1))?;
            events.push(event);
        }
    }
    Ok(events)
}

fn file_stem(hostname: &str) -> String {
    hostname
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect()
}

// ── Tests ──
