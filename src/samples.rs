use anyhow::{Context, Result, bail};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One file loaded from the sample directory. Immutable once loaded; clones
/// share the buffer.
#[derive(Debug, Clone)]
pub struct Sample {
    pub name: String,
    pub content: Bytes,
}

impl Sample {
    pub fn new(name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }

    pub fn content_type(&self) -> &'static str {
        content_type_for(&self.name)
    }
}

/// Lists the regular files in `dir` that match `patterns` and fit under
/// `max_file_bytes` (0 disables the guard), sorted by path. Nothing is read.
pub fn scan(dir: &Path, patterns: &[String], max_file_bytes: u64) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        bail!("sample directory does not exist: {}", dir.display());
    }
    if !dir.is_dir() {
        bail!("sample path is not a directory: {}", dir.display());
    }

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("reading sample directory: {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !(patterns.is_empty() || patterns.iter().any(|p| matches_pattern(p, name))) {
            continue;
        }
        if max_file_bytes > 0 {
            let len = entry
                .metadata()
                .with_context(|| format!("stat sample: {}", path.display()))?
                .len();
            if len > max_file_bytes {
                warn!(
                    "skipping {} ({len} bytes > max_file_bytes {max_file_bytes})",
                    path.display()
                );
                continue;
            }
        }
        paths.push(path);
    }
    paths.sort();

    if paths.is_empty() {
        bail!(
            "no sample files found in {} (patterns: {:?})",
            dir.display(),
            patterns
        );
    }
    Ok(paths)
}

/// Non-empty, ordered sample list that batches draw from cyclically.
#[derive(Debug, Clone)]
pub struct SampleSet {
    samples: Vec<Sample>,
}

impl SampleSet {
    /// Reads every file [`scan`] selects, then replicates the list `repeat`
    /// times.
    pub fn load(dir: &Path, patterns: &[String], repeat: usize, max_file_bytes: u64) -> Result<Self> {
        let paths = scan(dir, patterns, max_file_bytes)?;
        let mut loaded = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("reading sample: {}", path.display()))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            loaded.push(Sample::new(name, bytes));
        }

        let unique = loaded.len();
        let set = Self::from_samples(loaded, repeat)
            .with_context(|| format!("loading samples from {}", dir.display()))?;
        info!(
            "loaded {} sample files from {} ({} after repeat x{}, {} bytes)",
            unique,
            dir.display(),
            set.len(),
            repeat.max(1),
            set.total_bytes()
        );
        Ok(set)
    }

    pub fn from_samples(samples: Vec<Sample>, repeat: usize) -> Result<Self> {
        if samples.is_empty() {
            bail!("sample set is empty");
        }
        let repeat = repeat.max(1);
        let mut all = Vec::with_capacity(samples.len() * repeat);
        for _ in 0..repeat {
            all.extend(samples.iter().cloned());
        }
        Ok(Self { samples: all })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Cyclic access; `index` wraps around the set.
    pub fn get(&self, index: usize) -> &Sample {
        &self.samples[index % self.samples.len()]
    }

    /// The `batch_size` samples that make up batch `batch_id`. Batches are
    /// numbered from 1; batch n starts at sample `(n - 1) * batch_size`.
    pub fn batch(&self, batch_id: u64, batch_size: usize) -> Vec<Sample> {
        let start = batch_id.saturating_sub(1) as usize * batch_size;
        (start..start + batch_size)
            .map(|i| self.get(i).clone())
            .collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.samples.iter().map(Sample::size).sum()
    }
}

/// `*` matches any run of characters; everything else is literal.
pub fn matches_pattern(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }
    let mut rest = name;
    for (i, part) in parts.iter().enumerate() {
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

pub fn content_type_for(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        None | Some("txt") | Some("log") => "text/plain",
        Some("pdf") => "application/pdf",
        Some("json") => "application/json",
        Some("csv") => "text/csv",
        Some("html") | Some("htm") => "text/html",
        Some("xml") => "application/xml",
        Some("docx") => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some(_) => "application/octet-stream",
    }
}
