use crate::{
    config::Config,
    metrics::{ErrorGroup, RunSummary, SweepSummary},
    util::{ensure_dir, sha256_hex},
};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

/// First 16 hex chars of sha256(effective config + start timestamp).
pub fn run_id(cfg: &Config, started_at: &str) -> String {
    let digest = sha256_hex(format!("{}\n{started_at}", cfg.normalized_for_hash()).as_bytes());
    digest[..16].to_string()
}

/// Human-readable block for one run.
pub fn render_summary(s: &RunSummary) -> String {
    let mut out = String::new();
    let m = &s.meta;
    let _ = writeln!(out, "== {} ({}) ==", m.label, m.mode);
    match m.target_files_per_second {
        Some(rate) => {
            let _ = writeln!(out, "target rate:       {rate} files/s");
        }
        None => {
            let _ = writeln!(out, "concurrency:       {}", m.concurrency);
        }
    }
    if let Some(fleet) = m.fleet_count {
        let _ = writeln!(out, "fleet count:       {fleet}");
    }
    let _ = writeln!(out, "batch size:        {}", m.batch_size);
    let _ = writeln!(
        out,
        "jobs:              {} total, {} ok, {} failed, {} timed out",
        s.total_jobs, s.successful_jobs, s.failed_jobs, s.timed_out
    );
    if s.failed_jobs > 0 {
        let _ = writeln!(
            out,
            "  failures:        {} submit, {} parse, {} server",
            s.submit_failed, s.parse_errors, s.server_failed
        );
    }
    let _ = writeln!(out, "error rate:        {:.2}%", s.error_rate);
    let _ = writeln!(
        out,
        "files:             {} ({} bytes)",
        s.total_files, s.total_bytes
    );
    let _ = writeln!(out, "wall clock:        {:.2}s", s.wall_seconds);
    let _ = writeln!(
        out,
        "throughput:        {:.3} jobs/s, {:.3} files/s, {:.1} bytes/s",
        s.jobs_per_second, s.files_per_second, s.bytes_per_second
    );
    let l = &s.submit_latency;
    let _ = writeln!(
        out,
        "submit latency ms: avg {:.1} min {:.1} max {:.1} p50 {:.1} p95 {:.1} p99 {:.1}",
        l.avg_ms, l.min_ms, l.max_ms, l.p50_ms, l.p95_ms, l.p99_ms
    );
    let d = &s.job_duration;
    if d.count > 0 {
        let _ = writeln!(
            out,
            "job duration ms:   avg {:.1} min {:.1} max {:.1} p50 {:.1} p95 {:.1} p99 {:.1}",
            d.avg_ms, d.min_ms, d.max_ms, d.p50_ms, d.p95_ms, d.p99_ms
        );
        let _ = writeln!(out, "avg poll attempts: {:.2}", s.avg_poll_attempts);
    }
    if m.interrupted {
        let _ = writeln!(
            out,
            "INTERRUPTED: {} of {} planned units finished",
            s.total_jobs, m.planned_units
        );
    }
    out
}

pub fn render_errors(groups: &[ErrorGroup]) -> String {
    if groups.is_empty() {
        return String::new();
    }
    let mut out = String::from("errors:\n");
    for g in groups {
        let _ = writeln!(out, "  {:>5}x {} {}", g.count, g.state, g.detail);
    }
    out
}

pub fn render_sweep_table(sweep: &SweepSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<28} {:>7} {:>7} {:>8} {:>10} {:>10} {:>10} {:>10}",
        "stage", "jobs", "ok", "err%", "files/s", "sub p50", "sub p95", "job p95"
    );
    for s in sweep.stages() {
        let _ = writeln!(
            out,
            "{:<28} {:>7} {:>7} {:>8.2} {:>10.3} {:>10.1} {:>10.1} {:>10.1}",
            s.meta.label,
            s.total_jobs,
            s.successful_jobs,
            s.error_rate,
            s.files_per_second,
            s.submit_latency.p50_ms,
            s.submit_latency.p95_ms,
            s.job_duration.p95_ms
        );
    }
    let t = sweep.totals();
    let _ = writeln!(
        out,
        "{} stages, {} jobs, {} ok, overall error rate {:.2}%",
        t.stages, t.total_jobs, t.successful_jobs, t.overall_error_rate
    );
    out
}

/// Tab-separated header plus one row per summary.
pub fn render_tsv(rows: &[&RunSummary]) -> Result<String> {
    let mut buf = Vec::new();
    write_records(&mut buf, rows, b'\t')?;
    String::from_utf8(buf).with_context(|| "TSV output is not UTF-8")
}

fn write_records<W: std::io::Write>(out: W, rows: &[&RunSummary], delimiter: u8) -> Result<()> {
    let mut w = csv::WriterBuilder::new().delimiter(delimiter).from_writer(out);
    if let Some(first) = rows.first() {
        w.write_record(first.record().iter().map(|(k, _)| *k))?;
    }
    for row in rows {
        w.write_record(row.record().iter().map(|(_, v)| v.as_str()))?;
    }
    w.flush()?;
    Ok(())
}

/// Writes run artifacts under `<output.dir>/<run_id>/`.
pub struct Exporter {
    cfg: Config,
    dir: PathBuf,
}

impl Exporter {
    pub fn create(cfg: &Config, run_id: &str) -> Result<Self> {
        let dir = Path::new(&cfg.output.dir).join(run_id);
        ensure_dir(&dir)?;
        info!("run_id={run_id} out={}", dir.display());
        Ok(Self {
            cfg: cfg.clone(),
            dir,
        })
    }

    /// Writes the delimited summaries, the JSON view and, when enabled, the
    /// raw outcomes and the effective configuration.
    pub fn write<T: Serialize, O: Serialize + ?Sized>(
        &self,
        rows: &[&RunSummary],
        json_view: &T,
        outcomes: &O,
    ) -> Result<()> {
        let out = &self.cfg.output;
        if out.write_csv {
            self.write_delimited("summary.csv", rows, b',')?;
        }
        if out.write_tsv {
            self.write_delimited("summary.tsv", rows, b'\t')?;
        }
        if out.write_json {
            self.write_json("summary.json", json_view)?;
        }
        if out.write_outcomes {
            self.write_json("outcomes.json", outcomes)?;
        }
        if out.dump_effective_config {
            self.write_effective_config()?;
        }
        Ok(())
    }

    fn write_delimited(&self, name: &str, rows: &[&RunSummary], delimiter: u8) -> Result<()> {
        let path = self.dir.join(name);
        let file = std::fs::File::create(&path)
            .with_context(|| format!("create {}", path.display()))?;
        write_records(file, rows, delimiter).with_context(|| format!("write {}", path.display()))
    }

    fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.dir.join(name);
        std::fs::write(&path, serde_json::to_string_pretty(value)?)
            .with_context(|| format!("write {}", path.display()))
    }

    fn write_effective_config(&self) -> Result<()> {
        let mut cfg = self.cfg.clone();
        if !cfg.target.api_key.is_empty() {
            cfg.target.api_key = "<redacted>".into();
        }
        let raw = toml::to_string(&cfg).with_context(|| "serializing effective config")?;
        let path = self.dir.join("effective-config.toml");
        std::fs::write(&path, raw).with_context(|| format!("write {}", path.display()))
    }
}
