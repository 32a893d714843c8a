//! Text data files under `./data/`, consumed by the plotting scripts.
//!
//! Every file starts with `#` header comments (tool, timestamp, CPU
//! frequency, run parameters) followed by a two- or three-column numeric
//! body. No binary formats.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::monitor::{HeatmapData, RateSweep};
use crate::timing::cpu_freq_hz;

/// Local wall-clock split into calendar fields, via libc's localtime so the
/// filenames match the operator's timezone.
fn local_timestamp() -> (i32, u32, u32, u32, u32, u32) {
    // SAFETY: localtime_r with a zeroed tm out-parameter.
    unsafe {
        let now = libc::time(std::ptr::null_mut());
        let mut tm: libc::tm = std::mem::zeroed();
        libc::localtime_r(&now, &mut tm);
        (
            tm.tm_year + 1900,
            tm.tm_mon as u32 + 1,
            tm.tm_mday as u32,
            tm.tm_hour as u32,
            tm.tm_min as u32,
            tm.tm_sec as u32,
        )
    }
}

fn timestamp_string() -> String {
    let (y, mo, d, h, mi, s) = local_timestamp();
    format!("{y:04}-{mo:02}-{d:02}-{h:02}-{mi:02}-{s:02}")
}

/// Writer for one output file in a data directory.
pub struct DataFile {
    writer: BufWriter<std::fs::File>,
    path: PathBuf,
}

impl DataFile {
    /// Create `dir/<prefix>-<timestamp>[-<append>]`, creating `dir` first
    /// when absent.
    pub fn create(
        dir: impl AsRef<Path>,
        prefix: &str,
        append: Option<&str>,
    ) -> std::io::Result<Self> {
        let dir = dir.as_ref();
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
            log::info!("created data directory {}", dir.display());
        }

        let mut name = format!("{prefix}-{}", timestamp_string());
        if let Some(a) = append.filter(|a| !a.is_empty()) {
            name.push('-');
            name.push_str(a);
        }
        let path = dir.join(name);
        let writer = BufWriter::new(std::fs::File::create(&path)?);
        Ok(Self { writer, path })
    }

    /// Default location under `./data`.
    pub fn create_default(prefix: &str, append: Option<&str>) -> std::io::Result<Self> {
        Self::create("data", prefix, append)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Standard header block: tool, timestamp, CPU frequency, then caller
    /// parameters as further comment lines.
    pub fn header(&mut self, tool: &str, params: &[(&str, String)]) -> std::io::Result<()> {
        let (y, mo, d, h, mi, s) = local_timestamp();
        writeln!(self.writer, "# generated by {tool}")?;
        writeln!(
            self.writer,
            "# {y:04}-{mo:02}-{d:02} {h:02}:{mi:02}:{s:02}"
        )?;
        match cpu_freq_hz() {
            Some(hz) => writeln!(self.writer, "# cpu freq: {:.2} ghz", hz as f64 / 1e9)?,
            None => writeln!(self.writer, "# cpu freq: unknown")?,
        }
        for (k, v) in params {
            writeln!(self.writer, "# {k}: {v}")?;
        }
        Ok(())
    }

    pub fn comment(&mut self, text: &str) -> std::io::Result<()> {
        writeln!(self.writer, "# {text}")
    }

    pub fn row2(&mut self, a: impl std::fmt::Display, b: impl std::fmt::Display) -> std::io::Result<()> {
        writeln!(self.writer, "{a} {b}")
    }

    pub fn row3(
        &mut self,
        a: impl std::fmt::Display,
        b: impl std::fmt::Display,
        c: impl std::fmt::Display,
    ) -> std::io::Result<()> {
        writeln!(self.writer, "{a} {b} {c}")
    }

    pub fn finish(mut self) -> std::io::Result<PathBuf> {
        self.writer.flush()?;
        Ok(self.path)
    }
}

/// Heatmap body: `wait_us n_evicted percentage`, one row per (slot, k).
pub fn write_heatmap(
    dir: impl AsRef<Path>,
    data: &HeatmapData,
    append: Option<&str>,
    socket_id: Option<i32>,
) -> std::io::Result<PathBuf> {
    let mut f = DataFile::create(dir, "occ-heatmap", append)?;
    let mut params = vec![
        ("time step", format!("{} us", data.time_step_us)),
        ("max time", format!("{} us", data.max_time_us)),
        ("ways", data.n_ways.to_string()),
    ];
    if let Some(s) = socket_id {
        params.push(("socket", s.to_string()));
    }
    f.header("llcscope", &params)?;
    f.comment("columns: wait_us n_evicted percent_of_sets")?;

    for slot in 0..data.n_slots() {
        let wait_us = slot as u64 * data.time_step_us;
        for k in 0..=data.n_ways as usize {
            f.row3(wait_us, k, format!("{:.2}", data.percentage(slot, k)))?;
        }
    }
    f.finish()
}

/// Rate-vs-wait body: `wait_us rate_percent`.
pub fn write_rate_sweep(
    dir: impl AsRef<Path>,
    sweep: &RateSweep,
    append: Option<&str>,
) -> std::io::Result<PathBuf> {
    let mut f = DataFile::create(dir, "evrate-wait", append)?;
    f.header(
        "llcscope",
        &[("prime time", format!("{} us", sweep.prime_time_us))],
    )?;
    f.comment("columns: wait_us eviction_rate_percent")?;
    for &(us, rate) in &sweep.points {
        f.row2(us, format!("{:.2}", rate * 100.0))?;
    }
    f.finish()
}

/// Eviction-activity body: `time_ms eviction_status`, batched so the file
/// stays at a plottable number of points.
pub fn write_activity(
    dir: impl AsRef<Path>,
    cycle_diffs: &[u32],
    time_limit_ms: u64,
    max_points: u32,
    append: Option<&str>,
) -> std::io::Result<Option<PathBuf>> {
    let Some(freq) = cpu_freq_hz() else {
        log::error!("cannot write activity data without the CPU frequency");
        return Ok(None);
    };

    let limit_cycles = freq * time_limit_ms / 1000;
    let batch_cycles = (limit_cycles / max_points.max(1) as u64).max(100);

    let mut acc = 0u64;
    let mut timeline_cycles = 0u64;
    for &d in cycle_diffs {
        acc += d as u64;
        if acc > limit_cycles {
            break;
        }
        timeline_cycles = acc;
    }

    let n_batches = (timeline_cycles / batch_cycles + 1) as usize;
    let mut batch_hit = vec![false; n_batches];
    let mut acc = 0u64;
    for &d in cycle_diffs {
        acc += d as u64;
        if acc >= timeline_cycles {
            break;
        }
        batch_hit[(acc / batch_cycles) as usize] = true;
    }

    let mut f = DataFile::create(dir, "evset-activity", append)?;
    f.header(
        "llcscope",
        &[
            ("time limit", format!("{time_limit_ms} ms")),
            ("batch size", format!("{batch_cycles} cycles")),
            (
                "timeline",
                format!("{:.3} ms", timeline_cycles as f64 / freq as f64 * 1e3),
            ),
        ],
    )?;
    f.comment("columns: time_ms eviction_status")?;

    for (batch, hit) in batch_hit.iter().enumerate() {
        let time_ms = batch as f64 * batch_cycles as f64 / freq as f64 * 1e3;
        f.row2(format!("{time_ms:.3}"), u32::from(*hit))?;
    }
    f.finish().map(Some)
}

/// Per-color occupancy: `color iteration percent`.
pub fn write_color_occupancy(
    dir: impl AsRef<Path>,
    per_color_pct: &[Vec<f64>],
    wait_us: u64,
    append: Option<&str>,
) -> std::io::Result<PathBuf> {
    let mut f = DataFile::create(dir, "l2color-occ", append)?;
    f.header(
        "llcscope",
        &[
            ("colors", per_color_pct.len().to_string()),
            ("wait", format!("{wait_us} us")),
        ],
    )?;
    f.comment("columns: color iteration percent_evicted")?;
    for (color, series) in per_color_pct.iter().enumerate() {
        for (it, pct) in series.iter().enumerate() {
            f.row3(color, it, format!("{pct:.2}"))?;
        }
    }
    f.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_directory_and_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let f = DataFile::create(&data_dir, "test", Some("run1")).unwrap();
        let path = f.finish().unwrap();
        assert!(data_dir.exists());
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("test-"));
        assert!(name.ends_with("-run1"));
    }

    #[test]
    fn header_and_rows_render_as_text() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = DataFile::create(dir.path(), "hdr", None).unwrap();
        f.header("llcscope", &[("param", "7".into())]).unwrap();
        f.comment("columns: a b").unwrap();
        f.row2(1, 2).unwrap();
        f.row3(3, 4, "5.00").unwrap();
        let path = f.finish().unwrap();

        let body = std::fs::read_to_string(path).unwrap();
        assert!(body.starts_with("# generated by llcscope\n"));
        assert!(body.contains("# param: 7\n"));
        assert!(body.contains("# columns: a b\n"));
        assert!(body.ends_with("1 2\n3 4 5.00\n"));
    }

    #[test]
    fn heatmap_file_has_one_row_per_cell() {
        let dir = tempfile::tempdir().unwrap();
        let data = HeatmapData {
            time_step_us: 100,
            max_time_us: 100,
            n_ways: 2,
            counts: vec![vec![1, 0, 0], vec![0, 0, 1]],
            avg_per_slot: vec![0.0, 2.0],
            samples_per_slot: vec![1, 1],
        };
        let path = write_heatmap(dir.path(), &data, None, Some(0)).unwrap();
        let body = std::fs::read_to_string(path).unwrap();
        let data_rows = body.lines().filter(|l| !l.starts_with('#')).count();
        assert_eq!(data_rows, 2 * 3);
        assert!(body.contains("# socket: 0"));
    }

    #[test]
    fn rate_sweep_rows_in_percent() {
        let dir = tempfile::tempdir().unwrap();
        let sweep = RateSweep {
            prime_time_us: 250,
            points: vec![(300, 0.125), (400, 0.5)],
        };
        let path = write_rate_sweep(dir.path(), &sweep, None).unwrap();
        let body = std::fs::read_to_string(path).unwrap();
        assert!(body.contains("# prime time: 250 us"));
        assert!(body.contains("300 12.50\n"));
        assert!(body.contains("400 50.00\n"));
    }

    #[test]
    fn color_occupancy_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path =
            write_color_occupancy(dir.path(), &[vec![10.0, 20.0], vec![30.0]], 7000, None)
                .unwrap();
        let body = std::fs::read_to_string(path).unwrap();
        assert!(body.contains("0 0 10.00\n"));
        assert!(body.contains("0 1 20.00\n"));
        assert!(body.contains("1 0 30.00\n"));
    }

    #[test]
    fn activity_handles_missing_frequency_gracefully() {
        // On any machine where cpu_freq_hz works this writes a file; the
        // point is that neither path panics.
        let dir = tempfile::tempdir().unwrap();
        let diffs = vec![1000u32; 64];
        let _ = write_activity(dir.path(), &diffs, 10, 100, None).unwrap();
    }
}
