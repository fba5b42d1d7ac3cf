//! Converts captured worker output into automotive trace files.
//!
//! Both encoders work from the same extraction step: every line shaped like
//! `<ISO timestamp> [<marker>] SEND ID=<id> DLC=<n> LEN=<n> DATA=<hex>` is
//! turned into a [`TraceFrame`]. Everything else in the text is ignored.
//! The encoders are pure functions of their input and only write the path
//! they are given.

use crate::frame::dlc_to_length;
use crate::record::{RunEntry, RunStatus};
use chrono::{DateTime, Local};
use regex::Regex;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, info};

static SEND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d+)\s+\[.*?\]\s+SEND\s+",
        r"ID=([0-9A-Fx]+)\s+DLC=(\d+)\s+LEN=(\d+)\s+DATA=([0-9A-F]*)",
    ))
    .expect("send report pattern is valid")
});

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Trace export I/O error: {0}")]
    Io(#[from] io::Error),

    /// The requested format was compiled out of this build.
    #[error("{0}")]
    DependencyMissing(String),
}

/// One frame recovered from a send report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub timestamp: String,
    pub arbitration_id: u32,
    pub dlc: u8,
    pub data: Vec<u8>,
}

impl TraceFrame {
    /// The payload as exactly eight bytes, zero padded.
    pub fn padded_data(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        let n = self.data.len().min(8);
        out[..n].copy_from_slice(&self.data[..n]);
        out
    }
}

/// Test totals recorded alongside the frames in the binary container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportSummary {
    pub total_tests: u32,
    pub success_count: u32,
}

impl ExportSummary {
    /// Counts send reports in a raw log: every report is a test, `[SUCCESS]` ones succeeded.
    pub fn from_log(text: &str) -> Self {
        let mut summary = Self::default();
        for line in text.lines().filter(|l| l.contains("SEND")) {
            if line.contains("[SUCCESS]") {
                summary.total_tests += 1;
                summary.success_count += 1;
            } else if line.contains("[FAIL]") || line.contains("[ERROR]") {
                summary.total_tests += 1;
            }
        }
        summary
    }

    /// Counts supervised runs: every run is a test, clean ones succeeded.
    pub fn from_history(entries: &[RunEntry]) -> Self {
        Self {
            total_tests: u32::try_from(entries.len()).unwrap_or(u32::MAX),
            success_count: u32::try_from(
                entries
                    .iter()
                    .filter(|e| e.status == RunStatus::Success)
                    .count(),
            )
            .unwrap_or(u32::MAX),
        }
    }
}

fn parse_id(text: &str) -> Option<u32> {
    let lower = text.to_ascii_lowercase();
    match lower.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => lower.parse().ok(),
    }
}

fn parse_data(text: &str) -> Vec<u8> {
    // A trailing odd nibble is ignored.
    text.as_bytes()
        .chunks_exact(2)
        .filter_map(|pair| std::str::from_utf8(pair).ok())
        .filter_map(|pair| u8::from_str_radix(pair, 16).ok())
        .collect()
}

/// Every send report in `text`, in order of appearance.
pub fn extract_frames(text: &str) -> Vec<TraceFrame> {
    SEND_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let Some(arbitration_id) = parse_id(&caps[2]) else {
                debug!(id = &caps[2], "skipping send report with unreadable id");
                return None;
            };
            let Ok(dlc) = caps[3].parse::<u8>() else {
                debug!(dlc = &caps[3], "skipping send report with unreadable dlc");
                return None;
            };
            Some(TraceFrame {
                timestamp: caps[1].to_string(),
                arbitration_id,
                dlc,
                data: parse_data(&caps[5]),
            })
        })
        .collect()
}

fn asc_timestamp(iso: &str) -> String {
    let whole = iso.split('.').next().unwrap_or(iso);
    format!("{}.000", whole.replace('T', " "))
}

fn asc_data(frame: &TraceFrame) -> String {
    (0..dlc_to_length(frame.dlc))
        .map(|i| format!("{:02X}", frame.data.get(i).copied().unwrap_or(0)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Writes a Vector ASCII trace.
///
/// Payload bytes are printed up to the DLC, zero padded when the report
/// carried fewer bytes, the way the frame went out on the wire.
pub fn write_asc<W: Write>(
    out: &mut W,
    frames: &[TraceFrame],
    generated: DateTime<Local>,
    trailer: bool,
) -> io::Result<()> {
    writeln!(out, "date {}", generated.format("%Y-%m-%d %H:%M:%S"))?;
    writeln!(out, "base hex  timestamps absolute")?;
    writeln!(out, "no internal events logged")?;
    for frame in frames {
        writeln!(
            out,
            "{}  Tx   {:>3}   {}   {}",
            asc_timestamp(&frame.timestamp),
            frame.arbitration_id,
            frame.dlc,
            asc_data(frame)
        )?;
    }
    if trailer {
        writeln!(out)?;
        writeln!(out, "; Total frames extracted: {}", frames.len())?;
    }
    Ok(())
}

fn create(path: &Path) -> io::Result<BufWriter<File>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(BufWriter::new(File::create(path)?))
}

/// Extracts frames from `text` and writes them to `path` as an ASCII trace.
/// Returns the number of frames written.
pub fn export_asc(text: &str, path: &Path, trailer: bool) -> Result<usize, ExportError> {
    let frames = extract_frames(text);
    let mut out = create(path)?;
    write_asc(&mut out, &frames, Local::now(), trailer)?;
    out.flush()?;
    info!(path = %path.display(), frames = frames.len(), "wrote ASC trace");
    Ok(frames.len())
}

/// Extracts frames from `text` and writes them to `path` as an MDF4 file.
/// Returns the number of samples written, which is at least one.
#[cfg(feature = "mdf4")]
pub fn export_mf4(
    text: &str,
    path: &Path,
    title: &str,
    summary: ExportSummary,
) -> Result<usize, ExportError> {
    let frames = extract_frames(text);
    let mut out = create(path)?;
    let samples = crate::mdf4::write_mf4(&mut out, &frames, summary, title, Local::now())?;
    out.flush()?;
    info!(path = %path.display(), frames = frames.len(), samples, "wrote MDF4 file");
    Ok(samples)
}

#[cfg(not(feature = "mdf4"))]
pub fn export_mf4(
    _text: &str,
    _path: &Path,
    _title: &str,
    _summary: ExportSummary,
) -> Result<usize, ExportError> {
    Err(ExportError::DependencyMissing(
        "MDF4 export is not available in this build. Rebuild canfuzz with the `mdf4` \
         feature enabled (cargo build --features mdf4)."
            .to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    const SAMPLE: &str =
        "2025-01-01T00:00:00.000 [SUCCESS] SEND ID=0x123 DLC=8 LEN=8 DATA=0011223344556677";

    fn fixed_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 6, 1, 12, 30, 0).unwrap()
    }

    fn render(frames: &[TraceFrame], trailer: bool) -> String {
        let mut buf = Vec::new();
        write_asc(&mut buf, frames, fixed_time(), trailer).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn single_report_becomes_one_asc_line() {
        let frames = extract_frames(SAMPLE);
        let text = render(&frames, false);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "date 2025-06-01 12:30:00");
        assert_eq!(lines[1], "base hex  timestamps absolute");
        assert_eq!(lines[2], "no internal events logged");
        assert_eq!(
            lines[3],
            "2025-01-01 00:00:00.000  Tx   291   8   00 11 22 33 44 55 66 77"
        );
    }

    #[test]
    fn no_frames_gives_header_only() {
        let text = render(&extract_frames("nothing to see\n[RECV] ID=0x1 DLC=0 LEN=0"), false);
        assert_eq!(text.lines().count(), 3);
        let with_trailer = render(&[], true);
        assert!(with_trailer.ends_with("; Total frames extracted: 0\n"));
    }

    #[test]
    fn extraction_reads_mixed_log() {
        let log = "\
# lenattack log started: 2025-01-01T00:00:00
2025-01-01T00:00:00.000100 [SUCCESS] SEND ID=0x100 DLC=0 LEN=0 DATA=
[RECV] ID=0x7E8 DLC=2 LEN=2 FD=false DATA=0102
2025-01-01T00:00:00.050000 [SUCCESS] send id=0x7ff dlc=4 len=2 data=abcd
2025-01-01T00:00:00.060000 [FAIL] SEND ID=0x101 DLC=8 LEN=3 (Socket/Bus Error)
2025-01-01T00:00:00.070000 [SUCCESS] SEND ID=291 DLC=1 LEN=1 DATA=0f
";
        let frames = extract_frames(log);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].arbitration_id, 0x100);
        assert!(frames[0].data.is_empty());
        assert_eq!(frames[1].arbitration_id, 0x7FF);
        assert_eq!(frames[1].data, vec![0xAB, 0xCD]);
        assert_eq!(frames[2].arbitration_id, 291);
    }

    #[test]
    fn asc_pads_short_payload_and_truncates_long_one() {
        let short = TraceFrame {
            timestamp: "2025-01-01T10:00:01.999".into(),
            arbitration_id: 0x10,
            dlc: 4,
            data: vec![0xAA],
        };
        let long = TraceFrame {
            timestamp: "2025-01-01T10:00:02.5".into(),
            arbitration_id: 0x7FF,
            dlc: 2,
            data: vec![1, 2, 3, 4],
        };
        let empty = TraceFrame {
            timestamp: "2025-01-01T10:00:03.0".into(),
            arbitration_id: 0x1,
            dlc: 0,
            data: vec![],
        };
        let text = render(&[short, long, empty], true);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[3], "2025-01-01 10:00:01.000  Tx    16   4   AA 00 00 00");
        assert_eq!(lines[4], "2025-01-01 10:00:02.000  Tx   2047   2   01 02");
        assert_eq!(lines[5], "2025-01-01 10:00:03.000  Tx     1   0   ");
        assert_eq!(lines[7], "; Total frames extracted: 3");
    }

    #[test]
    fn odd_nibble_is_dropped() {
        assert_eq!(parse_data("abc"), vec![0xAB]);
        assert_eq!(parse_data(""), Vec::<u8>::new());
    }

    #[test]
    fn summary_counts_send_reports() {
        let log = format!(
            "{SAMPLE}\n2025-01-01T00:00:00.1 [FAIL] SEND ID=0x1 DLC=1 LEN=0 (Socket/Bus Error)\n\
             [SUCCESS] unrelated\n"
        );
        assert_eq!(
            ExportSummary::from_log(&log),
            ExportSummary {
                total_tests: 2,
                success_count: 1
            }
        );
    }

    #[test]
    fn summary_from_history_counts_clean_runs() {
        let mut ok = RunEntry::new("lenattack", "a");
        ok.transition(RunStatus::Success);
        let mut bad = RunEntry::new("lenattack", "b");
        bad.transition(RunStatus::Failed(1));
        let summary = ExportSummary::from_history(&[ok, bad]);
        assert_eq!(summary.total_tests, 2);
        assert_eq!(summary.success_count, 1);
    }

    #[test]
    fn export_asc_writes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out/trace.asc");
        assert_eq!(export_asc(SAMPLE, &path, true).unwrap(), 1);
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("Tx   291   8   00 11 22 33 44 55 66 77"));
    }

    #[cfg(not(feature = "mdf4"))]
    #[test]
    fn mf4_without_feature_is_dependency_missing() {
        let dir = tempdir().unwrap();
        let err = export_mf4(SAMPLE, &dir.path().join("x.mf4"), "t", ExportSummary::default())
            .unwrap_err();
        assert!(matches!(err, ExportError::DependencyMissing(_)));
        assert!(export_asc(SAMPLE, &dir.path().join("x.asc"), false).is_ok());
    }
}
