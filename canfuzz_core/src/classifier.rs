//! Turns worker output lines into [`Case`]s.
//!
//! Each worker module can register its own [`LineParser`]; modules without
//! one fall back to [`GenericParser`], which only looks at the
//! `[FAIL]`/`[ERROR]`/`[SUCCESS]` markers. Lines that match nothing are
//! ignored.

use crate::record::{CASE_TIMESTAMP_FORMAT, Case, CaseKind};
use chrono::Local;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d+)").expect("timestamp pattern is valid")
});
static ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)ID=([0-9A-Fx]+)").expect("id pattern is valid"));
static DLC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)DLC=(\d+)").expect("dlc pattern is valid"));
static LEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)LEN=(\d+)").expect("len pattern is valid"));
static REASON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([^)]+)\)").expect("reason pattern is valid"));

const UNKNOWN: &str = "Unknown";

pub trait LineParser: Send + Sync {
    fn parse(&self, line: &str) -> Option<Case>;
}

fn marker(line: &str) -> Option<CaseKind> {
    if line.contains("[FAIL]") || line.contains("[ERROR]") {
        Some(CaseKind::Failure)
    } else if line.contains("[SUCCESS]") {
        Some(CaseKind::Success)
    } else {
        None
    }
}

/// First ISO-8601 timestamp on the line, or the current time.
pub fn extract_timestamp(line: &str) -> String {
    TIMESTAMP_RE
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| Local::now().format(CASE_TIMESTAMP_FORMAT).to_string())
}

fn capture(re: &Regex, line: &str) -> String {
    re.captures(line)
        .and_then(|c| c.get(1))
        .map_or_else(|| UNKNOWN.to_string(), |m| m.as_str().to_string())
}

/// Marker-only parser used for every module without a dedicated grammar.
pub struct GenericParser;

impl LineParser for GenericParser {
    fn parse(&self, line: &str) -> Option<Case> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let kind = marker(line)?;
        let mut case = Case::new(kind, extract_timestamp(line), line);
        if kind == CaseKind::Failure {
            case.error_type = Some("Module Error".to_string());
        }
        Some(case)
    }
}

/// Parser for the length-attack worker's send reports.
pub struct LengthAttackParser;

impl LineParser for LengthAttackParser {
    fn parse(&self, line: &str) -> Option<Case> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let kind = marker(line)?;
        let mut case = Case::new(kind, extract_timestamp(line), line);
        case.id = Some(capture(&ID_RE, line));
        case.dlc = Some(capture(&DLC_RE, line));
        case.len = Some(capture(&LEN_RE, line));
        if kind == CaseKind::Failure {
            let reason = REASON_RE
                .captures(line)
                .and_then(|c| c.get(1))
                .map_or("Socket/Bus Error", |m| m.as_str());
            case.error_type = Some(reason.to_string());
        }
        Some(case)
    }
}

/// Module name to parser lookup with a generic fallback.
#[derive(Clone)]
pub struct ClassifierTable {
    parsers: HashMap<String, Arc<dyn LineParser>>,
    fallback: Arc<dyn LineParser>,
}

impl ClassifierTable {
    /// A table with no module-specific parsers.
    pub fn generic() -> Self {
        Self {
            parsers: HashMap::new(),
            fallback: Arc::new(GenericParser),
        }
    }

    pub fn register(&mut self, module: &str, parser: Arc<dyn LineParser>) {
        self.parsers.insert(module.to_string(), parser);
    }

    pub fn classify(&self, module: &str, line: &str) -> Option<Case> {
        self.parsers
            .get(module)
            .unwrap_or(&self.fallback)
            .parse(line)
    }
}

impl Default for ClassifierTable {
    fn default() -> Self {
        let mut table = Self::generic();
        let lenattack: Arc<dyn LineParser> = Arc::new(LengthAttackParser);
        table.register("lenattack", Arc::clone(&lenattack));
        table.register("LengthAttack", lenattack);
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lenattack_failure_extracts_fields() {
        let table = ClassifierTable::default();
        let line = "2025-03-04T10:11:12.123456 [FAIL] SEND ID=0x1A0 DLC=8 LEN=3 (Socket/Bus Error)";
        let case = table.classify("lenattack", line).unwrap();
        assert_eq!(case.kind, CaseKind::Failure);
        assert_eq!(case.timestamp, "2025-03-04T10:11:12.123456");
        assert_eq!(case.id.as_deref(), Some("0x1A0"));
        assert_eq!(case.dlc.as_deref(), Some("8"));
        assert_eq!(case.len.as_deref(), Some("3"));
        assert_eq!(case.error_type.as_deref(), Some("Socket/Bus Error"));
        assert_eq!(case.message, line);
    }

    #[test]
    fn lenattack_failure_without_reason_uses_default() {
        let table = ClassifierTable::default();
        let case = table
            .classify("LengthAttack", "[ERROR] SEND ID=0x7 DLC=1 LEN=0")
            .unwrap();
        assert_eq!(case.error_type.as_deref(), Some("Socket/Bus Error"));
        assert_eq!(case.id.as_deref(), Some("0x7"));
    }

    #[test]
    fn lenattack_missing_fields_are_unknown() {
        let table = ClassifierTable::default();
        let case = table.classify("lenattack", "[FAIL] interface vanished").unwrap();
        assert_eq!(case.id.as_deref(), Some(UNKNOWN));
        assert_eq!(case.dlc.as_deref(), Some(UNKNOWN));
    }

    #[test]
    fn lenattack_success_has_no_error_type() {
        let table = ClassifierTable::default();
        let line =
            "2025-01-01T00:00:00.000 [SUCCESS] SEND ID=0x123 DLC=8 LEN=8 DATA=0011223344556677";
        let case = table.classify("lenattack", line).unwrap();
        assert_eq!(case.kind, CaseKind::Success);
        assert!(case.error_type.is_none());
        assert_eq!(case.id.as_deref(), Some("0x123"));
    }

    #[test]
    fn generic_failure_is_module_error() {
        let table = ClassifierTable::default();
        let case = table.classify("uds", "  [FAIL] session timeout  ").unwrap();
        assert_eq!(case.kind, CaseKind::Failure);
        assert_eq!(case.error_type.as_deref(), Some("Module Error"));
        assert_eq!(case.message, "[FAIL] session timeout");
        assert!(case.id.is_none());
    }

    #[test]
    fn unmatched_and_blank_lines_are_ignored() {
        let table = ClassifierTable::default();
        assert!(table.classify("lenattack", "").is_none());
        assert!(table.classify("lenattack", "   ").is_none());
        assert!(table.classify("lenattack", "[RECV] ID=0x1 DLC=0 LEN=0 FD=false DATA=").is_none());
        assert!(table.classify("uds", "starting session").is_none());
    }

    #[test]
    fn fail_marker_wins_over_success_marker() {
        let table = ClassifierTable::generic();
        let case = table.classify("x", "[SUCCESS] then [ERROR]").unwrap();
        assert_eq!(case.kind, CaseKind::Failure);
    }

    #[test]
    fn missing_timestamp_falls_back_to_now() {
        let ts = extract_timestamp("[FAIL] no time here");
        assert!(TIMESTAMP_RE.is_match(&ts), "unexpected fallback timestamp {ts}");
    }

    struct EverythingFails;

    impl LineParser for EverythingFails {
        fn parse(&self, line: &str) -> Option<Case> {
            Some(Case::new(CaseKind::Failure, extract_timestamp(line), line))
        }
    }

    #[test]
    fn registered_parser_overrides_fallback() {
        let mut table = ClassifierTable::generic();
        table.register("doip", Arc::new(EverythingFails));
        assert!(table.classify("doip", "plain line").is_some());
        assert!(table.classify("xcp", "plain line").is_none());
    }
}
