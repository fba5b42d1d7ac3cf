use chrono::Local;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Worker module names recognised when recovering arguments from a stored command line.
pub const KNOWN_MODULES: [&str; 9] = [
    "lenattack", "fuzzer", "dcm", "uds", "send", "recon", "listener", "doip", "xcp",
];

/// Timestamp format of a [`RunEntry`].
pub const RUN_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// Timestamp format used for cases whose line carries no timestamp.
pub const CASE_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

pub fn is_length_attack(module: &str) -> bool {
    matches!(module, "lenattack" | "LengthAttack")
}

fn is_fuzzer(module: &str) -> bool {
    matches!(module, "fuzzer" | "Fuzzer")
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseKind {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILURE")]
    Failure,
    #[serde(rename = "Execution Error")]
    ExecutionError,
}

impl CaseKind {
    /// Failures and execution errors both end up in the case store.
    pub fn is_failure(self) -> bool {
        !matches!(self, CaseKind::Success)
    }
}

/// One classified line of worker output, or a synthesized launch error.
///
/// Structured fields are kept as the text found on the line, so a field the
/// worker printed as `0x1A0` is stored exactly like that.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Case {
    #[serde(rename = "type")]
    pub kind: CaseKind,
    pub timestamp: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dlc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub len: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl Case {
    pub fn new(kind: CaseKind, timestamp: String, line: &str) -> Self {
        Self {
            kind,
            timestamp,
            message: line.to_string(),
            details: Some(line.to_string()),
            id: None,
            dlc: None,
            len: None,
            error_type: None,
        }
    }

    /// The single case recorded when a worker cannot be launched or crashes the pump.
    pub fn execution_error(message: &str) -> Self {
        Self {
            kind: CaseKind::ExecutionError,
            timestamp: Local::now().format(CASE_TIMESTAMP_FORMAT).to_string(),
            message: message.to_string(),
            details: Some(format!("\nERROR: {message}\n")),
            id: None,
            dlc: None,
            len: None,
            error_type: Some("Execution Error".to_string()),
        }
    }
}

/// Lifecycle state of a [`RunEntry`]. The last four variants are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Created,
    Running,
    Success,
    CompletedWithFailures(usize),
    Failed(i32),
    Error,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Created | RunStatus::Running)
    }

    /// Final status for a worker that exited with `code` after reporting `failures` cases.
    pub fn from_exit(code: i32, failures: usize) -> Self {
        match (code, failures) {
            (0, 0) => RunStatus::Success,
            (0, n) => RunStatus::CompletedWithFailures(n),
            (code, _) => RunStatus::Failed(code),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Created => f.write_str("Created"),
            RunStatus::Running => f.write_str("Running"),
            RunStatus::Success => f.write_str("Success"),
            RunStatus::CompletedWithFailures(n) => write!(f, "Completed with {n} failures"),
            RunStatus::Failed(code) => write!(f, "Failed ({code})"),
            RunStatus::Error => f.write_str("Error"),
        }
    }
}

impl Serialize for RunStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One supervised worker run.
#[derive(Serialize, Debug, Clone)]
pub struct RunEntry {
    pub timestamp: String,
    pub module: String,
    pub command: String,
    pub output: String,
    pub status: RunStatus,
    pub success_cases: Vec<Case>,
    pub failure_cases: Vec<Case>,
}

impl RunEntry {
    pub fn new(module: &str, command: &str) -> Self {
        Self {
            timestamp: Local::now().format(RUN_TIMESTAMP_FORMAT).to_string(),
            module: module.to_string(),
            command: command.to_string(),
            output: String::new(),
            status: RunStatus::Created,
            success_cases: Vec::new(),
            failure_cases: Vec::new(),
        }
    }

    /// Moves the entry to `next`. Returns false, leaving the entry untouched,
    /// when it already reached a terminal state.
    pub fn transition(&mut self, next: RunStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = next;
        true
    }

    pub fn push_output(&mut self, line: &str) {
        self.output.push_str(line);
        self.output.push('\n');
    }

    pub fn record(&mut self, case: Case) {
        if case.kind.is_failure() {
            self.failure_cases.push(case);
        } else {
            self.success_cases.push(case);
        }
    }
}

/// A failure persisted in the case store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FailureCaseRecord {
    pub timestamp: String,
    pub module: String,
    pub command: String,
    pub output: String,
    pub status: String,
    pub case_details: Case,
}

impl FailureCaseRecord {
    /// Builds the stored record for a failure case seen during a run of `command`.
    pub fn from_case(module: &str, command: &str, case: &Case) -> Self {
        Self {
            timestamp: case.timestamp.clone(),
            module: module.to_string(),
            command: command.to_string(),
            output: case.details.clone().unwrap_or_else(|| case.message.clone()),
            status: "Failure".to_string(),
            case_details: case.clone(),
        }
    }

    pub fn same_key(&self, timestamp: &str, command: &str) -> bool {
        self.timestamp == timestamp && self.command == command
    }

    /// Short stable identifier derived from the uniqueness key.
    pub fn fingerprint(&self) -> String {
        let digest = md5::compute(format!("{}\0{}\0{}", self.module, self.timestamp, self.command));
        format!("{digest:x}")[..10].to_string()
    }

    /// Worker arguments that reproduce this failure, if they can be recovered.
    ///
    /// The stored command line is used from the first known module name
    /// onward. Without one, arguments are synthesized from the case's id.
    pub fn replay_args(&self) -> Option<Vec<String>> {
        let parts: Vec<&str> = self.command.split_whitespace().collect();
        if let Some(start) = parts.iter().position(|p| KNOWN_MODULES.contains(p)) {
            return Some(parts[start..].iter().map(|s| s.to_string()).collect());
        }

        let id = self.case_details.id.as_deref()?;
        if is_length_attack(&self.module) {
            Some(vec![
                "lenattack".to_string(),
                id.to_string(),
                "-i".to_string(),
                "vcan0".to_string(),
            ])
        } else if is_fuzzer(&self.module) {
            Some(vec!["fuzzer".to_string(), "mutate".to_string(), id.to_string()])
        } else {
            None
        }
    }
}
