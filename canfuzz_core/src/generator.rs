use crate::frame::{CanFrame, CLASSIC_MAX_DLEN, STANDARD_ID_MAX, dlc_to_length};
use rand::Rng;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Number of distinct payload lengths a classic frame can carry (0..=8).
const CLASSIC_LENGTH_CHOICES: usize = CLASSIC_MAX_DLEN + 1;
/// Default probability of sending a payload whose length disagrees with the DLC.
pub const DEFAULT_MISMATCH_PROBABILITY: f64 = 0.5;
/// Default delay between two sends of the sweep.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(50);

/// Payload content generator, selected by name on the command line.
///
/// Accepted names are `rand`, `zeros`, `ffs`, `aa`, `55`, `inc` and
/// `custom:<hex>`. Unknown names, malformed hex and hex that decodes to
/// nothing all fall back to random bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PayloadPattern {
    Rand,
    Zeros,
    Ffs,
    Aa,
    Fives,
    #[default]
    Inc,
    Custom(Vec<u8>),
}

impl PayloadPattern {
    pub fn parse(name: &str) -> Self {
        let lowered = name.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "rand" | "" => PayloadPattern::Rand,
            "zeros" => PayloadPattern::Zeros,
            "ffs" => PayloadPattern::Ffs,
            "aa" => PayloadPattern::Aa,
            "55" => PayloadPattern::Fives,
            "inc" => PayloadPattern::Inc,
            other => match other.strip_prefix("custom:") {
                Some(hex_text) => {
                    let compact: String = hex_text.chars().filter(|c| !c.is_whitespace()).collect();
                    match hex::decode(&compact) {
                        Ok(bytes) if !bytes.is_empty() => PayloadPattern::Custom(bytes),
                        Ok(_) => PayloadPattern::Rand,
                        Err(e) => {
                            warn!(
                                pattern = name,
                                error = %e,
                                "malformed custom payload hex, using random bytes"
                            );
                            PayloadPattern::Rand
                        }
                    }
                }
                None => {
                    warn!(pattern = name, "unknown payload pattern, using random bytes");
                    PayloadPattern::Rand
                }
            },
        }
    }

    /// Produces exactly `length` bytes. A zero length always yields an empty
    /// payload, whatever the pattern.
    pub fn make_payload<R: Rng + ?Sized>(
        &self,
        length: usize,
        start_byte: u8,
        rng: &mut R,
    ) -> Vec<u8> {
        if length == 0 {
            return Vec::new();
        }
        match self {
            PayloadPattern::Rand => {
                let mut bytes = vec![0u8; length];
                rng.fill(&mut bytes[..]);
                bytes
            }
            PayloadPattern::Zeros => vec![0x00; length],
            PayloadPattern::Ffs => vec![0xFF; length],
            PayloadPattern::Aa => vec![0xAA; length],
            PayloadPattern::Fives => vec![0x55; length],
            PayloadPattern::Inc => (0..length)
                .map(|i| start_byte.wrapping_add((i % 256) as u8))
                .collect(),
            PayloadPattern::Custom(seed) => seed.iter().copied().cycle().take(length).collect(),
        }
    }
}

impl FromStr for PayloadPattern {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PayloadPattern::parse(s))
    }
}

impl fmt::Display for PayloadPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadPattern::Rand => f.write_str("rand"),
            PayloadPattern::Zeros => f.write_str("zeros"),
            PayloadPattern::Ffs => f.write_str("ffs"),
            PayloadPattern::Aa => f.write_str("aa"),
            PayloadPattern::Fives => f.write_str("55"),
            PayloadPattern::Inc => f.write_str("inc"),
            PayloadPattern::Custom(bytes) => write!(f, "custom:{}", hex::encode(bytes)),
        }
    }
}

/// Parses an integer the way a user types it: `0x`/`0o`/`0b` prefixes or decimal.
pub fn parse_int_auto(token: &str) -> Option<u32> {
    let token = token.trim();
    let lowered = token.to_ascii_lowercase();
    if let Some(hex_digits) = lowered.strip_prefix("0x") {
        u32::from_str_radix(hex_digits, 16).ok()
    } else if let Some(oct_digits) = lowered.strip_prefix("0o") {
        u32::from_str_radix(oct_digits, 8).ok()
    } else if let Some(bin_digits) = lowered.strip_prefix("0b") {
        u32::from_str_radix(bin_digits, 2).ok()
    } else {
        lowered.parse::<u32>().ok()
    }
}

/// Expands target specifications into arbitration ids.
///
/// Each token may be a single id (`0x123`, `291`), `any` for the whole
/// standard 11-bit space, or an inclusive range `0x100-0x1FF`; tokens may
/// also be comma-combined. The result is deduplicated and keeps first-seen
/// order. Unparseable tokens are skipped with a warning.
pub fn parse_targets<S: AsRef<str>>(raw_targets: &[S]) -> Vec<u32> {
    let mut expanded: Vec<u32> = Vec::new();
    for raw in raw_targets {
        for token in raw.as_ref().split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            if token.eq_ignore_ascii_case("any") {
                expanded.extend(0..=STANDARD_ID_MAX);
                continue;
            }
            if let Some((start, end)) = token.split_once('-') {
                match (parse_int_auto(start), parse_int_auto(end)) {
                    (Some(start), Some(end)) => expanded.extend(start..=end),
                    _ => warn!(token, "could not parse target range"),
                }
                continue;
            }
            match parse_int_auto(token) {
                Some(id) => expanded.push(id),
                None => warn!(token, "could not parse target token"),
            }
        }
    }

    let mut seen = std::collections::HashSet::with_capacity(expanded.len());
    expanded.retain(|id| seen.insert(*id));
    expanded
}

/// Picks the payload length for one (target, DLC) step.
///
/// With probability `mismatch_prob` a length is drawn uniformly from 0..=8;
/// when it collides with the canonical length it is shifted by one modulo 9.
/// Returns the length and whether the mismatch branch was taken.
pub fn choose_payload_length<R: Rng + ?Sized>(
    canonical: usize,
    mismatch_prob: f64,
    rng: &mut R,
) -> (usize, bool) {
    if rng.random::<f64>() < mismatch_prob {
        let mut candidate = rng.random_range(0..CLASSIC_LENGTH_CHOICES);
        if candidate == canonical {
            candidate = (candidate + 1) % CLASSIC_LENGTH_CHOICES;
        }
        (candidate, true)
    } else {
        (canonical, false)
    }
}

/// Parameters of a DLC sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepConfig {
    pub targets: Vec<u32>,
    pub min_dlc: u8,
    pub max_dlc: u8,
    pub pattern: PayloadPattern,
    pub mismatch_prob: f64,
    pub bursts: u32,
    pub interval: Duration,
    pub repeat: bool,
    pub start_byte: u8,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            min_dlc: 0,
            max_dlc: CLASSIC_MAX_DLEN as u8,
            pattern: PayloadPattern::default(),
            mismatch_prob: DEFAULT_MISMATCH_PROBABILITY,
            bursts: 1,
            interval: DEFAULT_INTERVAL,
            repeat: false,
            start_byte: 0,
        }
    }
}

impl SweepConfig {
    /// Clamps every field into its classic-CAN range: DLCs to 0..=8,
    /// the mismatch probability to [0, 1] and bursts to at least one.
    pub fn normalized(mut self) -> Self {
        self.max_dlc = self.max_dlc.min(CLASSIC_MAX_DLEN as u8);
        self.min_dlc = self.min_dlc.min(CLASSIC_MAX_DLEN as u8);
        self.mismatch_prob = if self.mismatch_prob.is_nan() {
            0.0
        } else {
            self.mismatch_prob.clamp(0.0, 1.0)
        };
        self.bursts = self.bursts.max(1);
        self
    }
}

/// One frame of the sweep plus how long to wait after sending it.
#[derive(Debug, Clone)]
pub struct ScheduledFrame {
    pub frame: CanFrame,
    /// Zero-based index within the burst for this (target, DLC) step.
    pub burst: u32,
    /// True when the payload length was deliberately made to disagree with the DLC.
    pub mismatched: bool,
    pub delay_after: Duration,
}

/// Lazy frame sequence for a sweep. Finite unless `repeat` is set, in which
/// case it restarts from the first target until the caller stops pulling.
pub struct FrameSweep<R: Rng> {
    config: SweepConfig,
    rng: R,
    target_idx: usize,
    dlc: u8,
    burst: u32,
    step: Option<(Vec<u8>, bool)>,
    yielded_in_pass: bool,
}

/// Builds the frame sequence for `config` using `rng` for every random
/// decision, so a seeded generator reproduces the same sweep.
pub fn generate<R: Rng>(config: SweepConfig, rng: R) -> FrameSweep<R> {
    let config = config.normalized();
    let dlc = config.min_dlc;
    FrameSweep {
        config,
        rng,
        target_idx: 0,
        dlc,
        burst: 0,
        step: None,
        yielded_in_pass: false,
    }
}

impl<R: Rng> FrameSweep<R> {
    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    fn pass_exhausted(&self) -> bool {
        self.target_idx >= self.config.targets.len() || self.config.min_dlc > self.config.max_dlc
    }

    fn advance_step(&mut self) {
        self.step = None;
        self.burst = 0;
        if self.dlc >= self.config.max_dlc {
            self.dlc = self.config.min_dlc;
            self.target_idx += 1;
        } else {
            self.dlc += 1;
        }
    }
}

impl<R: Rng> Iterator for FrameSweep<R> {
    type Item = ScheduledFrame;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pass_exhausted() {
            // An empty pass would spin forever under `repeat`.
            if !self.config.repeat || !self.yielded_in_pass {
                return None;
            }
            self.target_idx = 0;
            self.dlc = self.config.min_dlc;
            self.yielded_in_pass = false;
        }

        let arbitration_id = self.config.targets[self.target_idx];
        let dlc = self.dlc;
        if self.step.is_none() {
            let canonical = dlc_to_length(dlc);
            let (length, mismatched) =
                choose_payload_length(canonical, self.config.mismatch_prob, &mut self.rng);
            let payload = self
                .config
                .pattern
                .make_payload(length, self.config.start_byte, &mut self.rng);
            self.step = Some((payload, mismatched));
        }

        let (payload, mismatched) = self.step.as_ref()?;
        let frame = CanFrame::new(arbitration_id, dlc, payload);
        let mismatched = *mismatched;
        let burst = self.burst;
        let last_in_step = burst + 1 >= self.config.bursts;
        // The last burst also carries the pause between DLC steps.
        let delay_after = if last_in_step {
            self.config.interval * 2
        } else {
            self.config.interval
        };

        if last_in_step {
            self.advance_step();
        } else {
            self.burst += 1;
        }
        self.yielded_in_pass = true;

        Some(ScheduledFrame {
            frame,
            burst,
            mismatched,
            delay_after,
        })
    }
}
