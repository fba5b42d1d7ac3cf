pub mod bus;
pub mod case_store;
pub mod classifier;
pub mod config;
pub mod frame;
pub mod generator;
pub mod lenattack;
pub mod listener;
#[cfg(feature = "mdf4")]
mod mdf4;
pub mod record;
#[cfg(target_os = "linux")]
mod socketcan;
pub mod supervisor;
pub mod trace;

pub use bus::{BusError, BusKind, BusOpenError, CanBus, VirtualBus, VirtualHub};
pub use case_store::{CaseStore, CaseStoreError};
pub use classifier::{ClassifierTable, LineParser};
pub use config::{CanfuzzConfig, ConfigError};
pub use frame::CanFrame;
pub use generator::{PayloadPattern, SweepConfig, generate};
pub use lenattack::{AttackStats, LengthAttackOptions, run_length_attack};
pub use listener::{ArbIdCounter, Listener, ListenerShutdown};
pub use record::{Case, CaseKind, FailureCaseRecord, RunEntry, RunStatus};
pub use supervisor::{Supervisor, SupervisorConfig, SupervisorError, SupervisorEvent};
pub use trace::{ExportError, ExportSummary};
