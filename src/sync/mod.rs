// ABOUTME: Sync orchestration - one cycle, its triggers, and the scheduler that serializes cycles
// ABOUTME: Control flow is scheduler → resolver → binder → executor → emitter, once per trigger

pub mod cycle;
pub mod scheduler;
pub mod trigger;

pub use cycle::{CycleOutcome, CycleRunner, CycleState, SyncCycle};
pub use scheduler::{CycleScheduler, OverlapPolicy, SchedulerHandle, SchedulerReport, StopSignal};
pub use trigger::{CronSchedule, Trigger};
