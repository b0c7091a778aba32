//! Cron scheduler daemon: durable schedules that fire declarative
//! workflows on a timer (spec.md §4.6).
//!
//! A [`CronDaemon`] loads its schedules from a [`ScheduleStorage`]
//! implementation (the default, [`JsonFileScheduleStorage`][storage::JsonFileScheduleStorage],
//! is a single JSON file) and runs a single background tick loop that
//! sleeps until the earliest due schedule, waking early on mutation or a
//! manual trigger. Overlap is prevented per schedule, not globally: a
//! schedule whose previous run is still in flight is skipped for that
//! tick rather than queued.

pub mod cron_expr;
pub mod daemon;
pub mod error;
pub mod schedule;
pub mod storage;

pub use daemon::{CronDaemon, EventSink, SchedulerEvent};
pub use error::{CronError, CronResult};
pub use schedule::{Schedule, ScheduleFilter, ScheduleId};
pub use storage::{JsonFileScheduleStorage, ScheduleStorage};
