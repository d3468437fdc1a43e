//! Market Monitoring
//! Mission: Sample every configured market on a fixed cadence, forever

pub mod scheduler;

pub use scheduler::{
    MarketFailure, PollScheduler, RunStats, SchedulerSettings, SchedulerState, TickReport,
};
