pub mod cron;
pub mod scheduler;

pub use cron::CronSchedule;
pub use scheduler::{CronScheduler, until_next_minute};
