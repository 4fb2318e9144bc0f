pub mod cleaner;
pub mod config;
pub mod effective_schedule;
pub mod error;
pub mod executor;
pub mod locker;
pub mod queue;
pub mod randomizer;
pub mod reconcile;
pub mod scheduler;
pub mod types;
pub mod worker;
