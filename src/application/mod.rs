pub mod bootstrap;
pub mod calendar_sync;
pub mod engine;
pub mod expansion_scheduler;
pub mod token_manager;
pub mod user_locks;
