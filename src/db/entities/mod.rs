//! SeaORM entities for the persisted schema.

pub mod daily_stats;
pub mod device_auth_code;
pub mod hourly_stats;
pub mod live_stats;
pub mod request_log;
pub mod tunnel;
pub mod user;
