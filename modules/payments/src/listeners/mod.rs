//! Bus listeners owned by the payments core

pub mod activity_log;

pub use activity_log::ActivityLog;
