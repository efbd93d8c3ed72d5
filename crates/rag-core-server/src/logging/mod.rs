mod logger;
mod types;

pub use logger::{ActivityLogger, LoggerConfig};
pub use types::{ActivityLog, ActivityLogBuilder, ActivityStatus, ActivityType};
