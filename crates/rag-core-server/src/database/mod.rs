mod pool;
mod repository;

pub use pool::DbPool;
pub use repository::{ConversationUpdate, Repository};
