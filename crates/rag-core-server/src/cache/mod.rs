pub mod batch_processor;
pub mod embedding_cache;
pub mod strategies;
