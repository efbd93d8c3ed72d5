pub mod catalog;
pub mod chat_service;
pub mod embedding_service;
pub mod llm_service;
