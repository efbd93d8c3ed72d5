pub mod circuit_breaker;
pub mod degradation;
pub mod intervention;
