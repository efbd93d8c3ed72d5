pub mod error;
pub mod hashing;
pub mod similarity;
pub mod token_estimator;
