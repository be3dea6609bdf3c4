//! Rate limiting algorithms and the engine that runs them.

mod algorithm;
mod engine;
mod fixed_window;
mod leaky_bucket;
mod sliding_window;
mod token_bucket;

pub use algorithm::{
    Algorithm, AlgorithmParams, RateAlgorithm, RateLimitDecision, WindowRequest, WindowState,
};
pub use engine::{AlgorithmEngine, ExceedStrategy, LimitSpec, MAX_WINDOW_SECS, MIN_RATE};
pub use fixed_window::FixedWindow;
pub use leaky_bucket::LeakyBucket;
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;
