use rand::Rng;
use std::ops::Range;
#[cfg(test)] use std::sync::Mutex;


#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

/// Source of the random spread in backoff timers, abstracted for deterministic tests
#[cfg_attr(test, mockall::automock)]
pub trait Random: Send + Sync {
    fn gen_f64_range(range: Range<f64>) -> f64;
}

pub struct RngRandom {}
impl Random for RngRandom {
    fn gen_f64_range(range: Range<f64>) -> f64 {
        rand::rng().random_range(range)
    }
}
