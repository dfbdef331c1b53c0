//! Concurrency primitives shared by the session and digest caches

mod singleflight;

pub use singleflight::SingleFlight;
