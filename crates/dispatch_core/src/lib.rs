pub mod clock;
pub mod dispatch;
pub mod fare;
pub mod geo;
pub mod lifecycle;
pub mod matching;
pub mod pubsub;
pub mod store;
pub mod tracking;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;
