/// Idle timeout wrapper that ends a silent socket stream.
pub mod timeout;

pub use timeout::TimeoutStream;
