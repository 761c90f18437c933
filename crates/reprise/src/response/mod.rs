//! Responses generated by the proxy itself.

mod builder;

pub use builder::ErrorResponseBuilder;
