//! Tower middleware that puts the rate limiter in front of a service.

mod layer;
mod response;

pub use layer::{wrap, RateLimitLayer, RateLimitService};
pub use response::ErrorBody;
