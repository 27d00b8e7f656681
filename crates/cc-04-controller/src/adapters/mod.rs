//! State-store backed implementations of the controller ports.

pub mod authorization;
pub mod resource_limits;

pub use authorization::DbAuthorization;
pub use resource_limits::DbResourceLimits;
