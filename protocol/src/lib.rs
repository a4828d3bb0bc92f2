//! Wire contracts of the Resource Management Protocol.
//!
//! These types travel between a manager's resource clients and the resource
//! servers of other managers. Domain-specific request and response schemas
//! are owned by collaborators and carried as an opaque JSON `payload`; the
//! `rmp` metadata wrapped around them is owned here.

pub mod error_stack;
pub mod messages;

pub use error_stack::ErrorFrame;
pub use error_stack::ErrorStack;
pub use messages::*;

/// Identifier of one binding (internal) or one bound caller (external).
pub type ResourceId = u64;

/// Never minted; marks a response that carries no resource.
pub const UNASSIGNED_ID: ResourceId = 0;

/// Response code for a satisfied request.
pub const CODE_OK: i32 = 0;

/// Response code for a request the server could not satisfy.
pub const CODE_FAILED: i32 = 1;

/// Address a manager listens on for status pushes.
pub fn status_address(manager: &str) -> String {
    format!("{manager}/status")
}
