//! Resource Management Protocol runtime.
//!
//! Components acquire resources from one another through a
//! [`ResourceManager`]. Structurally-equal requests share one instance,
//! every caller holds its own binding, and a resource is torn down (together
//! with everything acquired while loading it) once its last binding is
//! released.

mod client;
pub mod config;
mod error;
mod ids;
pub mod local_bus;
mod manager;
mod query;
mod server;
pub mod transport;

pub use client::ClientBinding;
pub use client::ResourceClient;
pub use config::BusConfig;
pub use config::ConfigLoader;
pub use config::RmpConfig;
pub use error::RmpError;
pub use error::TransportError;
pub use ids::IdAllocator;
pub use local_bus::LocalBus;
pub use manager::LoadContext;
pub use manager::Loaded;
pub use manager::ResourceManager;
pub use manager::StatusCallback;
pub use query::SELF_LABEL;
pub use server::ResourceHandler;
pub use server::ResourceServer;
pub use server::StatusDelivery;
pub use transport::JoinedLoad;
pub use transport::LoadAnswer;
pub use transport::ServerEndpoint;
pub use transport::StatusSink;
pub use transport::Transport;

pub use rmp_protocol as protocol;
