//! Overlay node: the peer-to-peer subsystem that lets a controller node
//! discover, authenticate, connect to, measure, and remotely drive a fleet
//! of worker nodes.
//!
//! Dependency order (leaves first): [`identity`] → [`protocol`] →
//! [`bundles`] → [`registry`] → [`transport`] → [`worker`], [`controller`]
//! → [`dispatcher`].

pub mod bundles;
pub mod capabilities;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod worker;

pub use config::NodeConfig;
pub use controller::Controller;
pub use dispatcher::Dispatcher;
pub use error::{NodeError, NodeResult};
pub use identity::{NodeManager, Role};
pub use registry::PeerRegistry;
pub use transport::Transport;
pub use worker::Worker;
