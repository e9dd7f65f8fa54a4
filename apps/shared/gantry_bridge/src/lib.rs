//! Gantry Object Bridge
//!
//! Keeps control-layer proxy objects and the native engine objects they
//! mirror in step, across two memory managers that never coordinate on
//! their own. This crate is shared by every host that embeds the engine.
//!
//! # Architecture
//!
//! - **TypeTag**: stable hash of a type name, identical on both sides
//! - **FactoryTable**: type tag → proxy allocator, plus on-create hooks
//! - **Bridge**: handle table, per-pointer creation, lifecycle transitions
//! - **OwnershipTracker**: per-attachment tokens that tell the engine when
//!   it may free an object
//! - **boundary**: the `extern "C"` entry points the engine calls
//! - **ForeignEngine**: everything the bridge asks of the engine

pub mod binding;
pub mod boundary;
pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod factory;
pub mod ffi;
pub mod handle;
pub mod lifecycle;
pub mod proxies;
pub mod proxy;
pub mod tracker;
pub mod type_tag;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub mod sync;

pub use binding::BindingMode;
pub use boundary::BoundaryCallbacks;
pub use bridge::{Bridge, ShutdownReport};
pub use config::BridgeConfig;
pub use engine::ForeignEngine;
pub use error::{BridgeError, EngineError, Result};
pub use events::{EventDispatcher, Subscription};
pub use factory::{FactoryBuilder, FactoryTable};
pub use handle::{CallbackId, ForeignPtr, HandleToken, ProxyId};
pub use lifecycle::{CollectReport, LifecycleState};
pub use proxy::{downcast_proxy, Proxy, ProxyCore, ProxyType};
pub use tracker::{OwnershipTracker, TokenRecord, TrackerStats};
pub use type_tag::TypeTag;
