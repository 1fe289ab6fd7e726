#![forbid(unsafe_code)]

//! Scene graph core.
//!
//! This crate provides the node model every other scene crate builds on:
//!
//! - [`SceneObject`] - shared node handle with immutable state snapshots,
//!   parent-owns-children links and typed capabilities
//! - [`StateSnapshot`] / [`StatePatch`] - immutable state and partial updates
//! - [`SceneEvent`] / [`Subscription`] - per-node event bus with bubbling
//! - Activation lifecycle ([`SceneObject::activate`],
//!   [`SceneObject::deactivate`]) with cleanup release lists
//! - [`Subject`] / [`Deferred`] - push streams for asynchronous results
//!
//! # Role in the workspace
//! `scenes-core` knows nothing about variables, queries or URLs. Those live
//! in `scenes-runtime` and reach the core only through activation handlers,
//! capabilities and subscriptions.

pub mod error;
pub mod event;
pub mod lifecycle;
pub mod object;
pub mod state;
pub mod stream;

pub use error::{SceneError, SceneResult};
pub use event::{CustomEvent, SceneEvent, StateChangedEvent, Subscription};
pub use lifecycle::{ActivationHandler, Cleanup};
pub use object::{SceneObject, Slot, WeakSceneObject, Walk};
pub use state::{StatePatch, StateSnapshot};
pub use stream::{Deferred, Resolver, Subject, join, join_all};
