#![forbid(unsafe_code)]

//! Scene Runtime
//!
//! This crate provides the behavior that makes a scene tree useful: named
//! variables, text interpolation, time ranges, the query/data pipeline and
//! two-way URL synchronisation.
//!
//! # Key Components
//!
//! - [`SceneVariableSet`] / [`SceneVariable`] - variables validated in
//!   dependency order, with dependent notification
//! - [`VariableDependencyConfig`] - per-node tracking of referenced variables
//! - [`interpolate`] / [`interpolate_with`] - token substitution with formats
//! - [`SceneTimeRange`] - raw and resolved time ranges
//! - [`SceneQueryRunner`] - request building and dispatch to a [`QueryProvider`]
//! - [`SceneDataLayerSet`] / [`DataLayerMerger`] - merged annotation layers
//! - [`SceneDataTransformer`] - transformation pipelines over another provider
//! - [`UrlSyncManager`] - URL query parameters to state and back
//!
//! # Role in the workspace
//! `scenes-runtime` sits on top of `scenes-core`. Every component here is a
//! capability attached to a [`scenes_core::SceneObject`] and wired through
//! activation handlers, so the core stays unaware of it.

pub mod data;
pub mod interpolate;
pub mod time_range;
pub mod url_sync;
pub mod variables;

pub use data::{
    AnnotationsDataLayer, DataFrame, DataLayerMerger, DataProviderRef, DataTopic,
    DataTransformation, Field, LoadingState, PanelData, QueryError, QueryProvider, QueryProviders,
    QueryRequest, QueryRunnerOptions, ResultEnvelope, SceneDataLayerSet, SceneDataProvider,
    SceneDataTransformer, SceneQueryRunner, get_data,
};
pub use interpolate::{
    InterpolateOptions, InterpolationError, ScopedVar, ScopedVars, VariableFormat, interpolate,
    interpolate_json, interpolate_with,
};
pub use time_range::{Clock, FixedClock, SceneTimeRange, SystemClock, TimeRangeValue, get_time_range};
pub use url_sync::{
    LocationService, MemoryLocation, QueryParams, StateFieldSync, SyncedField, UrlState,
    UrlSyncHandler, UrlSyncManager, UrlSyncOptions, UrlValue,
};
pub use variables::{
    SceneVariable, SceneVariableSet, VariableConfig, VariableDependencyConfig, VariableOption,
    VariableSource, VariableValue, lookup_variable,
};
