#![forbid(unsafe_code)]

//! Scenes public facade crate.
//!
//! This crate provides the stable surface area for users. It re-exports the
//! common types of `scenes-core` and `scenes-runtime` and offers a prelude
//! for day-to-day usage.
//!
//! # Example
//!
//! ```
//! use scenes::prelude::*;
//!
//! let root = SceneObject::new("Dashboard", StateSnapshot::new());
//! let range = SceneTimeRange::new("now-6h", "now");
//! root.set_slot(Slot::TimeRange, Some(range.object())).unwrap();
//!
//! let region = SceneVariable::new("region", CustomSource::new("us,eu"), VariableConfig::default());
//! let set = SceneVariableSet::new(vec![region.clone()]);
//! root.set_slot(Slot::Variables, Some(set.object())).unwrap();
//!
//! root.activate().unwrap();
//! assert_eq!(interpolate(&root, "region=$region", None, None), "region=us");
//! ```

use std::fmt;

#[cfg(feature = "tracing-init")]
pub mod logging;

// --- Core re-exports -------------------------------------------------------

pub use scenes_core::{
    CustomEvent, Deferred, Resolver, SceneError, SceneEvent, SceneObject, SceneResult, Slot,
    StateChangedEvent, StatePatch, StateSnapshot, Subject, Subscription, WeakSceneObject, Walk,
};

// --- Runtime re-exports ----------------------------------------------------

pub use scenes_runtime::data::{
    AnnotationsDataLayer, CustomTransformation, DataFrame, DataLayerMerger, DataTopic,
    DataTransformation, Field, FilterByRefIdTransformation, FnQueryProvider, LimitTransformation,
    LoadingState, PanelData, QueryError, QueryProvider, QueryProviders, QueryRequest,
    QueryRunnerOptions, ResultEnvelope, ResultSink, SceneDataLayerSet, SceneDataProvider,
    SceneDataTransformer, SceneQueryRunner, TransformError, get_data,
};
pub use scenes_runtime::interpolate::{
    CustomFormat, InterpolateOptions, InterpolationError, ScopedVar, ScopedVars, VariableFormat,
    interpolate, interpolate_json, interpolate_with,
};
pub use scenes_runtime::time_range::{
    Clock, FixedClock, SceneTimeRange, SystemClock, TimeRangeValue, get_time_range,
};
pub use scenes_runtime::url_sync::{
    LocationService, MemoryLocation, QueryParams, StateFieldSync, SyncedField, UrlState,
    UrlSyncHandler, UrlSyncManager, UrlSyncOptions, UrlValue,
};
pub use scenes_runtime::variables::{
    ConstantSource, CustomSource, FnOptionsProvider, IntervalSource, JsonSource, OptionsProvider,
    QuerySource, SceneVariable, SceneVariableSet, TextBoxSource, VariableConfig,
    VariableDependencyConfig, VariableOption, VariableSource, VariableValue, lookup_variable,
};

// --- Errors ---------------------------------------------------------------

/// Top-level error type for scene applications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Tree or activation misuse.
    Scene(SceneError),
    /// Interpolation configured to fail on unknown variables.
    Interpolation(InterpolationError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scene(err) => write!(f, "{err}"),
            Self::Interpolation(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Scene(err) => Some(err),
            Self::Interpolation(err) => Some(err),
        }
    }
}

impl From<SceneError> for Error {
    fn from(err: SceneError) -> Self {
        Self::Scene(err)
    }
}

impl From<InterpolationError> for Error {
    fn from(err: InterpolationError) -> Self {
        Self::Interpolation(err)
    }
}

/// Standard result type for scenes APIs.
pub type Result<T> = std::result::Result<T, Error>;

// --- Prelude --------------------------------------------------------------

pub mod prelude {
    pub use crate::{
        CustomSource, DataTransformation, Error, LoadingState, PanelData, QueryProviders,
        QueryRunnerOptions, Result, SceneDataTransformer, SceneObject, SceneQueryRunner,
        SceneTimeRange, SceneVariable, SceneVariableSet, Slot, StatePatch, StateSnapshot,
        Subscription, UrlSyncManager, UrlSyncOptions, VariableConfig, interpolate,
    };

    pub use serde_json::{Value, json};

    pub use crate::{core, runtime};
}

pub use scenes_core as core;
pub use scenes_runtime as runtime;
