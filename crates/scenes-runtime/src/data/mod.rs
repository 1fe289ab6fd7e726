#![forbid(unsafe_code)]

//! The data pipeline.
//!
//! Data providers (query runners, layer sets, transformers) hang off a
//! node's `$data` slot and publish [`ResultEnvelope`]s on a replaying
//! [`Subject`]. Consumers find the nearest provider with [`get_data`].
//!
//! ```text
//! QueryProvider --> SceneQueryRunner --+--> SceneDataTransformer --> panel
//!                                      ^
//! AnnotationsDataLayer(s) --> SceneDataLayerSet (merged annotations)
//! ```

mod layers;
mod merge;
mod query_runner;
mod transformations;
mod transformer;

use std::fmt;
use std::rc::Rc;

use scenes_core::{SceneObject, Slot, Subject, WeakSceneObject};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::time_range::TimeRangeValue;

pub use layers::{AnnotationsDataLayer, LayerSetCap, SceneDataLayerSet};
pub use merge::{DataLayerMerger, MergedStream};
pub use query_runner::{
    FnQueryProvider, QueryProvider, QueryProviders, QueryRequest, QueryRunnerOptions,
    ResultSink, SceneQueryRunner,
};
pub use transformations::{
    CustomTransformation, DataTransformation, FilterByRefIdTransformation, LimitTransformation,
    TransformError,
};
pub use transformer::SceneDataTransformer;

/// Progress of a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadingState {
    /// Nothing requested yet.
    #[default]
    NotStarted,
    /// Waiting for the first response.
    Loading,
    /// Partial results, more to come.
    Streaming,
    /// Complete.
    Done,
    /// Failed; see [`PanelData::errors`].
    Error,
}

/// Which part of [`PanelData`] a frame or transformation belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataTopic {
    /// Regular result series.
    #[default]
    Series,
    /// Annotation frames.
    Annotations,
}

/// A query or transformation failure carried inside the data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryError {
    /// Human-readable message.
    pub message: String,
    /// The query it belongs to, if known.
    pub ref_id: Option<String>,
}

impl QueryError {
    /// Error with `message`.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ref_id: None,
        }
    }

    /// Attribute to query `ref_id`.
    #[must_use]
    pub fn with_ref_id(mut self, ref_id: impl Into<String>) -> Self {
        self.ref_id = Some(ref_id.into());
        self
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ref_id {
            Some(ref_id) => write!(f, "{ref_id}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// A named column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    /// Column name.
    pub name: String,
    /// Cell values.
    pub values: Vec<Value>,
}

impl Field {
    /// Column `name` holding `values`.
    pub fn new(name: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

/// A table of fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataFrame {
    /// Frame name.
    pub name: Option<String>,
    /// The query that produced it.
    pub ref_id: Option<String>,
    /// Columns.
    pub fields: Vec<Field>,
}

impl DataFrame {
    /// Empty frame for query `ref_id`.
    pub fn new(ref_id: impl Into<String>) -> Self {
        Self {
            name: None,
            ref_id: Some(ref_id.into()),
            fields: Vec::new(),
        }
    }

    /// Add a column.
    #[must_use]
    pub fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Row count (longest column).
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.iter().map(|f| f.values.len()).max().unwrap_or(0)
    }

    /// Whether there are no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a data provider publishes.
///
/// `series` and `annotations` are shared slices; consumers compare them by
/// pointer to tell whether anything but `state` changed.
#[derive(Debug, Clone, PartialEq)]
pub struct PanelData {
    /// Loading state.
    pub state: LoadingState,
    /// Result series.
    pub series: Rc<[DataFrame]>,
    /// Annotation frames.
    pub annotations: Option<Rc<[DataFrame]>>,
    /// Errors, in arrival order.
    pub errors: Vec<QueryError>,
    /// Range the data was requested for.
    pub time_range: TimeRangeValue,
    /// Request that produced the data.
    pub request: Option<Rc<QueryRequest>>,
}

impl PanelData {
    /// No frames, in `state`.
    #[must_use]
    pub fn empty(state: LoadingState, time_range: TimeRangeValue) -> Self {
        Self {
            state,
            series: Rc::from(Vec::new()),
            annotations: None,
            errors: Vec::new(),
            time_range,
            request: None,
        }
    }

    /// Replace the series.
    #[must_use]
    pub fn with_series(mut self, series: Vec<DataFrame>) -> Self {
        self.series = Rc::from(series);
        self
    }

    /// Replace the annotations.
    #[must_use]
    pub fn with_annotations(mut self, annotations: Vec<DataFrame>) -> Self {
        self.annotations = Some(Rc::from(annotations));
        self
    }

    /// Append an error and switch to [`LoadingState::Error`].
    #[must_use]
    pub fn with_error(mut self, error: QueryError) -> Self {
        self.errors.push(error);
        self.state = LoadingState::Error;
        self
    }

    /// The first error.
    #[must_use]
    pub fn error(&self) -> Option<&QueryError> {
        self.errors.first()
    }

    /// Whether `other` carries the same series and annotation slices.
    #[must_use]
    pub fn same_frames(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.series, &other.series)
            && match (&self.annotations, &other.annotations) {
                (Some(a), Some(b)) => Rc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            }
    }
}

/// The unit flowing between providers: who produced it and what.
#[derive(Clone)]
pub struct ResultEnvelope {
    /// Producer.
    pub origin: WeakSceneObject,
    /// Producer's key, stable across re-creation.
    pub origin_key: String,
    /// Payload.
    pub data: Rc<PanelData>,
}

impl ResultEnvelope {
    /// Envelope from `origin`.
    #[must_use]
    pub fn new(origin: &SceneObject, data: Rc<PanelData>) -> Self {
        Self {
            origin: origin.downgrade(),
            origin_key: origin.key().to_owned(),
            data,
        }
    }
}

impl fmt::Debug for ResultEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultEnvelope")
            .field("origin", &self.origin_key)
            .field("state", &self.data.state)
            .field("series", &self.data.series.len())
            .finish()
    }
}

/// A node that publishes data.
pub trait SceneDataProvider {
    /// Latest data, if any.
    fn data(&self) -> Option<Rc<PanelData>>;

    /// Result stream; replays the latest envelope to new subscribers.
    fn results(&self) -> Subject<ResultEnvelope>;

    /// Re-issue queries.
    fn run_queries(&self) {}

    /// Cancel in-flight work.
    fn cancel_query(&self) {}

    /// Whether data should be shown yet.
    fn is_data_ready_to_display(&self) -> bool {
        true
    }
}

/// Capability marking a node as a data provider.
#[derive(Clone)]
pub struct DataProviderCap(pub Rc<dyn SceneDataProvider>);

/// A provider together with its node.
#[derive(Clone)]
pub struct DataProviderRef {
    /// The provider's node.
    pub object: SceneObject,
    /// The provider.
    pub provider: Rc<dyn SceneDataProvider>,
}

impl DataProviderRef {
    /// Wrap `object` if it is a provider.
    #[must_use]
    pub fn from_object(object: &SceneObject) -> Option<Self> {
        object.capability::<DataProviderCap>().map(|cap| Self {
            object: object.clone(),
            provider: Rc::clone(&cap.0),
        })
    }
}

impl fmt::Debug for DataProviderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataProviderRef")
            .field("object", &self.object.key())
            .finish_non_exhaustive()
    }
}

/// The nearest `$data` provider, starting at `object`.
#[must_use]
pub fn get_data(object: &SceneObject) -> Option<DataProviderRef> {
    std::iter::once(object.clone())
        .chain(object.ancestors())
        .filter_map(|node| node.slot(Slot::Data))
        .find_map(|slot| DataProviderRef::from_object(&slot))
}
