#![forbid(unsafe_code)]

//! Transformation steps.

use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

use scenes_core::Deferred;

use super::{DataFrame, DataTopic};

/// A failed transformation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformError {
    /// Id of the failing step.
    pub transformation: String,
    /// What went wrong.
    pub message: String,
}

impl TransformError {
    /// Failure of step `transformation`.
    pub fn new(transformation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            transformation: transformation.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for TransformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transformation {} failed: {}", self.transformation, self.message)
    }
}

impl std::error::Error for TransformError {}

/// Outcome of one step; may complete later.
pub type TransformResult = Deferred<Result<Vec<DataFrame>, TransformError>>;

/// One step of a transformer pipeline.
pub trait DataTransformation {
    /// Step id, used in errors and logs.
    fn id(&self) -> &str;

    /// Which frames the step applies to.
    fn topic(&self) -> DataTopic {
        DataTopic::Series
    }

    /// Transform `frames`.
    fn apply(&self, frames: Vec<DataFrame>) -> TransformResult;
}

/// Keep at most `limit` rows per frame.
#[derive(Debug, Clone, Copy)]
pub struct LimitTransformation {
    /// Row limit.
    pub limit: usize,
}

impl DataTransformation for LimitTransformation {
    fn id(&self) -> &str {
        "limit"
    }

    fn apply(&self, mut frames: Vec<DataFrame>) -> TransformResult {
        for frame in &mut frames {
            for field in &mut frame.fields {
                field.values.truncate(self.limit);
            }
        }
        Deferred::ready(Ok(frames))
    }
}

/// Keep frames produced by the listed queries.
#[derive(Debug, Clone, Default)]
pub struct FilterByRefIdTransformation {
    ref_ids: BTreeSet<String>,
}

impl FilterByRefIdTransformation {
    /// Keep frames whose `ref_id` is in `ref_ids`.
    pub fn new<I, S>(ref_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ref_ids: ref_ids.into_iter().map(Into::into).collect(),
        }
    }
}

impl DataTransformation for FilterByRefIdTransformation {
    fn id(&self) -> &str {
        "filterByRefId"
    }

    fn apply(&self, frames: Vec<DataFrame>) -> TransformResult {
        let kept = frames
            .into_iter()
            .filter(|frame| {
                frame
                    .ref_id
                    .as_ref()
                    .is_some_and(|id| self.ref_ids.contains(id))
            })
            .collect();
        Deferred::ready(Ok(kept))
    }
}

type ApplyFn = Rc<dyn Fn(Vec<DataFrame>) -> TransformResult>;

/// A step backed by a closure.
#[derive(Clone)]
pub struct CustomTransformation {
    id: String,
    topic: DataTopic,
    apply: ApplyFn,
}

impl CustomTransformation {
    /// Synchronous step.
    pub fn new(
        id: impl Into<String>,
        apply: impl Fn(Vec<DataFrame>) -> Result<Vec<DataFrame>, TransformError> + 'static,
    ) -> Self {
        Self::deferred(id, move |frames| Deferred::ready(apply(frames)))
    }

    /// Step that may complete later.
    pub fn deferred(
        id: impl Into<String>,
        apply: impl Fn(Vec<DataFrame>) -> TransformResult + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            topic: DataTopic::Series,
            apply: Rc::new(apply),
        }
    }

    /// Apply to `topic` instead of series.
    #[must_use]
    pub fn with_topic(mut self, topic: DataTopic) -> Self {
        self.topic = topic;
        self
    }
}

impl fmt::Debug for CustomTransformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomTransformation")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl DataTransformation for CustomTransformation {
    fn id(&self) -> &str {
        &self.id
    }

    fn topic(&self) -> DataTopic {
        self.topic
    }

    fn apply(&self, frames: Vec<DataFrame>) -> TransformResult {
        (self.apply)(frames)
    }
}

/// Run `steps` in order over `frames`; the first failure short-circuits.
pub(crate) fn run_pipeline(
    steps: Vec<Rc<dyn DataTransformation>>,
    frames: Vec<DataFrame>,
) -> TransformResult {
    steps
        .into_iter()
        .fold(Deferred::ready(Ok(frames)), |acc, step| {
            acc.and_then(move |result| match result {
                Ok(frames) => step.apply(frames),
                Err(err) => Deferred::ready(Err(err)),
            })
        })
}
