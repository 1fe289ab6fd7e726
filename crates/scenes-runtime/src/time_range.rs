#![forbid(unsafe_code)]

//! Time ranges and interval arithmetic.
//!
//! A [`SceneTimeRange`] keeps the raw `from`/`to` expressions (`now-6h`,
//! `now/d`, epoch milliseconds) alongside the resolved `value`. Queries
//! below it use the resolved value; the raw form round-trips through the
//! URL as `from` and `to`.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use scenes_core::{SceneObject, Slot, StatePatch, StateSnapshot, Subscription};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::url_sync::{UrlState, UrlSyncCap, UrlSyncHandler, UrlValue};

const SECOND: i64 = 1_000;
const MINUTE: i64 = 60 * SECOND;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;
const WEEK: i64 = 7 * DAY;

/// Source of the current time.
pub trait Clock {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct FixedClock {
    now: Cell<i64>,
}

impl FixedClock {
    /// Clock stopped at `now_ms`.
    #[must_use]
    pub fn new(now_ms: i64) -> Self {
        Self {
            now: Cell::new(now_ms),
        }
    }

    /// Move to `now_ms`.
    pub fn set(&self, now_ms: i64) {
        self.now.set(now_ms);
    }

    /// Move forward by `delta_ms`.
    pub fn advance(&self, delta_ms: i64) {
        self.now.set(self.now.get() + delta_ms);
    }
}

impl Clock for FixedClock {
    fn now_ms(&self) -> i64 {
        self.now.get()
    }
}

/// A resolved range in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRangeValue {
    /// Start.
    pub from: i64,
    /// End.
    pub to: i64,
}

impl TimeRangeValue {
    /// Length of the range.
    #[must_use]
    pub fn span_ms(&self) -> i64 {
        (self.to - self.from).max(0)
    }
}

fn unit_ms(unit: &str) -> Option<i64> {
    Some(match unit {
        "ms" => 1,
        "s" => SECOND,
        "m" => MINUTE,
        "h" => HOUR,
        "d" => DAY,
        "w" => WEEK,
        // Calendar units use fixed lengths.
        "M" => 30 * DAY,
        "y" => 365 * DAY,
        _ => return None,
    })
}

fn take_unit(rest: &str) -> (&str, &str) {
    let end = rest
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(rest.len());
    rest.split_at(end)
}

/// Resolve a time expression against `now_ms`.
///
/// Accepts epoch milliseconds, `now`, and `now` followed by offsets
/// (`-6h`, `+1d`) and rounding (`/d`). Rounding goes to the start of the
/// unit, or to its last millisecond when `round_up`.
#[must_use]
pub fn parse_time(raw: &str, now_ms: i64, round_up: bool) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(epoch) = raw.parse::<i64>() {
        return Some(epoch);
    }
    let mut rest = raw.strip_prefix("now")?;
    let mut time = now_ms;
    while let Some(op) = rest.chars().next() {
        rest = &rest[op.len_utf8()..];
        match op {
            '+' | '-' => {
                let digits = rest
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(rest.len());
                let amount: i64 = if digits == 0 {
                    1
                } else {
                    rest[..digits].parse().ok()?
                };
                let (unit, tail) = take_unit(&rest[digits..]);
                let delta = amount.checked_mul(unit_ms(unit)?)?;
                time = if op == '+' { time + delta } else { time - delta };
                rest = tail;
            }
            '/' => {
                let (unit, tail) = take_unit(rest);
                let size = unit_ms(unit)?;
                let start = time.div_euclid(size) * size;
                time = if round_up { start + size - 1 } else { start };
                rest = tail;
            }
            _ => return None,
        }
    }
    Some(time)
}

/// Parse an interval such as `30s`, `5m` or `1h` into milliseconds.
///
/// A bare number is taken as seconds.
#[must_use]
pub fn parse_interval(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let digits = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    if digits == 0 {
        return None;
    }
    let amount: i64 = raw[..digits].parse().ok()?;
    let unit = &raw[digits..];
    if unit.is_empty() {
        return amount.checked_mul(SECOND);
    }
    amount.checked_mul(unit_ms(unit)?)
}

/// Render milliseconds with the largest unit that divides them.
#[must_use]
pub fn format_interval(ms: i64) -> String {
    if ms <= 0 {
        return "0s".to_owned();
    }
    for (size, unit) in [(DAY, "d"), (HOUR, "h"), (MINUTE, "m"), (SECOND, "s")] {
        if ms % size == 0 {
            return format!("{}{unit}", ms / size);
        }
    }
    format!("{ms}ms")
}

/// Snap an interval to a "nice" value.
#[must_use]
pub fn round_interval(ms: i64) -> i64 {
    const STEPS: [(i64, i64); 29] = [
        (15, 10),
        (35, 20),
        (75, 50),
        (150, 100),
        (350, 200),
        (750, 500),
        (1_500, SECOND),
        (3_500, 2 * SECOND),
        (7_500, 5 * SECOND),
        (12_500, 10 * SECOND),
        (17_500, 15 * SECOND),
        (25_000, 20 * SECOND),
        (45_000, 30 * SECOND),
        (90_000, MINUTE),
        (210_000, 2 * MINUTE),
        (450_000, 5 * MINUTE),
        (750_000, 10 * MINUTE),
        (1_050_000, 15 * MINUTE),
        (1_500_000, 20 * MINUTE),
        (2_700_000, 30 * MINUTE),
        (5_400_000, HOUR),
        (9_000_000, 2 * HOUR),
        (16_200_000, 3 * HOUR),
        (24_300_000, 6 * HOUR),
        (32_400_000, 8 * HOUR),
        (86_400_000, 12 * HOUR),
        (604_800_000, DAY),
        (1_814_400_000, WEEK),
        (3_628_800_000, 30 * DAY),
    ];
    STEPS
        .iter()
        .find(|(limit, _)| ms < *limit)
        .map_or(365 * DAY, |(_, step)| *step)
}

/// Query interval for a range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryInterval {
    /// Display form, e.g. `30s`.
    pub interval: String,
    /// Milliseconds.
    pub interval_ms: i64,
}

/// Divide `range` into at most `max_data_points` steps, never below
/// `min_interval`.
#[must_use]
pub fn calculate_interval(
    range: TimeRangeValue,
    max_data_points: u32,
    min_interval: Option<&str>,
) -> QueryInterval {
    let resolution = i64::from(max_data_points.max(1));
    let low_limit = min_interval.and_then(parse_interval).unwrap_or(1);
    let interval_ms = round_interval(range.span_ms() / resolution).max(low_limit);
    QueryInterval {
        interval: format_interval(interval_ms),
        interval_ms,
    }
}

struct TimeRangeCore {
    clock: Rc<dyn Clock>,
}

/// A time range scene object.
///
/// # State fields
///
/// `from` and `to` hold the raw expressions; `value` holds
/// `{from, to}` in epoch milliseconds.
#[derive(Clone)]
pub struct SceneTimeRange {
    object: SceneObject,
    core: Rc<TimeRangeCore>,
}

impl SceneTimeRange {
    /// Range resolved against the system clock.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::with_clock(from, to, Rc::new(SystemClock))
    }

    /// Range resolved against `clock`.
    pub fn with_clock(from: impl Into<String>, to: impl Into<String>, clock: Rc<dyn Clock>) -> Self {
        let from = from.into();
        let to = to.into();
        let value = Self::evaluate(clock.as_ref(), &from, &to);
        let state = StateSnapshot::from_json(json!({
            "from": from,
            "to": to,
            "value": value,
        }));
        let object = SceneObject::new("SceneTimeRange", state);
        let core = Rc::new(TimeRangeCore { clock });
        object.attach(Rc::clone(&core));
        object.attach(Rc::new(UrlSyncCap(Rc::new(TimeRangeUrlSync))));
        Self { object, core }
    }

    /// Recover the time range view of a scene object.
    #[must_use]
    pub fn from_object(object: &SceneObject) -> Option<Self> {
        object.capability::<TimeRangeCore>().map(|core| Self {
            object: object.clone(),
            core,
        })
    }

    fn evaluate(clock: &dyn Clock, from: &str, to: &str) -> TimeRangeValue {
        let now = clock.now_ms();
        let resolve = |raw: &str, round_up: bool| {
            parse_time(raw, now, round_up).unwrap_or_else(|| {
                warn!(raw, "unparseable time expression, using now");
                now
            })
        };
        TimeRangeValue {
            from: resolve(from, false),
            to: resolve(to, true),
        }
    }

    /// The underlying scene object.
    #[must_use]
    pub fn object(&self) -> &SceneObject {
        &self.object
    }

    /// Raw start expression.
    #[must_use]
    pub fn raw_from(&self) -> String {
        self.object.state().get_str("from").unwrap_or("now-6h").to_owned()
    }

    /// Raw end expression.
    #[must_use]
    pub fn raw_to(&self) -> String {
        self.object.state().get_str("to").unwrap_or("now").to_owned()
    }

    /// Resolved range.
    #[must_use]
    pub fn value(&self) -> TimeRangeValue {
        self.object
            .state()
            .get("value")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_else(|| Self::evaluate(self.core.clock.as_ref(), &self.raw_from(), &self.raw_to()))
    }

    /// Switch to a new range.
    pub fn on_time_range_change(&self, from: impl Into<String>, to: impl Into<String>) {
        let from = from.into();
        let to = to.into();
        let value = Self::evaluate(self.core.clock.as_ref(), &from, &to);
        debug!(key = %self.object.key(), %from, %to, "time range changed");
        self.object.set_state(
            StatePatch::new()
                .set("from", from)
                .set("to", to)
                .set("value", json!(value)),
        );
    }

    /// Re-resolve relative expressions against the current time.
    pub fn on_refresh(&self) {
        let value = Self::evaluate(self.core.clock.as_ref(), &self.raw_from(), &self.raw_to());
        debug!(key = %self.object.key(), "time range refreshed");
        self.object.set_state(StatePatch::new().set("value", json!(value)));
    }

    /// Called with the new value whenever it is set, even if unchanged.
    pub fn subscribe_to_value(&self, callback: impl Fn(TimeRangeValue) + 'static) -> Subscription {
        self.object.subscribe_to_state(move |change| {
            if change.field_changed("value") {
                if let Some(value) = change
                    .new_state
                    .get("value")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                {
                    callback(value);
                }
            }
        })
    }
}

/// The nearest time range: `object` itself, its `$timeRange` slot, then
/// the same for each ancestor.
#[must_use]
pub fn get_time_range(object: &SceneObject) -> Option<SceneTimeRange> {
    std::iter::once(object.clone())
        .chain(object.ancestors())
        .find_map(|node| {
            SceneTimeRange::from_object(&node).or_else(|| {
                node.slot(Slot::TimeRange)
                    .and_then(|slot| SceneTimeRange::from_object(&slot))
            })
        })
}

struct TimeRangeUrlSync;

impl UrlSyncHandler for TimeRangeUrlSync {
    fn keys(&self, _object: &SceneObject) -> Vec<String> {
        vec!["from".to_owned(), "to".to_owned()]
    }

    fn get_url_state(&self, object: &SceneObject) -> UrlState {
        let mut state = UrlState::new();
        if let Some(range) = SceneTimeRange::from_object(object) {
            state.insert("from".into(), Some(UrlValue::Single(range.raw_from())));
            state.insert("to".into(), Some(UrlValue::Single(range.raw_to())));
        }
        state
    }

    fn update_from_url(&self, object: &SceneObject, values: &UrlState) {
        let Some(range) = SceneTimeRange::from_object(object) else {
            return;
        };
        let pick = |key: &str| match values.get(key) {
            Some(Some(value)) => value.as_list().into_iter().next(),
            _ => None,
        };
        let from = pick("from").unwrap_or_else(|| range.raw_from());
        let to = pick("to").unwrap_or_else(|| range.raw_to());
        if from != range.raw_from() || to != range.raw_to() {
            range.on_time_range_change(from, to);
        }
    }

    fn should_create_history_step(&self, _object: &SceneObject) -> bool {
        true
    }
}
