//! Filter chain dispatch.
//!
//! Filters are registered once, validated and initialized when the
//! pipeline starts, and then invoked for every batch whose tag and
//! event kind they cover. Data-level failures drop the offending batch
//! and are logged with the filter's name; they never remove a filter
//! from the chain.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{error, warn};

use crate::decode::{count_records, DecodeError};
use crate::encode::EncodeError;
use crate::tag::TagPattern;
use crate::EventKind;

/// The verdict a filter returns for a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Forward the incoming buffer unchanged; no allocation.
    Notouch,

    /// Release the incoming buffer and continue with this one.
    Modified(Vec<u8>),

    /// Abort the chain and emit an empty batch.
    Drop,
}

/// Set of errors a filter can signal for a single batch. The chain
/// drops the batch and continues with the next one.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FilterError {
    #[error("batch could not be decoded: {0}")]
    Decode(#[from] DecodeError),

    #[error("batch could not be re-encoded: {0}")]
    Encode(#[from] EncodeError),

    /// The filter was invoked outside its running state.
    #[error("filter is not running")]
    NotRunning,
}

/// Set of configuration errors that abort pipeline start.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown configuration key `{key}` for filter `{filter}`")]
    UnknownKey { filter: String, key: String },

    #[error("missing required configuration key `{key}` for filter `{filter}`")]
    MissingKey { filter: String, key: String },

    #[error("configuration key `{key}` given more than once for filter `{filter}`")]
    DuplicateKey { filter: String, key: String },

    #[error("invalid value `{value}` for configuration key `{key}`")]
    InvalidValue { key: String, value: String },

    #[error("invalid rule `{rule}`: {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("invalid regular expression `{pattern}`: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Include and exclude rules cannot be mixed in one filter
    /// instance, with or without a combinator.
    #[error("include and exclude rules cannot be combined in one filter instance")]
    ConflictingRules,

    #[error("filter `{filter}` targets {kind} events but no registered input provides them")]
    UnreachableTarget { filter: String, kind: EventKind },
}

/// One accepted configuration key of a filter, declared up front so
/// the chain can validate a configuration before `init` runs.
#[derive(Debug, Clone, Copy)]
pub struct ConfigKey {
    pub name: &'static str,
    pub required: bool,
    pub repeatable: bool,
}

/// Every filter accepts the tag pattern under this key; the chain
/// consumes it during registration.
pub const MATCH_KEY: ConfigKey = ConfigKey {
    name: "Match",
    required: false,
    repeatable: false,
};

/// An ordered key/value configuration, as parsed from the host's
/// pipeline definition. Keys compare case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct FilterConfig {
    entries: Vec<(String, String)>,
}

impl FilterConfig {
    pub fn new() -> FilterConfig {
        FilterConfig::default()
    }

    /// Builds a configuration from `(key, value)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> FilterConfig
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        FilterConfig {
            entries: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Appends one key/value entry. Repeatable keys appear once per
    /// occurrence.
    pub fn push(&mut self, key: &str, value: &str) {
        self.entries.push((key.to_owned(), value.to_owned()));
    }

    /// The first value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `key`, in insertion order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// All entries, in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A pipeline stage that transforms batches. Implementations must not
/// block: every invocation runs on the event-loop thread and completes
/// within one tick.
pub trait Filter {
    /// The filter's registered name, used in log lines.
    fn name(&self) -> &'static str;

    /// The configuration keys this filter accepts. Keys outside this
    /// table (other than the chain-level `Match`) abort pipeline
    /// start.
    fn config_map(&self) -> &'static [ConfigKey];

    /// Compiles the configuration. Called once, before the first
    /// batch. An error aborts pipeline start.
    fn init(&mut self, config: &FilterConfig) -> Result<(), ConfigError>;

    /// Transforms one batch.
    fn filter(&mut self, data: &[u8], tag: &str, kind: EventKind) -> Result<Verdict, FilterError>;

    /// Releases filter resources on pipeline stop.
    fn exit(&mut self) {}
}

/// Pipeline-global record counters. Updated only on the event-loop
/// thread; cheap enough for readers on other threads to poll.
#[derive(Debug, Default)]
pub(crate) struct ChainStats {
    records_in: AtomicU64,
    records_out: AtomicU64,
    records_dropped: AtomicU64,
}

/// A point-in-time copy of the pipeline counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StatsSnapshot {
    pub records_in: u64,
    pub records_out: u64,
    pub records_dropped: u64,
}

impl ChainStats {
    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            records_in: self.records_in.load(Ordering::Relaxed),
            records_out: self.records_out.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
        }
    }
}

struct Registration {
    pattern: TagPattern,
    target: EventKind,
    config: FilterConfig,
    filter: Box<dyn Filter>,
}

/// The ordered list of filters applied between inputs and outputs.
pub struct Chain {
    filters: Vec<Registration>,
    stats: Arc<ChainStats>,
    started: bool,
}

impl Default for Chain {
    fn default() -> Self {
        Chain::new()
    }
}

impl Chain {
    pub fn new() -> Chain {
        Chain {
            filters: Vec::new(),
            stats: Arc::new(ChainStats::default()),
            started: false,
        }
    }

    /// Registers a filter for batches of `target` kind. The tag
    /// pattern is taken from the configuration's `Match` key,
    /// defaulting to `*`.
    pub fn register(&mut self, target: EventKind, config: FilterConfig, filter: Box<dyn Filter>) {
        let pattern = TagPattern::new(config.get(MATCH_KEY.name).unwrap_or("*"));
        self.filters.push(Registration {
            pattern,
            target,
            config,
            filter,
        });
    }

    /// Validates every registration and initializes the filters in
    /// declaration order. `input_kinds` lists the event kinds the
    /// registered inputs produce; a filter targeting a kind no input
    /// provides is a configuration error. Any error aborts the start.
    pub fn start(&mut self, input_kinds: &[EventKind]) -> Result<(), ConfigError> {
        for reg in &mut self.filters {
            let name = reg.filter.name();
            if !input_kinds.contains(&reg.target) {
                return Err(ConfigError::UnreachableTarget {
                    filter: name.to_owned(),
                    kind: reg.target,
                });
            }
            validate_config(name, &reg.config, reg.filter.config_map())?;
            reg.filter.init(&reg.config)?;
        }
        self.started = true;
        Ok(())
    }

    /// Whether [`start`](Chain::start) has succeeded.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Dispatches one batch through every matching filter in
    /// declaration order and returns the surviving buffer, which is
    /// empty when the batch was dropped. Record order within the batch
    /// is never altered by the chain itself.
    pub fn dispatch(&mut self, tag: &str, kind: EventKind, batch: Vec<u8>) -> Vec<u8> {
        let records_in = count_records(&batch) as u64;
        self.stats.records_in.fetch_add(records_in, Ordering::Relaxed);

        let mut data = batch;
        for reg in &mut self.filters {
            if reg.target != kind || !reg.pattern.matches(tag) {
                continue;
            }
            match reg.filter.filter(&data, tag, kind) {
                Ok(Verdict::Notouch) => {}
                Ok(Verdict::Modified(new_buf)) => {
                    data = new_buf;
                }
                Ok(Verdict::Drop) => {
                    self.stats
                        .records_dropped
                        .fetch_add(count_records(&data) as u64, Ordering::Relaxed);
                    return Vec::new();
                }
                Err(e) => {
                    error!(
                        "[filter {}] dropping batch tag={} kind={}: {}",
                        reg.filter.name(),
                        tag,
                        kind,
                        e
                    );
                    self.stats
                        .records_dropped
                        .fetch_add(count_records(&data) as u64, Ordering::Relaxed);
                    return Vec::new();
                }
            }
            if data.is_empty() {
                // every record was filtered away; nothing left for
                // later stages
                break;
            }
        }

        let records_out = count_records(&data) as u64;
        self.stats.records_out.fetch_add(records_out, Ordering::Relaxed);
        if records_in > records_out {
            self.stats
                .records_dropped
                .fetch_add(records_in - records_out, Ordering::Relaxed);
        }
        data
    }

    /// Calls `exit` on every filter in declaration order.
    pub fn stop(&mut self) {
        if !self.started {
            warn!("stopping a chain that never started");
        }
        for reg in &mut self.filters {
            reg.filter.exit();
        }
        self.started = false;
    }

    /// The pipeline counters, shared with the owning pipeline.
    pub(crate) fn stats_handle(&self) -> Arc<ChainStats> {
        Arc::clone(&self.stats)
    }

    /// A point-in-time copy of the pipeline counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

fn validate_config(
    filter: &str,
    config: &FilterConfig,
    accepted: &[ConfigKey],
) -> Result<(), ConfigError> {
    for (key, _) in config.entries() {
        if key.eq_ignore_ascii_case(MATCH_KEY.name) {
            continue;
        }
        if !accepted.iter().any(|k| key.eq_ignore_ascii_case(k.name)) {
            return Err(ConfigError::UnknownKey {
                filter: filter.to_owned(),
                key: key.to_owned(),
            });
        }
    }
    for key in accepted {
        let occurrences = config.get_all(key.name).count();
        if key.required && occurrences == 0 {
            return Err(ConfigError::MissingKey {
                filter: filter.to_owned(),
                key: key.name.to_owned(),
            });
        }
        if !key.repeatable && occurrences > 1 {
            return Err(ConfigError::DuplicateKey {
                filter: filter.to_owned(),
                key: key.name.to_owned(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test double that records invocations and answers with a fixed
    /// verdict.
    struct Scripted {
        verdict: fn(&[u8]) -> Result<Verdict, FilterError>,
        calls: Arc<AtomicU64>,
    }

    impl Filter for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn config_map(&self) -> &'static [ConfigKey] {
            &[]
        }

        fn init(&mut self, _config: &FilterConfig) -> Result<(), ConfigError> {
            Ok(())
        }

        fn filter(
            &mut self,
            data: &[u8],
            _tag: &str,
            _kind: EventKind,
        ) -> Result<Verdict, FilterError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            (self.verdict)(data)
        }
    }

    fn scripted(
        verdict: fn(&[u8]) -> Result<Verdict, FilterError>,
    ) -> (Box<dyn Filter>, Arc<AtomicU64>) {
        let calls = Arc::new(AtomicU64::new(0));
        (
            Box::new(Scripted {
                verdict,
                calls: Arc::clone(&calls),
            }),
            calls,
        )
    }

    fn config(match_pattern: &str) -> FilterConfig {
        FilterConfig::from_pairs(vec![("Match", match_pattern)])
    }

    #[test]
    fn notouch_forwards_unchanged() {
        let mut chain = Chain::new();
        let (filter, calls) = scripted(|_| Ok(Verdict::Notouch));
        chain.register(EventKind::Logs, config("*"), filter);
        chain.start(&[EventKind::Logs]).unwrap();

        let out = chain.dispatch("t", EventKind::Logs, vec![0x92, 0x01, 0x80]);
        assert_eq!(out, vec![0x92, 0x01, 0x80]);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn modified_buffer_reaches_later_filters() {
        let mut chain = Chain::new();
        let (first, _) = scripted(|_| Ok(Verdict::Modified(vec![0x92, 0x05, 0x80])));
        let (second, calls) = scripted(|data| {
            assert_eq!(data, &[0x92, 0x05, 0x80][..]);
            Ok(Verdict::Notouch)
        });
        chain.register(EventKind::Logs, config("*"), first);
        chain.register(EventKind::Logs, config("*"), second);
        chain.start(&[EventKind::Logs]).unwrap();

        let out = chain.dispatch("t", EventKind::Logs, vec![0x92, 0x01, 0x80]);
        assert_eq!(out, vec![0x92, 0x05, 0x80]);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn drop_aborts_the_chain() {
        let mut chain = Chain::new();
        let (first, _) = scripted(|_| Ok(Verdict::Drop));
        let (second, calls) = scripted(|_| Ok(Verdict::Notouch));
        chain.register(EventKind::Logs, config("*"), first);
        chain.register(EventKind::Logs, config("*"), second);
        chain.start(&[EventKind::Logs]).unwrap();

        let out = chain.dispatch("t", EventKind::Logs, vec![0x92, 0x01, 0x80]);
        assert!(out.is_empty());
        assert_eq!(calls.load(Ordering::Relaxed), 0);
        assert_eq!(chain.stats().records_dropped, 1);
    }

    #[test]
    fn filter_error_drops_batch_but_keeps_filter() {
        let mut chain = Chain::new();
        let (filter, calls) = scripted(|_| Err(FilterError::NotRunning));
        chain.register(EventKind::Logs, config("*"), filter);
        chain.start(&[EventKind::Logs]).unwrap();

        assert!(chain.dispatch("t", EventKind::Logs, vec![0x92, 0x01, 0x80]).is_empty());
        // the next batch still reaches the filter
        assert!(chain.dispatch("t", EventKind::Logs, vec![0x92, 0x02, 0x80]).is_empty());
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn event_kind_and_tag_select_filters() {
        let mut chain = Chain::new();
        let (logs_filter, logs_calls) = scripted(|_| Ok(Verdict::Notouch));
        let (metrics_filter, metrics_calls) = scripted(|_| Ok(Verdict::Notouch));
        chain.register(EventKind::Logs, config("app.*"), logs_filter);
        chain.register(EventKind::Metrics, config("*"), metrics_filter);
        chain.start(&[EventKind::Logs, EventKind::Metrics]).unwrap();

        chain.dispatch("app.x", EventKind::Logs, vec![0x92, 0x01, 0x80]);
        chain.dispatch("db.x", EventKind::Logs, vec![0x92, 0x01, 0x80]);
        chain.dispatch("app.x", EventKind::Metrics, vec![0x92, 0x01, 0x80]);

        assert_eq!(logs_calls.load(Ordering::Relaxed), 1);
        assert_eq!(metrics_calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn unknown_key_aborts_start() {
        let mut chain = Chain::new();
        let (filter, _) = scripted(|_| Ok(Verdict::Notouch));
        let mut cfg = config("*");
        cfg.push("Bogus", "1");
        chain.register(EventKind::Logs, cfg, filter);
        assert!(matches!(
            chain.start(&[EventKind::Logs]),
            Err(ConfigError::UnknownKey { .. })
        ));
        assert!(!chain.is_started());
    }

    #[test]
    fn unreachable_target_aborts_start() {
        let mut chain = Chain::new();
        let (filter, _) = scripted(|_| Ok(Verdict::Notouch));
        chain.register(EventKind::Metrics, config("*"), filter);
        assert!(matches!(
            chain.start(&[EventKind::Logs]),
            Err(ConfigError::UnreachableTarget { .. })
        ));
    }
}
