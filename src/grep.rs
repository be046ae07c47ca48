//! The reference filter: regular-expression include/exclude rules over
//! record fields.
//!
//! Rules are compiled once when the filter initializes and are
//! read-only afterwards. Evaluation runs on the zero-copy decoder; a
//! surviving batch is rebuilt by copying the raw byte spans of the
//! kept records, so bytes materialize only at the stage boundary.

use log::warn;
use regex::Regex;

use crate::chain::{ConfigError, ConfigKey, Filter, FilterConfig, FilterError, Verdict};
use crate::decode::BatchDecoder;
use crate::{EventKind, RecordRef, ValueRef};

/// Combinator for rules of the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

/// Filter lifecycle. Configuration errors park the filter in
/// `Invalid`, a terminal state that aborts pipeline start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterState {
    Uninitialized,
    Configured,
    Running,
    Stopped,
    Invalid,
}

/// One include or exclude rule: a dotted field path resolved against
/// the record body, and the pattern its value must match.
struct Rule {
    path: Vec<String>,
    regex: Regex,
}

/// Filters records by matching regular expressions against body
/// fields (logs and traces) or metric family names (metrics).
pub struct GrepFilter {
    state: FilterState,
    op: Option<LogicalOp>,
    includes: Vec<Rule>,
    excludes: Vec<Rule>,
    metric_includes: Vec<Regex>,
    metric_excludes: Vec<Regex>,
}

impl Default for GrepFilter {
    fn default() -> Self {
        GrepFilter::new()
    }
}

impl GrepFilter {
    pub fn new() -> GrepFilter {
        GrepFilter {
            state: FilterState::Uninitialized,
            op: None,
            includes: Vec::new(),
            excludes: Vec::new(),
            metric_includes: Vec::new(),
            metric_excludes: Vec::new(),
        }
    }

    /// The filter's lifecycle state.
    pub fn state(&self) -> FilterState {
        self.state
    }

    fn configure(&mut self, config: &FilterConfig) -> Result<(), ConfigError> {
        if let Some(value) = config.get("Logical_Op") {
            self.op = Some(match value {
                v if v.eq_ignore_ascii_case("and") => LogicalOp::And,
                v if v.eq_ignore_ascii_case("or") => LogicalOp::Or,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "Logical_Op".to_owned(),
                        value: value.to_owned(),
                    })
                }
            });
        }

        for rule in config.get_all("Regex") {
            self.includes.push(parse_rule(rule)?);
        }
        for rule in config.get_all("Exclude") {
            self.excludes.push(parse_rule(rule)?);
        }
        for pattern in config.get_all("Metrics.Regex") {
            self.metric_includes.push(compile_regex(pattern)?);
        }
        for pattern in config.get_all("Metrics.Exclude") {
            self.metric_excludes.push(compile_regex(pattern)?);
        }

        // one rule kind per instance, combinator or not
        if !self.includes.is_empty() && !self.excludes.is_empty() {
            return Err(ConfigError::ConflictingRules);
        }
        if !self.metric_includes.is_empty() && !self.metric_excludes.is_empty() {
            return Err(ConfigError::ConflictingRules);
        }

        Ok(())
    }

    fn keep_log_record(&self, record: &RecordRef) -> bool {
        let include_ok = combine(&self.includes, self.op, LogicalOp::And, |rule| {
            rule_matches(rule, record)
        });
        let exclude_hit = combine(&self.excludes, self.op, LogicalOp::Or, |rule| {
            rule_matches(rule, record)
        });
        include_ok && !exclude_hit
    }

    fn keep_metric_record(&self, record: &RecordRef) -> bool {
        let name = metric_family_name(record);
        let matches = |regex: &Regex| match name {
            Some(name) => regex.is_match(name),
            None => false,
        };
        let include_ok = combine(&self.metric_includes, self.op, LogicalOp::And, matches);
        let exclude_hit = combine(&self.metric_excludes, self.op, LogicalOp::Or, matches);
        include_ok && !exclude_hit
    }

    fn apply(&self, data: &[u8], kind: EventKind) -> Result<Verdict, FilterError> {
        let mut decoder = BatchDecoder::new(data);
        let mut kept: Vec<&[u8]> = Vec::new();
        let mut total = 0usize;

        while let Some(record) = decoder.next_record()? {
            total += 1;
            let keep = match kind {
                EventKind::Metrics => self.keep_metric_record(&record),
                EventKind::Logs | EventKind::Traces => self.keep_log_record(&record),
            };
            if keep {
                kept.push(record.raw);
            }
        }

        if kept.len() == total {
            return Ok(Verdict::Notouch);
        }
        let mut out = Vec::with_capacity(kept.iter().map(|span| span.len()).sum());
        for span in kept {
            out.extend_from_slice(span);
        }
        Ok(Verdict::Modified(out))
    }
}

const CONFIG_MAP: &[ConfigKey] = &[
    ConfigKey {
        name: "Regex",
        required: false,
        repeatable: true,
    },
    ConfigKey {
        name: "Exclude",
        required: false,
        repeatable: true,
    },
    ConfigKey {
        name: "Logical_Op",
        required: false,
        repeatable: false,
    },
    ConfigKey {
        name: "Metrics.Regex",
        required: false,
        repeatable: true,
    },
    ConfigKey {
        name: "Metrics.Exclude",
        required: false,
        repeatable: true,
    },
];

impl Filter for GrepFilter {
    fn name(&self) -> &'static str {
        "grep"
    }

    fn config_map(&self) -> &'static [ConfigKey] {
        CONFIG_MAP
    }

    fn init(&mut self, config: &FilterConfig) -> Result<(), ConfigError> {
        match self.configure(config) {
            Ok(()) => {
                self.state = FilterState::Configured;
                Ok(())
            }
            Err(e) => {
                self.state = FilterState::Invalid;
                Err(e)
            }
        }
    }

    fn filter(&mut self, data: &[u8], _tag: &str, kind: EventKind) -> Result<Verdict, FilterError> {
        match self.state {
            FilterState::Configured => self.state = FilterState::Running,
            FilterState::Running => {}
            _ => return Err(FilterError::NotRunning),
        }
        self.apply(data, kind)
    }

    fn exit(&mut self) {
        if self.state == FilterState::Running || self.state == FilterState::Configured {
            self.state = FilterState::Stopped;
        }
    }
}

/// Folds rule results under the filter's combinator. `default_op` is
/// the legacy combinator for this rule kind when no `Logical_Op` was
/// configured. Empty rule sets answer their vacuous value: `true` for
/// AND, `false` for OR.
fn combine<R>(
    rules: &[R],
    op: Option<LogicalOp>,
    default_op: LogicalOp,
    mut matches: impl FnMut(&R) -> bool,
) -> bool {
    let op = op.unwrap_or(default_op);
    match op {
        LogicalOp::And => rules.iter().all(|r| matches(r)),
        LogicalOp::Or => rules.iter().any(|r| matches(r)),
    }
}

/// Resolves the rule's field path against the record body and matches
/// the regex. Unresolvable paths and non-scalar leaves answer "no
/// match".
fn rule_matches(rule: &Rule, record: &RecordRef) -> bool {
    let mut current: Option<&ValueRef> = None;
    for segment in &rule.path {
        let map = match current {
            None => &record.body,
            Some(ValueRef::Map(pairs)) => pairs,
            Some(_) => return false,
        };
        current = match map.iter().find(|(k, _)| *k == segment.as_str()) {
            Some((_, v)) => Some(v),
            None => return false,
        };
    }

    match current {
        Some(ValueRef::String(s)) => rule.regex.is_match(s),
        Some(ValueRef::Uint(v)) => rule.regex.is_match(&v.to_string()),
        Some(ValueRef::Int(v)) => rule.regex.is_match(&v.to_string()),
        Some(ValueRef::Double(v)) => rule.regex.is_match(&v.to_string()),
        Some(ValueRef::Boolean(v)) => rule.regex.is_match(if *v { "true" } else { "false" }),
        // null, containers, binary and ext never match
        _ => false,
    }
}

/// The metric family name of a metrics-kind record, carried in the
/// body under `name`.
fn metric_family_name<'a>(record: &'a RecordRef) -> Option<&'a str> {
    record
        .body
        .iter()
        .find(|(k, _)| *k == "name")
        .and_then(|(_, v)| v.as_str())
}

/// Parses `<field_path> <regex>`, where the path is a dotted key
/// sequence and the regex is either bare text or `/slash-delimited/`.
fn parse_rule(text: &str) -> Result<Rule, ConfigError> {
    let text = text.trim();
    let (path_text, pattern) = match text.find(char::is_whitespace) {
        Some(at) => (&text[..at], text[at..].trim_start()),
        None => {
            return Err(ConfigError::InvalidRule {
                rule: text.to_owned(),
                reason: "expected `<field_path> <regex>`".to_owned(),
            })
        }
    };

    if path_text.is_empty() || path_text.split('.').any(|segment| segment.is_empty()) {
        return Err(ConfigError::InvalidRule {
            rule: text.to_owned(),
            reason: "empty field path".to_owned(),
        });
    }
    if pattern.is_empty() {
        return Err(ConfigError::InvalidRule {
            rule: text.to_owned(),
            reason: "empty pattern".to_owned(),
        });
    }

    Ok(Rule {
        path: path_text.split('.').map(str::to_owned).collect(),
        regex: compile_regex(pattern)?,
    })
}

/// Compiles a pattern, stripping optional `/.../` delimiters.
fn compile_regex(pattern: &str) -> Result<Regex, ConfigError> {
    let bare = if pattern.len() >= 2 && pattern.starts_with('/') && pattern.ends_with('/') {
        &pattern[1..pattern.len() - 1]
    } else {
        pattern
    };
    Regex::new(bare).map_err(|source| {
        warn!("rejecting unparsable pattern `{}`", pattern);
        ConfigError::InvalidRegex {
            pattern: pattern.to_owned(),
            source,
        }
    })
}
