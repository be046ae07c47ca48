//! End-to-end grep filter scenarios, driven through the chain the way
//! a pipeline host would.

use siphon::{
    count_records, BatchEncoder, Chain, ConfigError, EventKind, Field, FilterConfig, FilterState,
    GrepFilter, Timestamp, TimestampMode,
};

fn encode_records<'a>(bodies: impl Iterator<Item = Vec<(&'a str, String)>>) -> Vec<u8> {
    let mut enc = BatchEncoder::new(TimestampMode::FluentV2);
    for (i, body) in bodies.enumerate() {
        enc.begin_record().unwrap();
        enc.append_timestamp(Timestamp::new(i as u32, 0)).unwrap();
        for (key, value) in &body {
            enc.append_string(Field::Body, key, value).unwrap();
        }
        enc.commit_record().unwrap();
    }
    enc.take_buffer()
}

fn started_chain(pairs: Vec<(&str, &str)>) -> Result<Chain, ConfigError> {
    let mut chain = Chain::new();
    chain.register(
        EventKind::Logs,
        FilterConfig::from_pairs(pairs),
        Box::new(GrepFilter::new()),
    );
    chain.start(&[EventKind::Logs])?;
    Ok(chain)
}

fn dispatch_count(chain: &mut Chain, batch: Vec<u8>) -> usize {
    count_records(&chain.dispatch("test", EventKind::Logs, batch))
}

/// The classic squares corpus: `[i, {"val": str(i*i), "END_KEY":
/// "JSON_END"}]` for i in 0..256.
fn squares_batch() -> Vec<u8> {
    encode_records((0..256u64).map(|i| {
        vec![
            ("val", (i * i).to_string()),
            ("END_KEY", "JSON_END".to_owned()),
        ]
    }))
}

#[test]
fn include_with_single_regex() {
    let mut chain = started_chain(vec![("match", "*"), ("Regex", "val 1")]).unwrap();

    let expected = (0..256u64)
        .filter(|i| (i * i).to_string().contains('1'))
        .count();
    assert_eq!(dispatch_count(&mut chain, squares_batch()), expected);
}

#[test]
fn exclude_with_single_regex() {
    let mut chain = started_chain(vec![("match", "*"), ("Exclude", "val 1")]).unwrap();

    let expected = (0..256u64)
        .filter(|i| !(i * i).to_string().contains('1'))
        .count();
    assert_eq!(dispatch_count(&mut chain, squares_batch()), expected);
}

/// 512 records alternating between a deprecated-option line and a
/// plain line.
fn alternating_batch() -> Vec<u8> {
    encode_records((0..512u64).map(|i| {
        let log = if i % 2 == 0 {
            "Using deprecated option"
        } else {
            "Using option"
        };
        vec![("val", (i * i).to_string()), ("log", log.to_owned())]
    }))
}

#[test]
fn multiple_excludes_combine_as_or() {
    let mut chain = started_chain(vec![
        ("match", "*"),
        ("Exclude", "log deprecated"),
        ("Exclude", "log hoge"),
    ])
    .unwrap();

    assert_eq!(dispatch_count(&mut chain, alternating_batch()), 256);
}

#[test]
fn multiple_regexes_combine_as_and() {
    let mut chain = started_chain(vec![
        ("match", "*"),
        ("Regex", "log deprecated"),
        ("Regex", "log option"),
    ])
    .unwrap();

    // only the deprecated lines match both rules
    assert_eq!(dispatch_count(&mut chain, alternating_batch()), 256);
}

#[test]
fn logical_op_or_widens_regexes() {
    let mut chain = started_chain(vec![
        ("match", "*"),
        ("Regex", "log deprecated"),
        ("Regex", "log option"),
        ("Logical_Op", "OR"),
    ])
    .unwrap();

    // every record matches at least one rule
    assert_eq!(dispatch_count(&mut chain, alternating_batch()), 512);
}

#[test]
fn contradictory_configuration_refuses_start() {
    let result = started_chain(vec![
        ("match", "*"),
        ("Regex", "val 1"),
        ("Exclude", "val2 3"),
        ("Logical_Op", "AND"),
    ]);
    assert!(matches!(result, Err(ConfigError::ConflictingRules)));

    // the filter itself parks in its terminal state
    let mut grep = GrepFilter::new();
    let config = FilterConfig::from_pairs(vec![
        ("Regex", "val 1"),
        ("Exclude", "val2 3"),
        ("Logical_Op", "AND"),
    ]);
    assert!(siphon::Filter::init(&mut grep, &config).is_err());
    assert_eq!(grep.state(), FilterState::Invalid);
}

#[test]
fn unknown_key_refuses_start() {
    let result = started_chain(vec![("match", "*"), ("UNKNOWN_PROPERTY", "aaaaaa")]);
    assert!(matches!(result, Err(ConfigError::UnknownKey { .. })));
}

#[test]
fn slash_delimited_exclude() {
    let mut chain = started_chain(vec![
        ("match", "*"),
        ("Exclude", "log /Using deprecated option/"),
    ])
    .unwrap();

    // 256 records without the field, 256 carrying the deprecated line
    let batch = encode_records((0..512u64).map(|i| {
        if i < 256 {
            vec![("END_KEY", "JSON_END".to_owned())]
        } else {
            vec![("log", "Using deprecated option".to_owned())]
        }
    }));

    assert_eq!(dispatch_count(&mut chain, batch), 256);
}

#[test]
fn kept_records_stay_in_source_order() {
    let mut chain = started_chain(vec![("match", "*"), ("Regex", "val 1")]).unwrap();

    let out = chain.dispatch("test", EventKind::Logs, squares_batch());
    let records = siphon::decode_batch(&out).unwrap();

    let expected: Vec<String> = (0..256u64)
        .map(|i| (i * i).to_string())
        .filter(|v| v.contains('1'))
        .collect();
    let got: Vec<String> = records
        .iter()
        .map(|r| {
            r.body
                .iter()
                .find(|(k, _)| k == "val")
                .and_then(|(_, v)| v.as_str())
                .unwrap()
                .to_owned()
        })
        .collect();
    assert_eq!(got, expected);

    // timestamps keep increasing, i.e. a subsequence of the input
    let mut last = None;
    for record in &records {
        assert!(last.map_or(true, |prev| prev < record.timestamp));
        last = Some(record.timestamp);
    }
}

#[test]
fn non_matching_tag_skips_the_filter() {
    let mut chain = Chain::new();
    chain.register(
        EventKind::Logs,
        FilterConfig::from_pairs(vec![("Match", "kube.*"), ("Exclude", "log .*")]),
        Box::new(GrepFilter::new()),
    );
    chain.start(&[EventKind::Logs]).unwrap();

    let batch = encode_records((0..4u64).map(|_| vec![("log", "anything".to_owned())]));

    // tag not covered: the exclude-everything filter never runs
    let out = chain.dispatch("db.query", EventKind::Logs, batch.clone());
    assert_eq!(count_records(&out), 4);

    // covered tag: everything is excluded
    let out = chain.dispatch("kube.api", EventKind::Logs, batch);
    assert_eq!(count_records(&out), 0);
}

#[test]
fn metrics_batches_filter_by_family_name() {
    let mut chain = Chain::new();
    chain.register(
        EventKind::Metrics,
        FilterConfig::from_pairs(vec![("Match", "*"), ("Metrics.Exclude", "_debug_")]),
        Box::new(GrepFilter::new()),
    );
    chain.start(&[EventKind::Metrics]).unwrap();

    let mut enc = BatchEncoder::new(TimestampMode::FluentV2);
    for name in [
        "http_requests_total",
        "runtime_debug_allocs",
        "process_uptime_seconds",
    ]
    .iter()
    {
        enc.begin_record().unwrap();
        enc.append_timestamp(Timestamp::new(0, 0)).unwrap();
        enc.append_string(Field::Body, "name", name).unwrap();
        enc.append_double(Field::Body, "value", 1.0).unwrap();
        enc.commit_record().unwrap();
    }

    let out = chain.dispatch("scrape", EventKind::Metrics, enc.take_buffer());
    let records = siphon::decode_batch(&out).unwrap();
    let names: Vec<&str> = records
        .iter()
        .map(|r| {
            r.body
                .iter()
                .find(|(k, _)| k == "name")
                .and_then(|(_, v)| v.as_str())
                .unwrap()
        })
        .collect();
    assert_eq!(names, vec!["http_requests_total", "process_uptime_seconds"]);
}
