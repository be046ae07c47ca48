//! Chain semantics exercised through the public plugin surface: a
//! custom rewriting filter ahead of the stock grep filter.

use siphon::{
    count_records, decode_batch, BatchDecoder, BatchEncoder, Chain, ConfigError, ConfigKey,
    EventKind, Field, Filter, FilterConfig, FilterError, GrepFilter, Timestamp, TimestampMode,
    Value, Verdict,
};

/// A filter that uppercases the `log` body field, re-encoding every
/// record. Later filters must observe the rewritten batch.
struct Shout;

impl Filter for Shout {
    fn name(&self) -> &'static str {
        "shout"
    }

    fn config_map(&self) -> &'static [ConfigKey] {
        &[]
    }

    fn init(&mut self, _config: &FilterConfig) -> Result<(), ConfigError> {
        Ok(())
    }

    fn filter(&mut self, data: &[u8], _tag: &str, _kind: EventKind) -> Result<Verdict, FilterError> {
        let mut enc = BatchEncoder::new(TimestampMode::FluentV2);
        let mut decoder = BatchDecoder::new(data);
        let mut touched = false;

        while let Some(record) = decoder.next_record()? {
            enc.begin_record()?;
            enc.append_timestamp(record.timestamp)?;
            for (key, value) in &record.body {
                match value.as_str() {
                    Some(text) if *key == "log" => {
                        touched = true;
                        enc.append_string(Field::Body, key, &text.to_uppercase())?;
                    }
                    _ => enc.append_pair(Field::Body, key, &value.to_value())?,
                }
            }
            enc.commit_record()?;
        }

        if touched {
            Ok(Verdict::Modified(enc.take_buffer()))
        } else {
            Ok(Verdict::Notouch)
        }
    }
}

fn batch_of_logs(lines: &[&str]) -> Vec<u8> {
    let mut enc = BatchEncoder::new(TimestampMode::FluentV2);
    for (i, line) in lines.iter().enumerate() {
        enc.begin_record().unwrap();
        enc.append_timestamp(Timestamp::new(i as u32, 0)).unwrap();
        enc.append_string(Field::Body, "log", line).unwrap();
        enc.commit_record().unwrap();
    }
    enc.take_buffer()
}

#[test]
fn later_filters_see_the_rewritten_batch() {
    let mut chain = Chain::new();
    chain.register(EventKind::Logs, FilterConfig::new(), Box::new(Shout));
    chain.register(
        EventKind::Logs,
        // matches only after the rewrite uppercased the text
        FilterConfig::from_pairs(vec![("Regex", "log ^KEEP$")]),
        Box::new(GrepFilter::new()),
    );
    chain.start(&[EventKind::Logs]).unwrap();

    let out = chain.dispatch("t", EventKind::Logs, batch_of_logs(&["keep", "drop"]));
    let records = decode_batch(&out).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].body,
        vec![("log".to_owned(), Value::from("KEEP"))]
    );
}

#[test]
fn per_tag_order_is_preserved_across_filters() {
    let mut chain = Chain::new();
    chain.register(EventKind::Logs, FilterConfig::new(), Box::new(Shout));
    chain.register(
        EventKind::Logs,
        FilterConfig::from_pairs(vec![("Exclude", "log DROP")]),
        Box::new(GrepFilter::new()),
    );
    chain.start(&[EventKind::Logs]).unwrap();

    let lines = ["a", "drop-1", "b", "c", "drop-2", "d"];
    let out = chain.dispatch("t", EventKind::Logs, batch_of_logs(&lines));
    let records = decode_batch(&out).unwrap();

    let got: Vec<String> = records
        .iter()
        .map(|r| r.body[0].1.as_str().unwrap().to_owned())
        .collect();
    // the surviving sequence is a subsequence of the input in order
    assert_eq!(got, vec!["A", "B", "C", "D"]);

    let mut last = None;
    for record in &records {
        assert!(last.map_or(true, |prev| prev < record.timestamp));
        last = Some(record.timestamp);
    }
}

#[test]
fn counters_track_in_out_and_dropped() {
    let mut chain = Chain::new();
    chain.register(
        EventKind::Logs,
        FilterConfig::from_pairs(vec![("Exclude", "log drop")]),
        Box::new(GrepFilter::new()),
    );
    chain.start(&[EventKind::Logs]).unwrap();

    chain.dispatch("t", EventKind::Logs, batch_of_logs(&["a", "drop", "b"]));
    chain.dispatch("t", EventKind::Logs, batch_of_logs(&["drop"]));

    let stats = chain.stats();
    assert_eq!(stats.records_in, 4);
    assert_eq!(stats.records_out, 2);
    assert_eq!(stats.records_dropped, 2);
}

#[test]
fn malformed_batch_is_dropped_and_the_chain_survives() {
    let mut chain = Chain::new();
    chain.register(
        EventKind::Logs,
        FilterConfig::from_pairs(vec![("Regex", "log .*")]),
        Box::new(GrepFilter::new()),
    );
    chain.start(&[EventKind::Logs]).unwrap();

    // garbage with no resync candidate
    let out = chain.dispatch("t", EventKind::Logs, vec![0xc1, 0x00, 0x00]);
    assert!(out.is_empty());

    // the next, intact batch flows through the same filter
    let out = chain.dispatch("t", EventKind::Logs, batch_of_logs(&["fine"]));
    assert_eq!(count_records(&out), 1);
}

#[test]
fn filters_only_see_their_event_kind() {
    let mut chain = Chain::new();
    chain.register(
        EventKind::Traces,
        FilterConfig::from_pairs(vec![("Exclude", "log .*")]),
        Box::new(GrepFilter::new()),
    );
    chain.start(&[EventKind::Logs, EventKind::Traces]).unwrap();

    let batch = batch_of_logs(&["x", "y"]);
    // logs pass the traces-only filter untouched
    assert_eq!(
        count_records(&chain.dispatch("t", EventKind::Logs, batch.clone())),
        2
    );
    // traces are filtered
    assert_eq!(
        count_records(&chain.dispatch("t", EventKind::Traces, batch)),
        0
    );
}
