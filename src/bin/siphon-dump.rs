use anyhow::{Context, Result};
use siphon::{
    BatchDecoder, Chain, EventKind, FilterConfig, GrepFilter, TagPattern,
};
use std::fs;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(
    about = "Decode a file of encoded telemetry records, optionally running them through a grep filter first. Rules follow the `<field_path> <regex>` form; the filter configuration is validated exactly as a pipeline start would."
)]
struct Opt {
    #[structopt(long = "--tag", default_value = "dump", help = "Tag attached to the batch.")]
    tag: String,

    #[structopt(
        long = "--match",
        name = "pattern",
        help = "Tag pattern the filter applies to."
    )]
    match_pattern: Option<String>,

    #[structopt(long = "--regex", help = "Include rule; repeatable.")]
    regex: Vec<String>,

    #[structopt(long = "--exclude", help = "Exclude rule; repeatable.")]
    exclude: Vec<String>,

    #[structopt(long = "--logical-op", help = "AND or OR, combining same-kind rules.")]
    logical_op: Option<String>,

    #[structopt(long = "--count", help = "Print only the number of surviving records.")]
    count: bool,

    #[structopt(name = "FILE", parse(from_os_str), help = "Encoded batch input file.")]
    file: PathBuf,
}

fn main() -> Result<()> {
    pretty_env_logger::init();
    let opt = Opt::from_args();

    let batch = fs::read(&opt.file).context("failed to read file")?;

    let batch = if opt.regex.is_empty() && opt.exclude.is_empty() && opt.logical_op.is_none() {
        batch
    } else {
        let mut config = FilterConfig::new();
        if let Some(pattern) = &opt.match_pattern {
            config.push("Match", pattern);
        }
        for rule in &opt.regex {
            config.push("Regex", rule);
        }
        for rule in &opt.exclude {
            config.push("Exclude", rule);
        }
        if let Some(op) = &opt.logical_op {
            config.push("Logical_Op", op);
        }

        if let Some(pattern) = &opt.match_pattern {
            if !TagPattern::new(pattern).matches(&opt.tag) {
                eprintln!(
                    "note: pattern `{}` does not cover tag `{}`; the filter will not run",
                    pattern, opt.tag
                );
            }
        }

        let mut chain = Chain::new();
        chain.register(EventKind::Logs, config, Box::new(GrepFilter::new()));
        chain
            .start(&[EventKind::Logs])
            .context("filter configuration rejected")?;
        chain.dispatch(&opt.tag, EventKind::Logs, batch)
    };

    if opt.count {
        println!("{}", siphon::count_records(&batch));
        return Ok(());
    }

    let mut decoder = BatchDecoder::new(&batch);
    for record in decoder.records() {
        match record {
            Err(e) => return Err(e).context("decoder error"),
            Ok(record) => println!("{:?}", record.to_record()),
        }
    }

    Ok(())
}
