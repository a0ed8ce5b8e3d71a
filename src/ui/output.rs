use crate::analyser::containers::{format_time, Flow, Observation};
use crate::analyser::core::RunStats;
use crate::analyser::metadata::RunMetadata;
use crate::error::Result;
use ansi_term::Colour;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::io::Write;

/// Identity tag written into every output metadata record.
pub const ANALYZER_ID: &str = concat!("ecnsniff/", env!("CARGO_PKG_VERSION"));

/// Writes observations as JSON lines and remembers which conditions it wrote.
pub struct ObservationWriter<W: Write> {
    out: W,
    conditions: BTreeSet<&'static str>,
}

impl<W: Write> ObservationWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, conditions: BTreeSet::new() }
    }

    pub fn write_observations(&mut self, observations: &[Observation]) -> Result<()> {
        for obs in observations {
            serde_json::to_writer(&mut self.out, obs)?;
            self.out.write_all(b"\n")?;
            self.conditions.insert(obs.condition.name());
        }
        Ok(())
    }

    /// Writes the closing metadata record and flushes.
    ///
    /// Time bounds come from the metadata; missing ones fall back to the
    /// flow start times seen during the run.
    pub fn finish(mut self, metadata: &RunMetadata, stats: &RunStats) -> Result<()> {
        let mut md: Map<String, Value> = metadata.aux().map(|(k, v)| (k.clone(), v.clone())).collect();

        md.insert("_conditions".to_string(), self.conditions.iter().map(|c| Value::from(*c)).collect());
        md.insert("_owner".to_string(), Value::from(metadata.owner()));
        if let Some(t) = metadata.time_start().or(stats.first_start) {
            md.insert("_time_start".to_string(), Value::from(format_time(&t)));
        }
        if let Some(t) = metadata.time_end().or(stats.last_start) {
            md.insert("_time_end".to_string(), Value::from(format_time(&t)));
        }
        md.insert("_analyzer".to_string(), Value::from(ANALYZER_ID));

        serde_json::to_writer(&mut self.out, &md)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }
}

#[derive(Serialize)]
struct PendingRecord<'a> {
    table: &'static str,
    key: &'a str,
    flow: &'a Flow,
}

/// Dumps flows that never found their counterpart, one JSON object per line.
pub fn write_pending<W: Write>(mut out: W, tcp: &[(String, Flow)], ecn: &[(String, Flow)]) -> Result<()> {
    let tables = tcp.iter().map(|e| ("tcp", e)).chain(ecn.iter().map(|e| ("ecn", e)));
    for (table, (key, flow)) in tables {
        serde_json::to_writer(&mut out, &PendingRecord { table, key, flow })?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

pub fn print_results(stats: &RunStats) {
    eprintln!("\n\u{250F}\u{2501}\u{2501}\u{2501}\u{2501} Results");
    eprintln!("\u{2503}");
    eprintln!("\u{2503} Handled flows    : {}", Colour::Fixed(226).paint(stats.handled.to_string()));
    eprintln!("\u{2503} Ignored flows    : {}", Colour::Fixed(226).paint(stats.ignored.to_string()));
    eprintln!("\u{2503} Matched pairs    : {}", Colour::Green.paint(stats.matched_pairs.to_string()));
    eprintln!("\u{2503} Observations     : {}", Colour::Green.paint(stats.observations.to_string()));
    eprintln!("\u{2503} Pending TCP      : {}", Colour::Red.paint(stats.pending_tcp.to_string()));
    eprintln!("\u{2503} Pending ECN      : {}", Colour::Red.paint(stats.pending_ecn.to_string()));
    eprintln!("\u{2503} ");
}
