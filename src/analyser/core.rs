use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::{BufRead, Write};
use crate::error::{RejectReason, Result};
use crate::ui::output::ObservationWriter;
use super::containers::Flow;
use super::metadata::{RunConfig, RunMetadata};
use super::scan;
use super::utils::RecordReader;

/// Default for the reversed-flow heuristic.
pub const SOURCE_REJECT_THRESHOLD: usize = 100;

/// Progress is logged each time this many more flows have been handled.
const PROGRESS_INTERVAL: usize = 1000;

/// Pairs plain TCP probes with ECN probes to the same destination.
///
/// Each destination sits in at most one of the two pending tables. Entries stay
/// until matched; nothing is evicted.
#[derive(Debug)]
pub struct FlowCorrelator {
    pending_tcp: HashMap<String, Flow>,
    pending_ecn: HashMap<String, Flow>,
    source_counts: HashMap<String, usize>,
    source_reject_threshold: usize,
    handled: usize,
}

impl Default for FlowCorrelator {
    fn default() -> Self {
        Self::new(SOURCE_REJECT_THRESHOLD)
    }
}

impl FlowCorrelator {
    pub fn new(source_reject_threshold: usize) -> Self {
        Self {
            pending_tcp: HashMap::new(),
            pending_ecn: HashMap::new(),
            source_counts: HashMap::new(),
            source_reject_threshold,
            handled: 0,
        }
    }

    /// Files a flow, returning the `(tcp, ecn)` pair when it completes one.
    pub fn observe(&mut self, flow: Flow) -> std::result::Result<Option<(Flow, Flow)>, RejectReason> {
        *self.source_counts.entry(flow.src_addr.to_string()).or_insert(0) += 1;

        let key = flow.key();

        // The count is looked up by destination: an address that keeps showing
        // up as a source should not be probed as a destination.
        let dst_as_source = self.source_counts.get(&key).copied().unwrap_or(0);
        if self.handled > self.source_reject_threshold && dst_as_source > self.source_reject_threshold / 2 {
            return Err(RejectReason::ReversedFlow);
        }

        self.handled += 1;

        if flow.ecn_attempted {
            match self.pending_tcp.remove(&key) {
                Some(tcp_flow) => {
                    self.pending_ecn.remove(&key);
                    Ok(Some((tcp_flow, flow)))
                }
                None => {
                    self.pending_ecn.insert(key, flow);
                    Ok(None)
                }
            }
        } else {
            match self.pending_ecn.remove(&key) {
                Some(ecn_flow) => {
                    self.pending_tcp.remove(&key);
                    Ok(Some((flow, ecn_flow)))
                }
                None => {
                    self.pending_tcp.insert(key, flow);
                    Ok(None)
                }
            }
        }
    }

    pub fn handled(&self) -> usize {
        self.handled
    }

    pub fn pending_tcp(&self) -> usize {
        self.pending_tcp.len()
    }

    pub fn pending_ecn(&self) -> usize {
        self.pending_ecn.len()
    }

    /// Consumes the correlator, returning unmatched flows sorted by key, TCP table first.
    pub fn into_pending(self) -> (Vec<(String, Flow)>, Vec<(String, Flow)>) {
        let sorted = |table: HashMap<String, Flow>| {
            let mut entries: Vec<(String, Flow)> = table.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            entries
        };
        (sorted(self.pending_tcp), sorted(self.pending_ecn))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    pub handled: usize,
    pub ignored: usize,
    pub matched_pairs: usize,
    pub observations: usize,
    pub pending_tcp: usize,
    pub pending_ecn: usize,
    pub first_start: Option<DateTime<Utc>>,
    pub last_start: Option<DateTime<Utc>>,
}

impl RunStats {
    fn saw_start(&mut self, t: DateTime<Utc>) {
        if self.first_start.map_or(true, |first| t < first) {
            self.first_start = Some(t);
        }
        if self.last_start.map_or(true, |last| t > last) {
            self.last_start = Some(t);
        }
    }
}

#[derive(Clone, Debug)]
pub struct AnalyseOptions {
    pub require_syn: bool,
    pub source_reject_threshold: usize,
}

impl Default for AnalyseOptions {
    fn default() -> Self {
        Self { require_syn: true, source_reject_threshold: SOURCE_REJECT_THRESHOLD }
    }
}

/// Runs decoded flow records through build, correlate, classify and emit.
///
/// Writes observations followed by one metadata record to `out`. Returns the
/// run statistics and the correlator, which still holds any unmatched flows.
pub fn analyse<R: BufRead, W: Write>(
    input: R,
    metadata: &RunMetadata,
    options: &AnalyseOptions,
    out: W,
) -> Result<(RunStats, FlowCorrelator)> {
    log::info!("Starting analysis.");

    metadata.check_file_type()?;
    let config = RunConfig::from_metadata(metadata);
    log::info!(
        "source override {:?}, source prepend {:?}, destination port {}",
        config.source_override,
        config.source_prepend,
        config.required_dst_port
    );

    let mut correlator = FlowCorrelator::new(options.source_reject_threshold);
    let mut writer = ObservationWriter::new(out);
    let mut stats = RunStats::default();

    for record in RecordReader::new(input) {
        let fields = record?;

        let flow = match Flow::from_fields(&fields, options.require_syn, config.required_dst_port) {
            Ok(flow) => flow,
            Err(reason) => {
                log::debug!("Ignoring flow: {reason}");
                stats.ignored += 1;
                continue;
            }
        };
        stats.saw_start(flow.start_time);

        match correlator.observe(flow) {
            Ok(Some((tcp_flow, ecn_flow))) => {
                let observations = scan::classify(&tcp_flow, &ecn_flow, &config);
                writer.write_observations(&observations)?;
                stats.matched_pairs += 1;
                stats.observations += observations.len();
            }
            Ok(None) => {}
            Err(reason) => {
                log::debug!("Ignoring flow: {reason}");
                stats.ignored += 1;
                continue;
            }
        }

        if correlator.handled() % PROGRESS_INTERVAL == 0 {
            log::info!(
                "ignored {} handled {} pending TCP {} pending ECN {}",
                stats.ignored,
                correlator.handled(),
                correlator.pending_tcp(),
                correlator.pending_ecn()
            );
        }
    }

    stats.handled = correlator.handled();
    stats.pending_tcp = correlator.pending_tcp();
    stats.pending_ecn = correlator.pending_ecn();
    log::info!("{} pending TCP flows, {} pending ECN flows", stats.pending_tcp, stats.pending_ecn);

    writer.finish(metadata, &stats)?;

    Ok((stats, correlator))
}
