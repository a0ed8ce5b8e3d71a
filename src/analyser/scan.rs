//! Derives condition verdicts from a matched pair of flows.
use super::containers::{Condition, Flow, Observation};
use super::metadata::RunConfig;

/// Connectivity verdict from whether each probe completed its handshake.
pub fn scan_for_connectivity(tcp_established: bool, ecn_established: bool) -> Condition {
    match (tcp_established, ecn_established) {
        (true, true) => Condition::ConnectivityWorks,
        (true, false) => Condition::ConnectivityBroken,
        (false, true) => Condition::ConnectivityTransient,
        (false, false) => Condition::ConnectivityOffline,
    }
}

/// Negotiation verdict for the ECN probe. Negotiation wins over reflection.
pub fn scan_for_negotiation(ecn_flow: &Flow) -> Condition {
    if ecn_flow.ecn_negotiated {
        Condition::NegotiationSucceeded
    } else if ecn_flow.ecn_reflected {
        Condition::NegotiationReflected
    } else {
        Condition::NegotiationFailed
    }
}

pub fn scan_for_marks(ecn_flow: &Flow) -> [Condition; 3] {
    [
        if ecn_flow.ect0_seen { Condition::Ect0Seen } else { Condition::Ect0NotSeen },
        if ecn_flow.ect1_seen { Condition::Ect1Seen } else { Condition::Ect1NotSeen },
        if ecn_flow.ce_seen { Condition::CeSeen } else { Condition::CeNotSeen },
    ]
}

/// Builds the path string `[prepend] [source] * destination`.
///
/// The natural source is only asked for when no override is configured, and
/// an empty source drops out of the path.
pub fn make_path<F: FnOnce() -> String>(config: &RunConfig, natural_source: F, destination: &str) -> String {
    let source = match &config.source_override {
        Some(source) => source.clone(),
        None => natural_source(),
    };

    let mut elements: Vec<&str> = Vec::with_capacity(4);
    if let Some(prepend) = config.source_prepend.as_deref() {
        elements.push(prepend);
    }
    if !source.is_empty() {
        elements.push(&source);
    }
    elements.push("*");
    elements.push(destination);

    elements.join(" ")
}

/// Classifies a matched TCP/ECN pair into its five observations.
///
/// All of them sit on the ECN flow's path at the ECN flow's start time.
pub fn classify(tcp_flow: &Flow, ecn_flow: &Flow, config: &RunConfig) -> [Observation; 5] {
    let path = make_path(config, || ecn_flow.src_addr.to_string(), &ecn_flow.dst_addr.to_string());
    let [ect0, ect1, ce] = scan_for_marks(ecn_flow);
    let conditions = [
        scan_for_connectivity(tcp_flow.did_establish, ecn_flow.did_establish),
        scan_for_negotiation(ecn_flow),
        ect0,
        ect1,
        ce,
    ];

    conditions.map(|condition| Observation {
        time_start: ecn_flow.start_time,
        time_end: ecn_flow.start_time,
        path: path.clone(),
        condition,
        value: None,
    })
}
