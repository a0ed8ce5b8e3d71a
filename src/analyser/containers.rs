use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::{SerializeSeq, Serializer};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::ops::BitOr;
use crate::error::RejectReason;

pub const INITIAL_TCP_FLAGS: &str = "initialTCPFlags";
pub const LAST_SYN_TCP_FLAGS: &str = "lastSynTcpFlags";
pub const REVERSE_LAST_SYN_TCP_FLAGS: &str = "reverseLastSynTcpFlags";
pub const REVERSE_QOF_TCP_CHARACTERISTICS: &str = "reverseQofTcpCharacteristics";
pub const FLOW_START_MILLISECONDS: &str = "flowStartMilliseconds";
pub const SOURCE_TRANSPORT_PORT: &str = "sourceTransportPort";
pub const DESTINATION_TRANSPORT_PORT: &str = "destinationTransportPort";
pub const SOURCE_IPV4_ADDRESS: &str = "sourceIPv4Address";
pub const SOURCE_IPV6_ADDRESS: &str = "sourceIPv6Address";
pub const DESTINATION_IPV4_ADDRESS: &str = "destinationIPv4Address";
pub const DESTINATION_IPV6_ADDRESS: &str = "destinationIPv6Address";

/// TCP control flags as carried in the QoF flag fields.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);
    pub const URG: TcpFlags = TcpFlags(0x20);
    pub const ECE: TcpFlags = TcpFlags(0x40);
    pub const CWR: TcpFlags = TcpFlags(0x80);

    /// Mask covering the bits that matter for ECN setup.
    pub const ECN_SETUP: TcpFlags = TcpFlags(0x02 | 0x10 | 0x40 | 0x80);
    /// Mask covering the bits that open or tear down a connection.
    pub const HANDSHAKE: TcpFlags = TcpFlags(0x02 | 0x10 | 0x01 | 0x04);

    pub fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when the bits selected by `mask` are exactly `expected`.
    pub fn masked_eq(self, mask: TcpFlags, expected: TcpFlags) -> bool {
        self.0 & mask.0 == expected.0
    }
}

impl BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 | rhs.0)
    }
}

/// Reverse-direction QoF TCP characteristics bitmask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct QofCharacteristics(pub u32);

impl QofCharacteristics {
    pub const ECT0: QofCharacteristics = QofCharacteristics(0x01);
    pub const ECT1: QofCharacteristics = QofCharacteristics(0x02);
    pub const CE: QofCharacteristics = QofCharacteristics(0x04);
    pub const TS_OPT: QofCharacteristics = QofCharacteristics(0x10);
    pub const SACK_OPT: QofCharacteristics = QofCharacteristics(0x20);
    pub const WS_OPT: QofCharacteristics = QofCharacteristics(0x40);
    pub const SYN_ECT0: QofCharacteristics = QofCharacteristics(0x0100);
    pub const SYN_ECT1: QofCharacteristics = QofCharacteristics(0x0200);
    pub const SYN_CE: QofCharacteristics = QofCharacteristics(0x0400);

    pub fn contains(self, other: QofCharacteristics) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for QofCharacteristics {
    type Output = QofCharacteristics;

    fn bitor(self, rhs: QofCharacteristics) -> QofCharacteristics {
        QofCharacteristics(self.0 | rhs.0)
    }
}

/// A typed value handed over by the flow-record decoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldValue {
    Unsigned8(u8),
    Unsigned16(u16),
    Unsigned32(u32),
    DateTime(DateTime<Utc>),
    Address(IpAddr),
}

pub type FieldMap = HashMap<String, FieldValue>;

fn get_u8(fields: &FieldMap, name: &'static str) -> Result<u8, RejectReason> {
    match fields.get(name) {
        Some(FieldValue::Unsigned8(v)) => Ok(*v),
        _ => Err(RejectReason::MissingField(name)),
    }
}

fn get_u16(fields: &FieldMap, name: &'static str) -> Result<u16, RejectReason> {
    match fields.get(name) {
        Some(FieldValue::Unsigned16(v)) => Ok(*v),
        _ => Err(RejectReason::MissingField(name)),
    }
}

fn get_u32(fields: &FieldMap, name: &'static str) -> Result<u32, RejectReason> {
    match fields.get(name) {
        Some(FieldValue::Unsigned32(v)) => Ok(*v),
        _ => Err(RejectReason::MissingField(name)),
    }
}

fn get_time(fields: &FieldMap, name: &'static str) -> Result<DateTime<Utc>, RejectReason> {
    match fields.get(name) {
        Some(FieldValue::DateTime(t)) => Ok(*t),
        _ => Err(RejectReason::MissingField(name)),
    }
}

/// Picks the IPv4 field when present, otherwise the IPv6 one.
fn get_addr(fields: &FieldMap, v4: &'static str, v6: &'static str) -> Result<IpAddr, RejectReason> {
    match (fields.get(v4), fields.get(v6)) {
        (Some(FieldValue::Address(a)), _) => Ok(*a),
        (_, Some(FieldValue::Address(a))) => Ok(*a),
        _ => Err(RejectReason::MissingField(v4)),
    }
}

/// One TCP flow relevant to ECN probing. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Flow {
    pub start_time: DateTime<Utc>,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub fwd_last_syn: TcpFlags,
    pub rev_last_syn: TcpFlags,
    pub rev_characteristics: QofCharacteristics,
    pub ecn_attempted: bool,
    pub ecn_negotiated: bool,
    pub ecn_reflected: bool,
    pub ect0_seen: bool,
    pub ect1_seen: bool,
    pub ce_seen: bool,
    pub did_establish: bool,
}

impl Flow {
    /// Builds a flow from a decoded field map.
    ///
    /// Flows whose start was not seen are dropped when `require_syn` is set,
    /// and flows to any other port are dropped when `require_dst_port` is non-zero.
    pub fn from_fields(fields: &FieldMap, require_syn: bool, require_dst_port: u16) -> Result<Self, RejectReason> {
        let initial_flags = TcpFlags(get_u8(fields, INITIAL_TCP_FLAGS)?);
        if require_syn && !initial_flags.contains(TcpFlags::SYN) {
            return Err(RejectReason::NoSyn);
        }

        let dst_port = get_u16(fields, DESTINATION_TRANSPORT_PORT)?;
        if require_dst_port > 0 && dst_port != require_dst_port {
            return Err(RejectReason::WrongPort(dst_port));
        }

        let start_time = get_time(fields, FLOW_START_MILLISECONDS)?;
        let src_addr = get_addr(fields, SOURCE_IPV4_ADDRESS, SOURCE_IPV6_ADDRESS)?;
        let dst_addr = get_addr(fields, DESTINATION_IPV4_ADDRESS, DESTINATION_IPV6_ADDRESS)?;
        let src_port = get_u16(fields, SOURCE_TRANSPORT_PORT)?;
        let fwd_last_syn = TcpFlags(get_u8(fields, LAST_SYN_TCP_FLAGS)?);
        let rev_last_syn = TcpFlags(get_u8(fields, REVERSE_LAST_SYN_TCP_FLAGS)?);
        let rev_characteristics = QofCharacteristics(get_u32(fields, REVERSE_QOF_TCP_CHARACTERISTICS)?);

        Ok(Self::new(start_time, src_addr, dst_addr, src_port, dst_port, fwd_last_syn, rev_last_syn, rev_characteristics))
    }

    /// Creates a flow from raw fields, deriving the ECN and handshake booleans.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        start_time: DateTime<Utc>,
        src_addr: IpAddr,
        dst_addr: IpAddr,
        src_port: u16,
        dst_port: u16,
        fwd_last_syn: TcpFlags,
        rev_last_syn: TcpFlags,
        rev_characteristics: QofCharacteristics,
    ) -> Self {
        type F = TcpFlags;

        let ecn_attempted = fwd_last_syn.masked_eq(F::ECN_SETUP, F::SYN | F::ECE | F::CWR);
        let ecn_negotiated = rev_last_syn.masked_eq(F::ECN_SETUP, F::SYN | F::ACK | F::ECE);
        let ecn_reflected = rev_last_syn.masked_eq(F::ECN_SETUP, F::SYN | F::ACK | F::ECE | F::CWR);
        let did_establish = fwd_last_syn.masked_eq(F::HANDSHAKE, F::SYN)
            && rev_last_syn.masked_eq(F::HANDSHAKE, F::SYN | F::ACK);

        Self {
            start_time,
            src_addr,
            dst_addr,
            src_port,
            dst_port,
            fwd_last_syn,
            rev_last_syn,
            rev_characteristics,
            ecn_attempted,
            ecn_negotiated,
            ecn_reflected,
            ect0_seen: rev_characteristics.contains(QofCharacteristics::ECT0),
            ect1_seen: rev_characteristics.contains(QofCharacteristics::ECT1),
            ce_seen: rev_characteristics.contains(QofCharacteristics::CE),
            did_establish,
        }
    }

    /// Key the correlator pairs flows on.
    pub fn key(&self) -> String {
        self.dst_addr.to_string()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Condition {
    ConnectivityWorks,
    ConnectivityBroken,
    ConnectivityTransient,
    ConnectivityOffline,
    NegotiationSucceeded,
    NegotiationReflected,
    NegotiationFailed,
    Ect0Seen,
    Ect0NotSeen,
    Ect1Seen,
    Ect1NotSeen,
    CeSeen,
    CeNotSeen,
}

impl Condition {
    pub fn name(&self) -> &'static str {
        match self {
            Condition::ConnectivityWorks => "ecn.connectivity.works",
            Condition::ConnectivityBroken => "ecn.connectivity.broken",
            Condition::ConnectivityTransient => "ecn.connectivity.transient",
            Condition::ConnectivityOffline => "ecn.connectivity.offline",
            Condition::NegotiationSucceeded => "ecn.negotiation.succeeded",
            Condition::NegotiationReflected => "ecn.negotiation.reflected",
            Condition::NegotiationFailed => "ecn.negotiation.failed",
            Condition::Ect0Seen => "ecn.ipmark.ect0.seen",
            Condition::Ect0NotSeen => "ecn.ipmark.ect0.not_seen",
            Condition::Ect1Seen => "ecn.ipmark.ect1.seen",
            Condition::Ect1NotSeen => "ecn.ipmark.ect1.not_seen",
            Condition::CeSeen => "ecn.ipmark.ce.seen",
            Condition::CeNotSeen => "ecn.ipmark.ce.not_seen",
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Formats a timestamp the way observation and metadata records carry it.
pub fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// The atomic output record: a condition seen on a path over a time range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Observation {
    pub time_start: DateTime<Utc>,
    pub time_end: DateTime<Utc>,
    pub path: String,
    pub condition: Condition,
    pub value: Option<String>,
}

// Wire form is a positional array: [set_id, start, end, path, condition, value?].
impl Serialize for Observation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = if self.value.is_some() { 6 } else { 5 };
        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element("0")?;
        seq.serialize_element(&format_time(&self.time_start))?;
        seq.serialize_element(&format_time(&self.time_end))?;
        seq.serialize_element(&self.path)?;
        seq.serialize_element(self.condition.name())?;
        if let Some(value) = &self.value {
            seq.serialize_element(value)?;
        }
        seq.end()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn fields(src: &str, dst: &str, fwd: u8, rev: u8, chars: u32, start_ms: i64) -> FieldMap {
        let mut map = FieldMap::new();
        map.insert(INITIAL_TCP_FLAGS.to_string(), FieldValue::Unsigned8(fwd));
        map.insert(LAST_SYN_TCP_FLAGS.to_string(), FieldValue::Unsigned8(fwd));
        map.insert(REVERSE_LAST_SYN_TCP_FLAGS.to_string(), FieldValue::Unsigned8(rev));
        map.insert(REVERSE_QOF_TCP_CHARACTERISTICS.to_string(), FieldValue::Unsigned32(chars));
        map.insert(
            FLOW_START_MILLISECONDS.to_string(),
            FieldValue::DateTime(Utc.timestamp_millis_opt(start_ms).unwrap()),
        );
        map.insert(SOURCE_TRANSPORT_PORT.to_string(), FieldValue::Unsigned16(40000));
        map.insert(DESTINATION_TRANSPORT_PORT.to_string(), FieldValue::Unsigned16(80));
        let (s, d): (IpAddr, IpAddr) = (src.parse().unwrap(), dst.parse().unwrap());
        let (sk, dk) = if s.is_ipv4() {
            (SOURCE_IPV4_ADDRESS, DESTINATION_IPV4_ADDRESS)
        } else {
            (SOURCE_IPV6_ADDRESS, DESTINATION_IPV6_ADDRESS)
        };
        map.insert(sk.to_string(), FieldValue::Address(s));
        map.insert(dk.to_string(), FieldValue::Address(d));
        map
    }

    #[test]
    fn bit_table_is_exact() {
        assert_eq!(TcpFlags::FIN.0, 0x01);
        assert_eq!(TcpFlags::SYN.0, 0x02);
        assert_eq!(TcpFlags::RST.0, 0x04);
        assert_eq!(TcpFlags::PSH.0, 0x08);
        assert_eq!(TcpFlags::ACK.0, 0x10);
        assert_eq!(TcpFlags::URG.0, 0x20);
        assert_eq!(TcpFlags::ECE.0, 0x40);
        assert_eq!(TcpFlags::CWR.0, 0x80);
        assert_eq!(QofCharacteristics::ECT0.0, 0x01);
        assert_eq!(QofCharacteristics::ECT1.0, 0x02);
        assert_eq!(QofCharacteristics::CE.0, 0x04);
        assert_eq!(QofCharacteristics::SYN_CE.0, 0x0400);
    }

    #[test]
    fn ecn_attempt_with_negotiation() {
        // SYN|ECE|CWR out, SYN|ACK|ECE back
        let flow = Flow::from_fields(&fields("198.51.100.1", "203.0.113.9", 0xc2, 0x52, 0x01, 0), true, 0).unwrap();
        assert!(flow.ecn_attempted);
        assert!(flow.ecn_negotiated);
        assert!(!flow.ecn_reflected);
        assert!(flow.did_establish);
        assert!(flow.ect0_seen);
        assert!(!flow.ect1_seen);
        assert!(!flow.ce_seen);
    }

    #[test]
    fn reflected_cwr_is_not_negotiation() {
        let flow = Flow::from_fields(&fields("198.51.100.1", "203.0.113.9", 0xc2, 0xd2, 0x06, 0), true, 0).unwrap();
        assert!(flow.ecn_reflected);
        assert!(!flow.ecn_negotiated);
        assert!(flow.ect1_seen);
        assert!(flow.ce_seen);
    }

    #[test]
    fn plain_probe_is_not_an_attempt() {
        let flow = Flow::from_fields(&fields("198.51.100.1", "203.0.113.9", 0x02, 0x12, 0, 0), true, 0).unwrap();
        assert!(!flow.ecn_attempted);
        assert!(flow.did_establish);
    }

    #[test]
    fn reset_means_no_establishment() {
        let flow = Flow::from_fields(&fields("198.51.100.1", "203.0.113.9", 0x02, 0x14, 0, 0), true, 0).unwrap();
        assert!(!flow.did_establish);
    }

    #[test]
    fn midstream_flow_rejected_only_when_syn_required() {
        let map = fields("198.51.100.1", "203.0.113.9", 0x10, 0x10, 0, 0);
        assert_eq!(Flow::from_fields(&map, true, 0), Err(RejectReason::NoSyn));
        assert!(Flow::from_fields(&map, false, 0).is_ok());
    }

    #[test]
    fn wrong_port_rejected() {
        let map = fields("198.51.100.1", "203.0.113.9", 0x02, 0x12, 0, 0);
        assert_eq!(Flow::from_fields(&map, true, 443), Err(RejectReason::WrongPort(80)));
        assert!(Flow::from_fields(&map, true, 80).is_ok());
    }

    #[test]
    fn missing_fields_rejected() {
        let mut map = fields("198.51.100.1", "203.0.113.9", 0x02, 0x12, 0, 0);
        map.remove(REVERSE_QOF_TCP_CHARACTERISTICS);
        assert_eq!(
            Flow::from_fields(&map, true, 0),
            Err(RejectReason::MissingField(REVERSE_QOF_TCP_CHARACTERISTICS))
        );

        let mut map = fields("198.51.100.1", "203.0.113.9", 0x02, 0x12, 0, 0);
        map.remove(DESTINATION_IPV4_ADDRESS);
        assert_eq!(
            Flow::from_fields(&map, true, 0),
            Err(RejectReason::MissingField(DESTINATION_IPV4_ADDRESS))
        );

        let mut map = fields("198.51.100.1", "203.0.113.9", 0x02, 0x12, 0, 0);
        map.remove(INITIAL_TCP_FLAGS);
        assert_eq!(Flow::from_fields(&map, false, 0), Err(RejectReason::MissingField(INITIAL_TCP_FLAGS)));
    }

    #[test]
    fn ipv6_addresses_accepted() {
        let flow = Flow::from_fields(&fields("2001:db8::1", "2001:db8::2", 0x02, 0x12, 0, 0), true, 0).unwrap();
        assert_eq!(flow.key(), "2001:db8::2");
    }

    #[test]
    fn observation_wire_form() {
        let t = Utc.with_ymd_and_hms(2017, 3, 1, 12, 0, 0).unwrap();
        let mut obs = Observation {
            time_start: t,
            time_end: t,
            path: "198.51.100.1 * 203.0.113.9".to_string(),
            condition: Condition::Ect0Seen,
            value: None,
        };
        assert_eq!(
            serde_json::to_string(&obs).unwrap(),
            r#"["0","2017-03-01T12:00:00Z","2017-03-01T12:00:00Z","198.51.100.1 * 203.0.113.9","ecn.ipmark.ect0.seen"]"#
        );

        obs.value = Some("3".to_string());
        assert!(serde_json::to_string(&obs).unwrap().ends_with(r#""ecn.ipmark.ect0.seen","3"]"#));
    }
}
