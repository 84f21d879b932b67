//! Match/key codec.
//!
//! Encodes a monitoring flow's identity (subscriber, rule number, version,
//! direction, tunnel id, UE address) into match fields and decodes counter
//! entries back. Decoding never assumes a field is present.

use crate::error::{EnforcementStatsError, Result};
use crate::protocol::{FlowMatch, MatchField, MatchValue};
use crate::tables::constants::{ETH_TYPE_IPV4, ETH_TYPE_IPV6};
use crate::types::{Direction, Masked, StatsClass};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const IMSI_PREFIX: &str = "IMSI";
const MAX_LEADING_ZEROS: usize = 3;

/// Packs `IMSI<digits>` as `(digits << 2) | leading_zero_count`.
pub fn encode_imsi(sid: &str) -> Result<u64> {
    let digits = sid.strip_prefix(IMSI_PREFIX).unwrap_or(sid);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(EnforcementStatsError::codec(format!(
            "subscriber id '{}' is not an IMSI",
            sid
        )));
    }

    let significant = digits.trim_start_matches('0');
    let leading_zeros = digits.len() - significant.len();
    if leading_zeros > MAX_LEADING_ZEROS || significant.is_empty() {
        return Err(EnforcementStatsError::codec(format!(
            "subscriber id '{}' has too many leading zeros",
            sid
        )));
    }

    let value: u64 = significant
        .parse()
        .map_err(|e| EnforcementStatsError::codec(format!("subscriber id '{}': {}", sid, e)))?;
    if value >= 1 << 62 {
        return Err(EnforcementStatsError::codec(format!(
            "subscriber id '{}' does not fit the match field",
            sid
        )));
    }

    Ok((value << 2) | leading_zeros as u64)
}

pub fn decode_imsi(encoded: u64) -> String {
    let leading_zeros = (encoded & 0x3) as usize;
    format!(
        "{}{}{}",
        IMSI_PREFIX,
        "0".repeat(leading_zeros),
        encoded >> 2
    )
}

/// Identity of one monitoring flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    pub sid: String,
    pub ip: Option<IpAddr>,
    /// 0 for per-subscriber default flows.
    pub rule_num: u32,
    /// 0 for per-subscriber default flows.
    pub version: u64,
    pub direction: Direction,
    /// Only matched when non-zero.
    pub teid: u32,
    pub class: Option<StatsClass>,
}

impl RuleMatch {
    pub fn new(
        sid: impl Into<String>,
        ip: Option<IpAddr>,
        rule_num: u32,
        version: u64,
        direction: Direction,
        teid: u32,
    ) -> Self {
        Self {
            sid: sid.into(),
            ip,
            rule_num,
            version,
            direction,
            teid,
            class: None,
        }
    }

    pub fn with_class(mut self, class: StatsClass) -> Self {
        self.class = Some(class);
        self
    }

    pub fn encode(&self) -> Result<FlowMatch> {
        let mut m = FlowMatch::new()
            .with_num(MatchField::Imsi, encode_imsi(&self.sid)?)
            .with_num(MatchField::Direction, self.direction.reg_value())
            .with_num(MatchField::RuleNum, u64::from(self.rule_num))
            .with_num(MatchField::RuleVersion, self.version);

        if self.teid != 0 {
            m.set(MatchField::Teid, MatchValue::Num(u64::from(self.teid)));
        }
        if let Some(class) = self.class {
            m.set(MatchField::StatsClass, MatchValue::Num(class.reg_value()));
        }

        match self.ip {
            Some(IpAddr::V4(addr)) => {
                let field = match self.direction {
                    Direction::In => MatchField::Ipv4Dst,
                    Direction::Out => MatchField::Ipv4Src,
                };
                m.set(MatchField::EthType, MatchValue::Num(ETH_TYPE_IPV4));
                m.set(field, MatchValue::Ipv4(Masked::Exact(addr)));
            }
            Some(IpAddr::V6(addr)) => {
                let field = match self.direction {
                    Direction::In => MatchField::Ipv6Dst,
                    Direction::Out => MatchField::Ipv6Src,
                };
                m.set(MatchField::EthType, MatchValue::Num(ETH_TYPE_IPV6));
                m.set(field, MatchValue::Ipv6(Masked::Exact(addr)));
            }
            None => {}
        }

        Ok(m)
    }
}

/// Builds the match fields for one monitoring flow.
pub fn encode_match(
    sid: &str,
    ip: Option<IpAddr>,
    rule_num: u32,
    version: u64,
    direction: Direction,
    teid: u32,
) -> Result<FlowMatch> {
    RuleMatch::new(sid, ip, rule_num, version, direction, teid).encode()
}

/// Identity fields extracted from a counter entry; `None` when absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedEntry {
    pub sid: Option<String>,
    pub rule_num: Option<u32>,
    pub version: Option<u64>,
    pub ipv4: Option<Masked<Ipv4Addr>>,
    pub ipv6: Option<Masked<Ipv6Addr>>,
    pub teid: Option<u32>,
    pub direction: Option<Direction>,
    pub class: Option<StatsClass>,
}

impl DecodedEntry {
    /// Base UE address, IPv4 preferred. IPv6 is returned as matched.
    pub fn ue_ip(&self) -> Option<IpAddr> {
        self.ipv4
            .map(|v| IpAddr::V4(v.addr()))
            .or_else(|| self.ipv6.map(|v| IpAddr::V6(v.addr())))
    }
}

pub fn decode_entry(flow_match: &FlowMatch) -> DecodedEntry {
    let direction = flow_match
        .get_num(MatchField::Direction)
        .and_then(Direction::from_reg_value);

    // The UE address field depends on direction; without one there is none.
    let (ipv4, ipv6) = match direction {
        Some(Direction::In) => (
            flow_match.get_ipv4(MatchField::Ipv4Dst),
            flow_match.get_ipv6(MatchField::Ipv6Dst),
        ),
        Some(Direction::Out) => (
            flow_match.get_ipv4(MatchField::Ipv4Src),
            flow_match.get_ipv6(MatchField::Ipv6Src),
        ),
        None => (None, None),
    };

    DecodedEntry {
        sid: flow_match.get_num(MatchField::Imsi).map(decode_imsi),
        rule_num: flow_match
            .get_num(MatchField::RuleNum)
            .and_then(|v| u32::try_from(v).ok()),
        version: flow_match.get_num(MatchField::RuleVersion),
        ipv4,
        ipv6,
        teid: flow_match
            .get_num(MatchField::Teid)
            .and_then(|v| u32::try_from(v).ok()),
        direction,
        class: flow_match
            .get_num(MatchField::StatsClass)
            .and_then(StatsClass::from_reg_value),
    }
}
