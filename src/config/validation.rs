//! Configuration validation

use super::{Config, UplinkMode};
use crate::protocol::ZoneId;
use crate::session::crypto::{CipherId, CryptoRegistry};
use crate::telemetry::is_valid_level;
use std::collections::BTreeSet;

/// Highest zone id that fits the 12-bit VLAN-style range
pub const MAX_ZONE_ID: ZoneId = 4095;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_diagnostics(&self) {
        for warning in &self.warnings {
            println!("[WARN] {}", warning);
        }
        for error in &self.errors {
            println!("[ERROR] {}", error);
        }
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate configuration and return warnings/errors
pub fn validate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_log(config, &mut result);
    validate_node(config, &mut result);
    validate_session(config, &mut result);
    validate_heartbeat(config, &mut result);
    validate_uplinks(config, &mut result);
    validate_conntrack(config, &mut result);

    result
}

/// `host:port` with a non-empty host and a numeric port
fn is_host_port(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

fn validate_log(config: &Config, result: &mut ValidationResult) {
    if !is_valid_level(&config.log.level) {
        result.error(format!("log.level: invalid level '{}'", config.log.level));
    }
}

fn validate_node(config: &Config, result: &mut ValidationResult) {
    let node = &config.node;
    if node.name.is_empty() {
        result.warn("node.name: empty, echo replies will carry no identity");
    }

    let mut seen = BTreeSet::new();
    for &zone in &node.zones {
        if zone == 0 || zone > MAX_ZONE_ID {
            result.error(format!(
                "node.zones: zone {} out of range 1..={}",
                zone, MAX_ZONE_ID
            ));
        }
        if !seen.insert(zone) {
            result.warn(format!("node.zones: zone {} listed twice", zone));
        }
    }

    if let Some(listen) = &node.listen {
        if !is_host_port(listen) {
            result.error(format!("node.listen: '{}' is not host:port", listen));
        }
    }

    if node.listen.is_none() && config.uplinks.is_empty() {
        result.warn("node: no listen address and no uplinks, node is isolated");
    }
}

fn validate_session(config: &Config, result: &mut ValidationResult) {
    let session = &config.session;
    match CipherId::from_name(&session.crypt) {
        None => result.error(format!("session.crypt: unknown cipher '{}'", session.crypt)),
        Some(id) => {
            if !CryptoRegistry::new(&session.key).provides(id) {
                result.error(format!("session.crypt: cipher '{}' is not available", id));
            }
            if id == CipherId::Xor && session.key.is_empty() {
                result.warn("session.key: empty key with xor cipher");
            }
        }
    }

    if session.min_frame < crate::protocol::ethernet::HEADER_SIZE {
        result.error(format!(
            "session.min_frame: {} is shorter than an Ethernet header",
            session.min_frame
        ));
    }
    if session.min_frame > session.max_frame {
        result.error(format!(
            "session: min_frame ({}) > max_frame ({})",
            session.min_frame, session.max_frame
        ));
    }
    if session.max_frame > u16::MAX as usize {
        result.error(format!(
            "session.max_frame: {} does not fit the 16-bit length field",
            session.max_frame
        ));
    }
    if session.queue_size == 0 {
        result.warn("session.queue_size: 0, using 1");
    }
    if session.dial_timeout == 0 {
        result.error("session.dial_timeout: must be greater than 0");
    }
}

fn validate_heartbeat(config: &Config, result: &mut ValidationResult) {
    let hb = &config.heartbeat;
    if hb.idle == 0 {
        result.error("heartbeat.idle: must be greater than 0");
    }
    if hb.count == 0 {
        result.error("heartbeat.count: must be greater than 0");
    }
    if hb.interval == 0 {
        result.error("heartbeat.interval: must be greater than 0");
    }
}

fn validate_uplinks(config: &Config, result: &mut ValidationResult) {
    for (i, uplink) in config.uplinks.iter().enumerate() {
        if uplink.addrs.is_empty() {
            result.error(format!("uplinks[{}]: no addresses", i));
        }
        for addr in &uplink.addrs {
            if !is_host_port(addr) {
                result.error(format!("uplinks[{}]: '{}' is not host:port", i, addr));
            }
        }
        if uplink.mode == UplinkMode::Backup && uplink.addrs.len() == 1 {
            result.warn(format!(
                "uplinks[{}]: backup mode with a single address has nothing to fail over to",
                i
            ));
        }
    }
}

fn validate_conntrack(config: &Config, result: &mut ValidationResult) {
    let conntrack = &config.conntrack;
    if !conntrack.enabled && !conntrack.snat.is_empty() {
        result.warn("conntrack.snat: rules ignored while conntrack is disabled");
    }

    let static_zones: BTreeSet<ZoneId> = config.node.zones.iter().copied().collect();
    let mut seen = BTreeSet::new();
    for rule in &conntrack.snat {
        if !seen.insert(rule.zone) {
            result.error(format!("conntrack.snat: zone {} has more than one rule", rule.zone));
        }
        if !static_zones.is_empty() && !static_zones.contains(&rule.zone) {
            result.error(format!(
                "conntrack.snat: zone {} is not in node.zones",
                rule.zone
            ));
        }
        if rule.address.is_unspecified() || rule.address.is_broadcast() {
            result.error(format!(
                "conntrack.snat: zone {} has unusable address {}",
                rule.zone, rule.address
            ));
        }
    }
}
