//! Table, key and constant definitions for enforcement-statsd

/// Redis hash holding restart markers (switch daemon process ids)
pub const RESTART_INFO_TABLE_NAME: &str = "ENFORCEMENT_RESTART_INFO";

/// Redis hash holding the authoritative rule versions
pub const RULE_VERSION_TABLE_NAME: &str = "RULE_VERSIONS";

/// Redis hash: rule id -> rule number
pub const RULE_NUMS_TABLE_NAME: &str = "RULE_NUMS";

/// Redis hash: rule number -> rule id
pub const RULE_IDS_TABLE_NAME: &str = "RULE_IDS";

/// Redis hash: IPv6 /64 prefix -> interface id
pub const IPV6_PREFIX_TABLE_NAME: &str = "IPV6_PREFIX_INTERFACES";

/// Restart marker key; also the process looked up with `pidof`
pub const SWITCH_DAEMON_KEY: &str = "ovs-vswitchd";

/// Rule id placeholder for per-subscriber default-drop flows
pub const DEFAULT_DROP_FLOW_NAME: &str = "internal_default_drop_flow_rule";

/// Flow priorities
pub mod priority {
    /// Table-wide deny-all flow
    pub const MINIMUM: u16 = 0;

    /// Per-subscriber default-drop flows
    pub const DROP: u16 = MINIMUM + 1;

    /// Per-rule monitoring flows
    pub const DEFAULT: u16 = 10;
}

/// Protocol and timing constants
pub mod constants {
    use std::time::Duration;

    /// Link-layer header deducted per inbound packet
    pub const ETH_FRAME_SIZE_BYTES: u64 = 14;

    /// Cookie of the table-wide deny-all flow
    pub const DEFAULT_FLOW_COOKIE: u64 = 0xffff_ffff_ffff_fffe;

    pub const ETH_TYPE_IPV4: u64 = 0x0800;
    pub const ETH_TYPE_IPV6: u64 = 0x86dd;

    /// Bootstrap empty-report interval
    pub const INIT_SLEEP_TIME: Duration = Duration::from_secs(3);

    /// Elapsed intervals since last report before the cycle counts as stalled
    pub const MAX_DELAY_INTERVALS: u32 = 20;

    /// Added to elapsed time to absorb RPC latency
    pub const RPC_LATENCY_SLACK: Duration = Duration::from_millis(150);

    /// Upstream reporting RPC timeout
    pub const SESSIOND_RPC_TIMEOUT: Duration = Duration::from_secs(10);

    /// Barrier acknowledgment timeout
    pub const MSG_CHANNEL_TIMEOUT: Duration = Duration::from_secs(5);

    /// Datapath hello handshake timeout
    pub const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
}
