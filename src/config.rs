use crate::{error::ObserverError, network::IpFamily};
use clap::{Parser, ValueEnum};
use std::time::Duration;

pub const DHCPV4_CLIENT_PORT: u16 = 68;
pub const DHCPV4_SERVER_PORT: u16 = 67;
pub const DHCPV6_CLIENT_PORT: u16 = 546;
pub const DHCPV6_SERVER_PORT: u16 = 547;
pub const MAX_ICMP_COUNT: u32 = u16::MAX as u32 + 1;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// The network interface to operate on (e.g., 'eth0')
    #[arg(short, long)]
    pub interface: String,

    /// Comma separated list of ICMP targets
    #[arg(long, value_delimiter = ',')]
    pub icmp_targets: Vec<String>,

    /// Echo requests sent to each ICMP target per pass
    #[arg(long, default_value_t = 3)]
    pub icmp_count: u32,

    /// Interval between two sampling passes (e.g. '5s', '500ms', '1m')
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    pub interval: Duration,

    /// DHCP read/write timeout, defaults to the sampling interval
    #[arg(long, value_parser = parse_duration)]
    pub dhcp_timeout: Option<Duration>,

    /// Comma separated list of DNS resolvers to probe
    #[arg(long = "dns", value_delimiter = ',')]
    pub dns_targets: Vec<String>,

    /// TXT record name queried on every resolver
    #[arg(long, default_value = "healthcheck.event.dreamhack.se.")]
    pub qname: String,

    /// Per-resolver request timeout
    #[arg(long, default_value = "2s", value_parser = parse_duration)]
    pub dns_timeout: Duration,

    /// Whether a failing resolver stops probing of the remaining ones
    #[arg(long, value_enum, default_value_t = DnsFailurePolicy::Continue)]
    pub dns_failure_policy: DnsFailurePolicy,

    /// Disable all IPv4 client behaviour - DHCPv4 and ICMPv4
    #[arg(long)]
    pub disable4: bool,

    /// Disable all IPv6 client behaviour - DHCPv6 and ICMPv6
    #[arg(long)]
    pub disable6: bool,

    /// Log every handshake packet and enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Port of the metrics listener
    #[arg(long, default_value_t = 9023)]
    pub host_port: u16,
}

/// What the DNS probe does after a resolver failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum DnsFailurePolicy {
    /// Count the failure and keep probing the remaining resolvers.
    #[default]
    Continue,
    /// Stop at the first failing resolver.
    Abort,
}

/// Address family used to resolve ICMP targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolveFamily {
    /// Let the destination's natural family decide.
    #[default]
    Any,
    V4,
    V6,
}

impl ResolveFamily {
    pub fn from_disable_flags(disable4: bool, disable6: bool) -> Self {
        match (disable4, disable6) {
            (true, _) => Self::V6,
            (_, true) => Self::V4,
            _ => Self::Any,
        }
    }

    pub fn allows(&self, family: IpFamily) -> bool {
        match self {
            Self::Any => true,
            Self::V4 => family == IpFamily::V4,
            Self::V6 => family == IpFamily::V6,
        }
    }
}

/// Per-family DHCP client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub interface: String,
    pub client_port: u16,
    pub server_port: u16,
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn v4(interface: String, timeout: Duration) -> Self {
        Self {
            interface,
            client_port: DHCPV4_CLIENT_PORT,
            server_port: DHCPV4_SERVER_PORT,
            timeout,
        }
    }

    pub fn v6(interface: String, timeout: Duration) -> Self {
        Self {
            interface,
            client_port: DHCPV6_CLIENT_PORT,
            server_port: DHCPV6_SERVER_PORT,
            timeout,
        }
    }
}

/// Validated agent configuration.
#[derive(Debug, Clone)]
pub struct ObserverConfig {
    pub interface: String,
    pub interval: Duration,
    pub dhcp_timeout: Duration,
    pub disable4: bool,
    pub disable6: bool,
    pub dns_targets: Vec<String>,
    pub dns_qname: String,
    pub dns_timeout: Duration,
    pub dns_failure_policy: DnsFailurePolicy,
    pub icmp_targets: Vec<String>,
    pub icmp_count: u32,
    pub verbose: bool,
    pub host_port: u16,
}

impl ObserverConfig {
    pub fn resolve_family(&self) -> ResolveFamily {
        ResolveFamily::from_disable_flags(self.disable4, self.disable6)
    }

    pub fn dhcp_v4(&self) -> ClientConfig {
        ClientConfig::v4(self.interface.clone(), self.dhcp_timeout)
    }

    pub fn dhcp_v6(&self) -> ClientConfig {
        ClientConfig::v6(self.interface.clone(), self.dhcp_timeout)
    }
}

impl TryFrom<Args> for ObserverConfig {
    type Error = ObserverError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        if args.interface.trim().is_empty() {
            return Err(ObserverError::Config("interface must be specified".into()));
        }
        if args.disable4 && args.disable6 {
            return Err(ObserverError::Config(
                "both disable4 and disable6 set, needs at least one family".into(),
            ));
        }
        if args.icmp_count == 0 {
            return Err(ObserverError::Config("icmp-count must be at least 1".into()));
        }
        // echo sequence numbers are 16 bit
        if args.icmp_count > MAX_ICMP_COUNT {
            return Err(ObserverError::Config(format!(
                "icmp-count must be at most {MAX_ICMP_COUNT}"
            )));
        }

        Ok(Self {
            interface: args.interface,
            dhcp_timeout: args.dhcp_timeout.unwrap_or(args.interval),
            interval: args.interval,
            disable4: args.disable4,
            disable6: args.disable6,
            dns_targets: non_empty(args.dns_targets),
            dns_qname: args.qname,
            dns_timeout: args.dns_timeout,
            dns_failure_policy: args.dns_failure_policy,
            icmp_targets: non_empty(args.icmp_targets),
            icmp_count: args.icmp_count,
            verbose: args.verbose,
            host_port: args.host_port,
        })
    }
}

fn non_empty(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

/// Parses durations such as `500ms`, `5s`, `2m` or `1h`. A bare number is seconds.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration '{value}'"))?;
    let seconds = match unit {
        "" | "s" => number,
        "ms" => number / 1000.0,
        "m" => number * 60.0,
        "h" => number * 3600.0,
        _ => return Err(format!("unknown duration unit '{unit}' in '{value}'")),
    };
    Duration::try_from_secs_f64(seconds).map_err(|e| format!("invalid duration '{value}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["link-observer", "--interface", "eth0"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_defaults() {
        let config = ObserverConfig::try_from(args(&[])).unwrap();
        assert_eq!(config.interface, "eth0");
        assert_eq!(config.interval, Duration::from_secs(5));
        assert_eq!(config.dhcp_timeout, Duration::from_secs(5));
        assert_eq!(config.icmp_count, 3);
        assert_eq!(config.dns_qname, "healthcheck.event.dreamhack.se.");
        assert_eq!(config.dns_failure_policy, DnsFailurePolicy::Continue);
        assert_eq!(config.host_port, 9023);
        assert!(config.dns_targets.is_empty());
        assert_eq!(config.resolve_family(), ResolveFamily::Any);
    }

    #[test]
    fn test_target_lists_are_split() {
        let config = ObserverConfig::try_from(args(&[
            "--dns",
            "1.1.1.1,,9.9.9.9",
            "--icmp-targets",
            "10.0.0.1,example.net",
        ]))
        .unwrap();
        assert_eq!(config.dns_targets, vec!["1.1.1.1", "9.9.9.9"]);
        assert_eq!(config.icmp_targets, vec!["10.0.0.1", "example.net"]);
    }

    #[test]
    fn test_both_families_disabled_is_rejected() {
        let result = ObserverConfig::try_from(args(&["--disable4", "--disable6"]));
        assert!(matches!(result, Err(ObserverError::Config(_))));
    }

    #[test]
    fn test_zero_icmp_count_is_rejected() {
        let result = ObserverConfig::try_from(args(&["--icmp-count", "0"]));
        assert!(matches!(result, Err(ObserverError::Config(_))));
    }

    #[test]
    fn test_icmp_count_fits_sequence_numbers() {
        let result = ObserverConfig::try_from(args(&["--icmp-count", "65537"]));
        assert!(matches!(result, Err(ObserverError::Config(_))));

        let config = ObserverConfig::try_from(args(&["--icmp-count", "65536"])).unwrap();
        assert_eq!(config.icmp_count, MAX_ICMP_COUNT);
    }

    #[test]
    fn test_dhcp_timeout_override() {
        let config =
            ObserverConfig::try_from(args(&["--interval", "10s", "--dhcp-timeout", "3s"])).unwrap();
        assert_eq!(config.dhcp_v4().timeout, Duration::from_secs(3));
        assert_eq!(config.dhcp_v6().server_port, DHCPV6_SERVER_PORT);
    }

    #[test]
    fn test_resolve_family_from_flags() {
        assert_eq!(ResolveFamily::from_disable_flags(true, false), ResolveFamily::V6);
        assert_eq!(ResolveFamily::from_disable_flags(false, true), ResolveFamily::V4);
        assert!(ResolveFamily::V4.allows(IpFamily::V4));
        assert!(!ResolveFamily::V4.allows(IpFamily::V6));
        assert!(ResolveFamily::Any.allows(IpFamily::V6));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("5s"), Ok(Duration::from_secs(5)));
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration("7"), Ok(Duration::from_secs(7)));
        assert!(parse_duration("5 parsecs").is_err());
        assert!(parse_duration("s").is_err());
    }
}
