use clap::Parser;
use link_observer::{
    dns::{DnsProbe, UdpDnsClient},
    icmp::{IcmpProbe, RawPinger},
    metrics_server,
    network::{self, address::IpCommand},
    v4::{Dhcp4Probe, DhcpV4Client},
    v6::{Dhcp6Probe, DhcpV6Client},
    Args, Observer, ObserverConfig, ObserverError, ObserverMetrics,
};
use std::{process, sync::Arc};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_logging(verbose: bool) {
    let default_directive = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_observer(config: &ObserverConfig, metrics: &ObserverMetrics) -> Observer {
    let dns = DnsProbe::new(
        UdpDnsClient::new(config.dns_timeout),
        config.dns_targets.clone(),
        config.dns_qname.clone(),
        config.dns_failure_policy,
        metrics.dns.clone(),
    );
    let icmp = IcmpProbe::new(
        RawPinger::default(),
        config.icmp_targets.clone(),
        config.icmp_count,
        config.resolve_family(),
        metrics.icmp.clone(),
    );

    let mut observer = Observer::new(
        config.interface.clone(),
        config.interval,
        Arc::new(IpCommand::default()),
        Box::new(dns),
        Box::new(icmp),
    );
    if !config.disable4 {
        observer = observer.with_lease_probe(Box::new(Dhcp4Probe::new(
            DhcpV4Client::new(config.dhcp_v4()),
            metrics.dhcp4.clone(),
            config.verbose,
        )));
    }
    if !config.disable6 {
        observer = observer.with_lease_probe(Box::new(Dhcp6Probe::new(
            DhcpV6Client::new(config.dhcp_v6()),
            metrics.dhcp6.clone(),
            config.verbose,
        )));
    }
    observer
}

async fn run(args: Args) -> Result<(), ObserverError> {
    let config = ObserverConfig::try_from(args)?;
    network::interface_index(&config.interface)
        .map_err(|_| ObserverError::InterfaceInvalid(config.interface.clone()))?;

    info!(
        interface = %config.interface,
        icmp_targets = ?config.icmp_targets,
        icmp_count = config.icmp_count,
        interval = ?config.interval,
        disable4 = config.disable4,
        disable6 = config.disable6,
        dns_qname = %config.dns_qname,
        dns_targets = ?config.dns_targets,
        "Starting observer"
    );

    let metrics = ObserverMetrics::new()?;
    let observer = build_observer(&config, &metrics);
    tokio::spawn(async move { observer.run().await });

    metrics_server::serve(metrics, config.host_port).await
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose);
    info!(version = env!("CARGO_PKG_VERSION"), "running");

    if let Err(e) = run(args).await {
        error!(error = %e, "Observer stopped");
        process::exit(1);
    }
}
