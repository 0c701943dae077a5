//! Probe orchestrator
//!
//! One iteration runs the DHCPv4 and DHCPv6 lease probes (claiming and
//! releasing each acquired address on the interface), then the DNS probe and
//! finally the ICMP probe. A failing probe is logged and the iteration moves
//! on; nothing a probe does can stop the loop.

use crate::{
    client::Lease,
    error::ProbeError,
    network::{
        address::{AddressManager, InterfaceAddress},
        IpFamily,
    },
};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// A DHCP probe producing a lease for one address family.
#[async_trait]
pub trait LeaseProbe: Send + Sync {
    fn family(&self) -> IpFamily;

    async fn acquire(&self) -> Result<Lease, ProbeError>;
}

/// A probe whose results end up in metrics only.
#[async_trait]
pub trait Probe: Send + Sync {
    fn name(&self) -> &'static str;

    async fn sample(&self) -> Result<(), ProbeError>;
}

/// Where the orchestrator currently is within an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    RunningDhcp4,
    AddressClaimed4,
    RunningDhcp6,
    AddressClaimed6,
    RunningDns,
    RunningIcmp,
    Sleeping,
}

impl Phase {
    fn running(family: IpFamily) -> Self {
        match family {
            IpFamily::V4 => Self::RunningDhcp4,
            IpFamily::V6 => Self::RunningDhcp6,
        }
    }

    fn claimed(family: IpFamily) -> Self {
        match family {
            IpFamily::V4 => Self::AddressClaimed4,
            IpFamily::V6 => Self::AddressClaimed6,
        }
    }
}

pub struct Observer {
    interface: String,
    interval: Duration,
    addresses: Arc<dyn AddressManager>,
    dhcp4: Option<Box<dyn LeaseProbe>>,
    dhcp6: Option<Box<dyn LeaseProbe>>,
    dns: Box<dyn Probe>,
    icmp: Box<dyn Probe>,
    phase: watch::Sender<Phase>,
}

impl Observer {
    /// Creates an observer without DHCP probes; add them with
    /// [`Observer::with_lease_probe`] for every enabled family.
    pub fn new(
        interface: impl Into<String>,
        interval: Duration,
        addresses: Arc<dyn AddressManager>,
        dns: Box<dyn Probe>,
        icmp: Box<dyn Probe>,
    ) -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        Self {
            interface: interface.into(),
            interval,
            addresses,
            dhcp4: None,
            dhcp6: None,
            dns,
            icmp,
            phase,
        }
    }

    /// Installs the lease probe for its address family, replacing any previous one.
    pub fn with_lease_probe(mut self, probe: Box<dyn LeaseProbe>) -> Self {
        match probe.family() {
            IpFamily::V4 => self.dhcp4 = Some(probe),
            IpFamily::V6 => self.dhcp6 = Some(probe),
        }
        self
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Follows phase changes from another task.
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    fn enter(&self, phase: Phase) {
        debug!(?phase, "Observer phase change");
        self.phase.send_replace(phase);
    }

    /// Runs one iteration of all probes and leaves the observer `Sleeping`.
    pub async fn run_once(&self) {
        self.enter(Phase::Idle);
        for probe in [&self.dhcp4, &self.dhcp6].into_iter().flatten() {
            let family = probe.family();
            self.enter(Phase::running(family));
            match probe.acquire().await {
                Ok(lease) => {
                    self.enter(Phase::claimed(family));
                    self.claim(&lease).await;
                }
                Err(e) => warn!(
                    interface = %self.interface,
                    family = %family,
                    kind = ?e.kind(),
                    error = %e,
                    "DHCP probe failed, not claiming an address"
                ),
            }
        }

        for (phase, probe) in [(Phase::RunningDns, &self.dns), (Phase::RunningIcmp, &self.icmp)] {
            self.enter(phase);
            if let Err(e) = probe.sample().await {
                warn!(probe = probe.name(), kind = ?e.kind(), error = %e, "Probe failed");
            }
        }
        self.enter(Phase::Sleeping);
    }

    /// Runs iterations forever, sleeping one interval in between.
    pub async fn run(&self) {
        info!(interface = %self.interface, interval = ?self.interval, "Starting observer loop");
        loop {
            self.run_once().await;
            tokio::time::sleep(self.interval).await;
        }
    }

    /// Adds the leased address to the interface and removes it again.
    ///
    /// An address that is already configured is left untouched: it is neither
    /// added nor removed. Failures are logged only.
    async fn claim(&self, lease: &Lease) {
        let address = lease.interface_address();
        let family = address.family();

        let existing = match self.addresses.list(&self.interface, family).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!(
                    interface = %self.interface,
                    family = %family,
                    error = %e,
                    "Could not list interface addresses, skipping claim"
                );
                return;
            }
        };
        if existing.contains(&address.address) {
            debug!(address = %address, "Leased address already configured");
            return;
        }

        if let Err(e) = self.addresses.add(&self.interface, &address).await {
            warn!(address = %address, error = %e, "Could not add leased address");
            return;
        }
        info!(interface = %self.interface, address = %address, "Claimed leased address");
        self.release(&address).await;
    }

    async fn release(&self, address: &InterfaceAddress) {
        if let Err(e) = self.addresses.remove(&self.interface, address).await {
            warn!(address = %address, error = %e, "Could not remove leased address");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::address::AddressError;
    use std::{
        net::IpAddr,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex, OnceLock,
        },
    };

    /// Shared log of fake calls, each tagged with the phase it ran in.
    #[derive(Clone, Default)]
    struct Journal {
        entries: Arc<Mutex<Vec<(&'static str, Phase)>>>,
        phase: Arc<OnceLock<watch::Receiver<Phase>>>,
    }

    impl Journal {
        fn attach(&self, observer: &Observer) {
            let _ = self.phase.set(observer.subscribe());
        }

        fn note(&self, name: &'static str) {
            let phase = self.phase.get().map_or(Phase::Idle, |rx| *rx.borrow());
            self.entries.lock().unwrap().push((name, phase));
        }

        fn names(&self) -> Vec<&'static str> {
            self.entries.lock().unwrap().iter().map(|(n, _)| *n).collect()
        }

        fn phases(&self) -> Vec<Phase> {
            self.entries.lock().unwrap().iter().map(|(_, p)| *p).collect()
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        List(IpFamily),
        Add(InterfaceAddress),
        Remove(InterfaceAddress),
    }

    #[derive(Default)]
    struct RecordingAddresses {
        present: Vec<IpAddr>,
        fail_list: bool,
        fail_add: bool,
        calls: Mutex<Vec<Call>>,
        journal: Journal,
    }

    fn command_failed() -> AddressError {
        AddressError::CommandFailed {
            command: "ip".to_string(),
            exit_code: 2,
            stderr: "RTNETLINK answers: Operation not permitted".to_string(),
        }
    }

    #[async_trait]
    impl AddressManager for RecordingAddresses {
        async fn list(&self, _: &str, family: IpFamily) -> Result<Vec<IpAddr>, AddressError> {
            self.journal.note("list");
            self.calls.lock().unwrap().push(Call::List(family));
            if self.fail_list {
                return Err(command_failed());
            }
            Ok(self.present.clone())
        }

        async fn add(&self, _: &str, address: &InterfaceAddress) -> Result<(), AddressError> {
            self.journal.note("add");
            self.calls.lock().unwrap().push(Call::Add(*address));
            if self.fail_add {
                return Err(command_failed());
            }
            Ok(())
        }

        async fn remove(&self, _: &str, address: &InterfaceAddress) -> Result<(), AddressError> {
            self.journal.note("remove");
            self.calls.lock().unwrap().push(Call::Remove(*address));
            Ok(())
        }
    }

    struct FixedLease {
        lease: Option<Lease>,
        family: IpFamily,
        calls: Arc<AtomicUsize>,
        journal: Journal,
    }

    #[async_trait]
    impl LeaseProbe for FixedLease {
        fn family(&self) -> IpFamily {
            self.family
        }

        async fn acquire(&self) -> Result<Lease, ProbeError> {
            self.journal.note(match self.family {
                IpFamily::V4 => "dhcp4",
                IpFamily::V6 => "dhcp6",
            });
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.lease.clone().ok_or(ProbeError::NoAckReceived)
        }
    }

    struct CountingProbe {
        name: &'static str,
        fails: bool,
        calls: Arc<AtomicUsize>,
        journal: Journal,
    }

    #[async_trait]
    impl Probe for CountingProbe {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn sample(&self) -> Result<(), ProbeError> {
            self.journal.note(self.name);
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fails {
                return Err(ProbeError::Timeout {
                    stage: "waiting for DNS answer",
                    after: Duration::from_secs(2),
                });
            }
            Ok(())
        }
    }

    struct Harness {
        addresses: Arc<RecordingAddresses>,
        dhcp: Arc<AtomicUsize>,
        dns: Arc<AtomicUsize>,
        icmp: Arc<AtomicUsize>,
        journal: Journal,
        observer: Observer,
    }

    /// One lease probe per entry, installed in the given order.
    fn harness_with(
        addresses: RecordingAddresses,
        leases: Vec<(IpFamily, Option<Lease>)>,
        dns_fails: bool,
    ) -> Harness {
        let journal = addresses.journal.clone();
        let addresses = Arc::new(addresses);
        let dhcp = Arc::new(AtomicUsize::new(0));
        let dns = Arc::new(AtomicUsize::new(0));
        let icmp = Arc::new(AtomicUsize::new(0));
        let mut observer = Observer::new(
            "eth0",
            Duration::from_secs(5),
            addresses.clone(),
            Box::new(CountingProbe {
                name: "dns",
                fails: dns_fails,
                calls: dns.clone(),
                journal: journal.clone(),
            }),
            Box::new(CountingProbe {
                name: "icmp",
                fails: false,
                calls: icmp.clone(),
                journal: journal.clone(),
            }),
        );
        for (family, lease) in leases {
            observer = observer.with_lease_probe(Box::new(FixedLease {
                lease,
                family,
                calls: dhcp.clone(),
                journal: journal.clone(),
            }));
        }
        journal.attach(&observer);
        Harness {
            addresses,
            dhcp,
            dns,
            icmp,
            journal,
            observer,
        }
    }

    fn harness(addresses: RecordingAddresses, lease: Option<Lease>, dns_fails: bool) -> Harness {
        let family = lease.as_ref().map_or(IpFamily::V4, Lease::family);
        harness_with(addresses, vec![(family, lease)], dns_fails)
    }

    fn lease(addr: &str, prefix_len: u8) -> Option<Lease> {
        Some(Lease::new(addr.parse().unwrap(), prefix_len, None))
    }

    #[tokio::test]
    async fn test_claims_and_releases_new_address() {
        let h = harness(RecordingAddresses::default(), lease("10.0.0.5", 24), false);

        h.observer.run_once().await;

        let address = InterfaceAddress::new("10.0.0.5".parse().unwrap(), 24);
        assert_eq!(
            *h.addresses.calls.lock().unwrap(),
            vec![
                Call::List(IpFamily::V4),
                Call::Add(address),
                Call::Remove(address)
            ]
        );
    }

    #[tokio::test]
    async fn test_preexisting_address_is_left_alone() {
        let addresses = RecordingAddresses {
            present: vec!["2001:db8::5".parse().unwrap()],
            ..Default::default()
        };
        let h = harness(addresses, lease("2001:db8::5", 128), false);

        h.observer.run_once().await;

        assert_eq!(
            *h.addresses.calls.lock().unwrap(),
            vec![Call::List(IpFamily::V6)]
        );
    }

    #[tokio::test]
    async fn test_failed_add_is_not_removed() {
        let addresses = RecordingAddresses {
            fail_add: true,
            ..Default::default()
        };
        let h = harness(addresses, lease("10.0.0.5", 24), false);

        h.observer.run_once().await;

        let calls = h.addresses.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(!calls.iter().any(|c| matches!(c, Call::Remove(_))));
        assert_eq!(h.icmp.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_list_failure_skips_claim() {
        let addresses = RecordingAddresses {
            fail_list: true,
            ..Default::default()
        };
        let h = harness(addresses, lease("10.0.0.5", 24), false);

        h.observer.run_once().await;

        assert_eq!(
            *h.addresses.calls.lock().unwrap(),
            vec![Call::List(IpFamily::V4)]
        );
    }

    #[tokio::test]
    async fn test_dhcp_failure_skips_claim_but_not_other_probes() {
        let h = harness(RecordingAddresses::default(), None, false);

        h.observer.run_once().await;

        assert_eq!(h.dhcp.load(Ordering::SeqCst), 1);
        assert!(h.addresses.calls.lock().unwrap().is_empty());
        assert_eq!(h.dns.load(Ordering::SeqCst), 1);
        assert_eq!(h.icmp.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dns_failure_does_not_block_icmp() {
        let h = harness(RecordingAddresses::default(), lease("10.0.0.5", 24), true);

        h.observer.run_once().await;
        h.observer.run_once().await;

        assert_eq!(h.dns.load(Ordering::SeqCst), 2);
        assert_eq!(h.icmp.load(Ordering::SeqCst), 2);
        assert_eq!(h.observer.phase(), Phase::Sleeping);
    }

    #[tokio::test]
    async fn test_iteration_runs_in_fixed_order() {
        // installed v6 first; the iteration order must not depend on that
        let h = harness_with(
            RecordingAddresses::default(),
            vec![
                (IpFamily::V6, lease("2001:db8::5", 128)),
                (IpFamily::V4, lease("10.0.0.5", 24)),
            ],
            false,
        );

        h.observer.run_once().await;

        assert_eq!(
            h.journal.names(),
            vec![
                "dhcp4", "list", "add", "remove", "dhcp6", "list", "add", "remove", "dns", "icmp"
            ]
        );
        assert_eq!(
            h.journal.phases(),
            vec![
                Phase::RunningDhcp4,
                Phase::AddressClaimed4,
                Phase::AddressClaimed4,
                Phase::AddressClaimed4,
                Phase::RunningDhcp6,
                Phase::AddressClaimed6,
                Phase::AddressClaimed6,
                Phase::AddressClaimed6,
                Phase::RunningDns,
                Phase::RunningIcmp,
            ]
        );
        assert_eq!(h.observer.phase(), Phase::Sleeping);
    }

    #[tokio::test]
    async fn test_failed_dhcp4_still_runs_dhcp6() {
        let h = harness_with(
            RecordingAddresses::default(),
            vec![
                (IpFamily::V4, None),
                (IpFamily::V6, lease("2001:db8::5", 128)),
            ],
            false,
        );

        h.observer.run_once().await;

        assert_eq!(
            h.journal.names(),
            vec!["dhcp4", "dhcp6", "list", "add", "remove", "dns", "icmp"]
        );
        assert_eq!(h.dhcp.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_new_iteration_leaves_sleeping() {
        let h = harness(RecordingAddresses::default(), None, false);
        let mut phases = h.observer.subscribe();

        h.observer.run_once().await;
        assert_eq!(*phases.borrow_and_update(), Phase::Sleeping);

        h.observer.run_once().await;
        // every probe of the second iteration ran outside of Sleeping
        let second = &h.journal.phases()[3..];
        assert_eq!(
            second,
            [Phase::RunningDhcp4, Phase::RunningDns, Phase::RunningIcmp]
        );
        assert!(phases.has_changed().unwrap());
        assert_eq!(*phases.borrow_and_update(), Phase::Sleeping);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sleeps_between_iterations() {
        let h = harness(RecordingAddresses::default(), None, false);
        let observer = Arc::new(h.observer);
        let task = {
            let observer = observer.clone();
            tokio::spawn(async move { observer.run().await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.icmp.load(Ordering::SeqCst), 1);
        assert_eq!(observer.phase(), Phase::Sleeping);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.icmp.load(Ordering::SeqCst), 2);
        assert_eq!(observer.phase(), Phase::Sleeping);
        task.abort();
    }
}
