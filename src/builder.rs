//! Fleet map builder: concurrent fan-out of [`Probe::inspect`] over the
//! configured hypervisors, merged into one [`FleetMap`].

use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream;
use tokio_util::sync::CancellationToken;

use crate::error::FleetError;
use crate::fleet::{FleetMap, HostInventory};
use crate::model::HypervisorRecord;
use crate::probe::{Probe, ProbeError};

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Record unreachable hosts and carry on instead of aborting.
    pub ignore_unreachable: bool,
    pub concurrency: usize,
    /// Applied to each probe attempt.
    pub timeout: Duration,
    /// Extra attempts for transient network failures.
    pub retries: u32,
    /// First retry delay; doubles on every further attempt.
    pub backoff: Duration,
    /// The host list is a subset of the configured fleet.
    pub partial: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            ignore_unreachable: false,
            concurrency: 8,
            timeout: Duration::from_secs(30),
            retries: 2,
            backoff: Duration::from_millis(500),
            partial: false,
        }
    }
}

/// A host that did not contribute to the map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostError {
    pub host: String,
    pub error: ProbeError,
}

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub map: FleetMap,
    pub errors: Vec<HostError>,
}

/// Progress hooks, called as probes start and finish.
pub trait ProbeObserver {
    fn probe_started(&self, _host: &str) {}
    fn probe_finished(&self, _host: &str, _result: &Result<HostInventory, ProbeError>) {}
}

impl ProbeObserver for () {}

/// Probe `hosts` and assemble a snapshot.
///
/// Unreachable hosts abort the build unless `ignore_unreachable` is set.
/// Other probe failures only exclude the failing host. Any excluded host
/// makes the map partial. Cancelling `cancel` drops every in-flight probe
/// and returns [`FleetError::Cancelled`].
pub async fn build<P, O>(
    probe: &P,
    hosts: &[HypervisorRecord],
    options: &BuildOptions,
    observer: &O,
    cancel: &CancellationToken,
) -> Result<BuildOutcome, FleetError>
where
    P: Probe,
    O: ProbeObserver + ?Sized,
{
    if hosts.is_empty() {
        return Err(FleetError::NoHosts);
    }

    let probes = stream::iter(hosts.iter().map(|host| async move {
        observer.probe_started(&host.name);
        let result = inspect_with_retry(probe, host, options).await;
        observer.probe_finished(&host.name, &result);
        (host, result)
    }))
    .buffer_unordered(options.concurrency.max(1));

    let collect = async {
        let mut probes = std::pin::pin!(probes);
        let mut inventories = Vec::new();
        let mut unreachable = Vec::new();
        let mut errors = Vec::new();

        while let Some((host, result)) = probes.next().await {
            match result {
                Ok(inventory) => {
                    tracing::debug!(host = %host.name, vms = inventory.vms.len(), "probed");
                    inventories.push(inventory);
                }
                Err(ProbeError::Unreachable { reason, .. }) if !options.ignore_unreachable => {
                    return Err(FleetError::Unreachable {
                        host: host.name.clone(),
                        reason,
                    });
                }
                Err(error) => {
                    tracing::warn!(host = %host.name, %error, "host excluded from fleet map");
                    if error.is_unreachable() {
                        unreachable.push(host.name.clone());
                    }
                    errors.push(HostError {
                        host: host.name.clone(),
                        error,
                    });
                }
            }
        }
        Ok((inventories, unreachable, errors))
    };

    let (inventories, unreachable, errors) = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(FleetError::Cancelled),
        collected = collect => collected?,
    };

    let partial = options.partial || !errors.is_empty();
    let map = FleetMap::assemble(inventories, unreachable, partial);
    for collision in map.collisions() {
        tracing::warn!(vm = %collision.name, hosts = ?collision.hosts, "name collision");
    }
    Ok(BuildOutcome { map, errors })
}

async fn inspect_with_retry<P: Probe>(
    probe: &P,
    host: &HypervisorRecord,
    options: &BuildOptions,
) -> Result<HostInventory, ProbeError> {
    let mut attempt = 0;
    loop {
        let result = match tokio::time::timeout(options.timeout, probe.inspect(host)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::timeout(&host.name)),
        };
        match result {
            Err(e) if e.is_transient() && attempt < options.retries => {
                let delay = options.backoff * 2u32.saturating_pow(attempt);
                tracing::info!(host = %host.name, attempt = attempt + 1, ?delay, error = %e, "retrying probe");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use crate::fleet::ActualVm;
    use crate::model::{Attributes, Credentials};

    fn record(name: &str) -> HypervisorRecord {
        HypervisorRecord {
            name: name.into(),
            address: format!("{name}.lab"),
            credentials: Credentials {
                user: "root".into(),
                identity: None,
                remote_command: "vmctl-remote".into(),
            },
            defaults: Attributes::new(),
        }
    }

    fn options() -> BuildOptions {
        BuildOptions {
            timeout: Duration::from_secs(5),
            backoff: Duration::from_millis(1),
            ..BuildOptions::default()
        }
    }

    /// Fails each host with the queued errors before answering.
    struct Flaky {
        failures: Mutex<BTreeMap<String, Vec<ProbeError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl Flaky {
        fn new(failures: Vec<(&str, ProbeError)>) -> Self {
            let mut map: BTreeMap<String, Vec<ProbeError>> = BTreeMap::new();
            for (host, err) in failures {
                map.entry(host.to_string()).or_default().push(err);
            }
            Self {
                failures: Mutex::new(map),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self, host: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|h| *h == host).count()
        }
    }

    impl Probe for Flaky {
        async fn inspect(&self, host: &HypervisorRecord) -> Result<HostInventory, ProbeError> {
            self.calls.lock().unwrap().push(host.name.clone());
            if let Some(queue) = self.failures.lock().unwrap().get_mut(&host.name) {
                if !queue.is_empty() {
                    return Err(queue.remove(0));
                }
            }
            let mut inv = HostInventory::new(&host.name);
            inv.vms.push(ActualVm::new(format!("vm-{}", host.name), &host.name));
            Ok(inv)
        }
    }

    fn network(host: &str) -> ProbeError {
        ProbeError::Unreachable {
            host: host.into(),
            reason: "connection reset".into(),
            transient: true,
        }
    }

    #[tokio::test]
    async fn zero_hosts_is_an_error() {
        let probe = Flaky::new(vec![]);
        let err = build(&probe, &[], &options(), &(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::NoHosts));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let probe = Flaky::new(vec![("esx1", network("esx1")), ("esx1", network("esx1"))]);
        let outcome = build(&probe, &[record("esx1")], &options(), &(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.errors.is_empty());
        assert_eq!(probe.calls("esx1"), 3);
        assert!(outcome.map.get("vm-esx1").is_some());
    }

    #[tokio::test]
    async fn auth_failures_are_not_retried() {
        let auth = ProbeError::Unreachable {
            host: "esx1".into(),
            reason: "authentication failed".into(),
            transient: false,
        };
        let probe = Flaky::new(vec![("esx1", auth)]);
        let opts = BuildOptions {
            ignore_unreachable: true,
            ..options()
        };
        let outcome = build(&probe, &[record("esx1"), record("esx2")], &opts, &(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(probe.calls("esx1"), 1);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.map.is_partial());
    }

    #[tokio::test]
    async fn unreachable_aborts_without_ignore_flag() {
        let opts = BuildOptions {
            retries: 0,
            ..options()
        };
        let probe = Flaky::new(vec![("esx2", network("esx2"))]);
        let err = build(&probe, &[record("esx1"), record("esx2")], &opts, &(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Unreachable { ref host, .. } if host == "esx2"));
    }

    #[tokio::test]
    async fn tool_missing_excludes_only_that_host() {
        let missing = ProbeError::ToolMissing {
            host: "esx2".into(),
            tool: "vmctl-remote".into(),
        };
        let probe = Flaky::new(vec![("esx2", missing)]);
        let outcome = build(&probe, &[record("esx1"), record("esx2")], &options(), &(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.map.inventory("esx1").is_some());
        assert!(outcome.map.inventory("esx2").is_none());
    }

    #[tokio::test]
    async fn cancelled_build_merges_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let probe = Flaky::new(vec![]);
        let err = build(&probe, &[record("esx1")], &options(), &(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Cancelled));
    }
}
