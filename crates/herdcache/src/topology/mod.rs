//! Discovery of the remote store's cluster topology.
//!
//! A [`ClusterTopologySource`] reports the current member hosts of the cluster, and the
//! [`ClusterConfigWatcher`] turns changes of that host set into new [`TopologyGeneration`]s,
//! swapping the active store of a [`BackendHandle`](crate::store::BackendHandle).

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, bail};
use futures::future::{BoxFuture, FutureExt};

mod watcher;

pub use watcher::{ClusterConfigWatcher, TickOutcome, WatcherHandle};

/// The port used for hosts that do not specify one.
pub const DEFAULT_PORT: u16 = 11211;

/// A member host of the remote store cluster.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostDescriptor {
    pub host: String,
    pub port: u16,
}

impl HostDescriptor {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for HostDescriptor {
    type Err = anyhow::Error;

    /// Parses `host`, `host:port` or `[ipv6]:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, rest) = rest
                .split_once(']')
                .with_context(|| format!("unterminated IPv6 address in `{s}`"))?;
            match rest.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if rest.is_empty() => (host, None),
                None => bail!("invalid host `{s}`"),
            }
        } else {
            match s.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (s, None),
            }
        };

        if host.is_empty() {
            bail!("missing host name in `{s}`");
        }
        let port = match port {
            Some(port) => port
                .parse()
                .with_context(|| format!("invalid port in `{s}`"))?,
            None => DEFAULT_PORT,
        };
        Ok(Self::new(host, port))
    }
}

/// Parses a comma separated list of hosts, like `cache-1:11211,cache-2`.
///
/// Hosts without a port use [`DEFAULT_PORT`].
pub fn parse_hosts(hosts: &str) -> anyhow::Result<Vec<HostDescriptor>> {
    let hosts = hosts
        .split(',')
        .map(str::trim)
        .filter(|host| !host.is_empty())
        .map(HostDescriptor::from_str)
        .collect::<anyhow::Result<Vec<_>>>()?;
    if hosts.is_empty() {
        bail!("no hosts configured");
    }
    Ok(hosts)
}

/// A versioned snapshot of the member hosts of the remote store cluster.
#[derive(Clone, Debug)]
pub struct TopologyGeneration {
    version: u64,
    hosts: Arc<[HostDescriptor]>,
}

impl TopologyGeneration {
    pub fn new(version: u64, hosts: Vec<HostDescriptor>) -> Self {
        Self {
            version,
            hosts: hosts.into(),
        }
    }

    /// The successor of this generation, with a new host set.
    pub fn next(&self, hosts: Vec<HostDescriptor>) -> Self {
        Self::new(self.version + 1, hosts)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn hosts(&self) -> &[HostDescriptor] {
        &self.hosts
    }

    /// Whether `hosts` contains the same hosts as this generation, in any order.
    pub fn same_hosts(&self, hosts: &[HostDescriptor]) -> bool {
        let ours: BTreeSet<_> = self.hosts.iter().collect();
        let theirs: BTreeSet<_> = hosts.iter().collect();
        ours == theirs
    }
}

impl fmt::Display for TopologyGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{} [", self.version)?;
        for (i, host) in self.hosts.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{host}")?;
        }
        f.write_str("]")
    }
}

/// Reports the current member hosts of the remote store cluster.
pub trait ClusterTopologySource: Send + Sync + 'static {
    fn poll(&self) -> BoxFuture<'_, anyhow::Result<Vec<HostDescriptor>>>;
}

/// Gets notified whenever the active backend was swapped for a new topology.
pub trait ClientClusterUpdateObserver: Send + Sync + 'static {
    fn topology_updated(&self, generation: &TopologyGeneration);
}

/// A [`ClusterTopologySource`] reporting a host list that can be replaced at runtime.
#[derive(Debug)]
pub struct StaticTopologySource {
    hosts: Mutex<Vec<HostDescriptor>>,
    failing: AtomicBool,
    polls: AtomicUsize,
}

impl StaticTopologySource {
    pub fn new(hosts: Vec<HostDescriptor>) -> Self {
        Self {
            hosts: Mutex::new(hosts),
            failing: AtomicBool::new(false),
            polls: AtomicUsize::new(0),
        }
    }

    /// Creates a source from a `host:port,host:port` list.
    pub fn parse(hosts: &str) -> anyhow::Result<Self> {
        Ok(Self::new(parse_hosts(hosts)?))
    }

    pub fn set_hosts(&self, hosts: Vec<HostDescriptor>) {
        *self.hosts.lock().unwrap_or_else(PoisonError::into_inner) = hosts;
    }

    /// Makes subsequent polls fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// The number of polls so far.
    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::Relaxed)
    }
}

impl ClusterTopologySource for StaticTopologySource {
    fn poll(&self) -> BoxFuture<'_, anyhow::Result<Vec<HostDescriptor>>> {
        self.polls.fetch_add(1, Ordering::Relaxed);
        let result = if self.failing.load(Ordering::Relaxed) {
            Err(anyhow::anyhow!("topology source is unreachable"))
        } else {
            Ok(self
                .hosts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone())
        };
        futures::future::ready(result).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hosts() {
        let hosts = parse_hosts("cache-1:11212, cache-2 ,[::1]:11213,,").unwrap();
        assert_eq!(
            hosts,
            vec![
                HostDescriptor::new("cache-1", 11212),
                HostDescriptor::new("cache-2", DEFAULT_PORT),
                HostDescriptor::new("::1", 11213),
            ]
        );
        assert_eq!(hosts[2].to_string(), "[::1]:11213");
    }

    #[test]
    fn test_parse_hosts_errors() {
        assert!(parse_hosts("").is_err());
        assert!(parse_hosts(" , ").is_err());
        assert!(parse_hosts("cache-1:eleven").is_err());
        assert!(parse_hosts(":11211").is_err());
        assert!(parse_hosts("[::1").is_err());
    }

    #[test]
    fn test_same_hosts_ignores_order() {
        let generation = TopologyGeneration::new(
            3,
            vec![HostDescriptor::new("a", 1), HostDescriptor::new("b", 2)],
        );
        assert!(generation.same_hosts(&[HostDescriptor::new("b", 2), HostDescriptor::new("a", 1)]));
        assert!(!generation.same_hosts(&[HostDescriptor::new("a", 1)]));
        assert!(!generation.same_hosts(&[HostDescriptor::new("a", 1), HostDescriptor::new("b", 3)]));

        let next = generation.next(vec![HostDescriptor::new("c", 3)]);
        assert_eq!(next.version(), 4);
        assert_eq!(next.to_string(), "v4 [c:3]");
    }

    #[tokio::test]
    async fn test_static_source() {
        let source = StaticTopologySource::parse("a:1").unwrap();
        assert_eq!(source.poll().await.unwrap(), vec![HostDescriptor::new("a", 1)]);

        source.set_failing(true);
        assert!(source.poll().await.is_err());
        assert_eq!(source.poll_count(), 2);
    }
}
