//! Provider discovery over a hierarchical coordination service. The service
//! itself is reached through the `NamingService` contract; this module keeps
//! the provider/weight caches live, registers the process as an ephemeral
//! consumer, and routes calls with weighted random selection.

use crate::error::{DubboError, DubboResult};
use crate::logging::{self, Logger};
use crate::util;
use hashbrown::HashMap;
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use url::Url;

const DEFAULT_WEIGHT: i64 = 100;

/// Callback fired when a watched node's children change. Watches are
/// single-shot: the handler must re-subscribe if it wants to keep watching,
/// and must be reentrancy-safe because the service may invoke it from its
/// own thread.
pub type WatchHandler = Box<dyn Fn(&str) + Send + Sync>;

/// The slice of a coordination service (hierarchical key-value store with
/// ephemeral nodes and child watches) this client needs.
///
/// `children` on a path that does not exist returns an empty list, not an
/// error.
pub trait NamingService: Send + Sync {
    fn children(&self, path: &str, watch: Option<WatchHandler>) -> DubboResult<Vec<String>>;
    fn ensure_path(&self, path: &str) -> DubboResult<()>;
    fn create_ephemeral(&self, path: &str) -> DubboResult<()>;
    fn close(&self) {}
}

fn providers_path(interface: &str) -> String {
    format!("/dubbo/{}/providers", interface)
}

fn consumers_path(interface: &str) -> String {
    format!("/dubbo/{}/consumers", interface)
}

fn configurators_path(interface: &str) -> String {
    format!("/dubbo/{}/configurators", interface)
}

/// A provider advertisement, parsed out of a URL-encoded child node.
#[derive(Debug, Clone)]
struct ProviderUrl {
    scheme: String,
    host: String,
    path: String,
    fields: HashMap<String, String>,
}

fn parse_url(child: &str) -> Option<ProviderUrl> {
    let decoded = percent_decode_str(child).decode_utf8().ok()?;
    let url = Url::parse(&decoded).ok()?;
    let host = format!("{}:{}", url.host_str()?, url.port()?);
    let fields = url
        .query_pairs()
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    Some(ProviderUrl {
        scheme: url.scheme().to_string(),
        host,
        path: url.path().to_string(),
        fields,
    })
}

struct Inner {
    naming: Arc<dyn NamingService>,
    application: String,
    /// interface → host list, replaced whole on every watch fire.
    providers: Mutex<HashMap<String, Arc<Vec<String>>>>,
    /// interface → host → weight, replaced whole on every watch fire.
    weights: Mutex<HashMap<String, Arc<HashMap<String, i64>>>>,
    /// Serializes first-time interface loads.
    load_lock: Mutex<()>,
    log: Logger,
}

/// Registry client: resolves an interface to a provider host, keeping the
/// cached host list and weights current through re-arming watches.
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    pub fn new<'a, S, L>(naming: Arc<dyn NamingService>, application_name: S, log: L) -> Registry
    where
        S: Into<String>,
        L: Into<Option<&'a Logger>>,
    {
        Registry {
            inner: Arc::new(Inner {
                naming,
                application: application_name.into(),
                providers: Mutex::new(HashMap::new()),
                weights: Mutex::new(HashMap::new()),
                load_lock: Mutex::new(()),
                log: logging::child(log),
            }),
        }
    }

    /// Picks a provider host for the interface, loading and caching the
    /// provider list on first use.
    pub fn get_provider_host(&self, interface: &str) -> DubboResult<String> {
        let loaded = self
            .inner
            .providers
            .lock()
            .unwrap()
            .contains_key(interface);
        if !loaded {
            let _guard = self.inner.load_lock.lock().unwrap();
            if !self
                .inner
                .providers
                .lock()
                .unwrap()
                .contains_key(interface)
            {
                Inner::load_providers(&self.inner, interface)?;
                Inner::load_configurators(&self.inner, interface);
            }
        }
        self.inner.select(interface)
    }

    pub fn close(&self) {
        self.inner.naming.close();
    }
}

impl Inner {
    /// First-time load: list providers, install the child watch, register
    /// this process as a consumer. Fails when no `dubbo://` provider exists.
    fn load_providers(inner: &Arc<Inner>, interface: &str) -> DubboResult<()> {
        let path = providers_path(interface);
        let children = inner
            .naming
            .children(&path, Some(Self::provider_watch(inner, interface)))?;
        let providers: Vec<ProviderUrl> = children
            .iter()
            .filter_map(|child| parse_url(child))
            .filter(|provider| provider.scheme == "dubbo")
            .collect();
        if providers.is_empty() {
            return Err(DubboError::Registry(format!(
                "no providers for interface {}",
                interface
            )));
        }

        if let Err(error) = inner.register_consumer(interface, &providers[0]) {
            // Registration is advisory; discovery still works without it.
            logging::warn!(inner.log, "consumer registration failed";
                           "interface" => interface, "error" => %error);
        }

        let hosts: Vec<String> = providers.into_iter().map(|p| p.host).collect();
        logging::debug!(inner.log, "providers loaded";
                        "interface" => interface, "hosts" => ?hosts);
        inner
            .providers
            .lock()
            .unwrap()
            .insert(interface.to_string(), Arc::new(hosts));
        Ok(())
    }

    fn provider_watch(inner: &Arc<Inner>, interface: &str) -> WatchHandler {
        let weak = Arc::downgrade(inner);
        let interface = interface.to_string();
        Box::new(move |_path| {
            if let Some(inner) = weak.upgrade() {
                Inner::reload_providers(&inner, &interface);
            }
        })
    }

    /// Watch fire: re-list, replace the snapshot, re-arm. An empty list is
    /// installed as-is, so later lookups fail with *no providers*.
    fn reload_providers(inner: &Arc<Inner>, interface: &str) {
        let path = providers_path(interface);
        let children = match inner
            .naming
            .children(&path, Some(Self::provider_watch(inner, interface)))
        {
            Ok(children) => children,
            Err(error) => {
                logging::warn!(inner.log, "provider re-list failed";
                               "interface" => interface, "error" => %error);
                return;
            }
        };
        let hosts: Vec<String> = children
            .iter()
            .filter_map(|child| parse_url(child))
            .filter(|provider| provider.scheme == "dubbo")
            .map(|provider| provider.host)
            .collect();
        logging::debug!(inner.log, "providers replaced";
                        "interface" => interface, "hosts" => ?hosts);
        inner
            .providers
            .lock()
            .unwrap()
            .insert(interface.to_string(), Arc::new(hosts));
    }

    /// Reads configured weights, watching for changes. A missing or empty
    /// configurators node simply leaves every host at the default weight.
    fn load_configurators(inner: &Arc<Inner>, interface: &str) {
        let path = configurators_path(interface);
        let children = match inner
            .naming
            .children(&path, Some(Self::configurator_watch(inner, interface)))
        {
            Ok(children) => children,
            Err(error) => {
                logging::warn!(inner.log, "configurator list failed";
                               "interface" => interface, "error" => %error);
                return;
            }
        };
        if !children.is_empty() {
            Self::install_weights(inner, interface, &children);
        }
    }

    fn configurator_watch(inner: &Arc<Inner>, interface: &str) -> WatchHandler {
        let weak = Arc::downgrade(inner);
        let interface = interface.to_string();
        Box::new(move |_path| {
            if let Some(inner) = weak.upgrade() {
                let path = configurators_path(&interface);
                match inner
                    .naming
                    .children(&path, Some(Self::configurator_watch(&inner, &interface)))
                {
                    Ok(children) => Self::install_weights(&inner, &interface, &children),
                    Err(error) => {
                        logging::warn!(inner.log, "configurator re-list failed";
                                       "interface" => &interface, "error" => %error);
                    }
                }
            }
        })
    }

    fn install_weights(inner: &Arc<Inner>, interface: &str, children: &[String]) {
        let mut weights = HashMap::new();
        for child in children {
            if let Some(configurator) = parse_url(child) {
                let weight = configurator
                    .fields
                    .get("weight")
                    .and_then(|value| value.parse::<i64>().ok())
                    .unwrap_or(DEFAULT_WEIGHT);
                weights.insert(configurator.host, weight);
            }
        }
        logging::debug!(inner.log, "weights replaced";
                        "interface" => interface, "weights" => ?weights);
        inner
            .weights
            .lock()
            .unwrap()
            .insert(interface.to_string(), Arc::new(weights));
    }

    /// Writes this process under `/dubbo/<interface>/consumers` as an
    /// ephemeral `consumer://` URL whose query fields are sorted by key.
    fn register_consumer(&self, interface: &str, provider: &ProviderUrl) -> DubboResult<()> {
        let echo = |key: &str| provider.fields.get(key).cloned().unwrap_or_default();
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or(0);

        let mut fields = vec![
            ("application".to_string(), self.application.clone()),
            ("category".to_string(), "consumers".to_string()),
            ("check".to_string(), "false".to_string()),
            ("connected".to_string(), "true".to_string()),
            ("dubbo".to_string(), echo("dubbo")),
            ("interface".to_string(), echo("interface")),
            ("methods".to_string(), echo("methods")),
            ("pid".to_string(), util::pid().to_string()),
            ("revision".to_string(), echo("revision")),
            ("side".to_string(), "consumer".to_string()),
            ("timestamp".to_string(), timestamp.to_string()),
            ("version".to_string(), echo("version")),
        ];
        fields.sort_by(|a, b| a.0.cmp(&b.0));

        let query = fields
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect::<Vec<_>>()
            .join("&");
        let consumer = format!(
            "consumer://{}{}?{}",
            util::local_ip(),
            provider.path,
            query
        );

        let base = consumers_path(interface);
        self.naming.ensure_path(&base)?;
        let node = format!(
            "{}/{}",
            base,
            utf8_percent_encode(&consumer, NON_ALPHANUMERIC)
        );
        logging::debug!(self.log, "consumer registered"; "node" => &node);
        self.naming.create_ephemeral(&node)
    }

    /// Weighted random selection: one uniform draw over the prefix sum of
    /// per-host weights (default 100, negatives clamped to zero). Without
    /// weights the draw is uniform over the hosts.
    fn select(&self, interface: &str) -> DubboResult<String> {
        let hosts = self
            .providers
            .lock()
            .unwrap()
            .get(interface)
            .cloned()
            .ok_or_else(|| {
                DubboError::Registry(format!("no providers for interface {}", interface))
            })?;
        if hosts.is_empty() {
            return Err(DubboError::Registry(format!(
                "no providers for interface {}",
                interface
            )));
        }

        let weights = self.weights.lock().unwrap().get(interface).cloned();
        let mut rng = rand::thread_rng();

        let weights = match weights.filter(|weights| !weights.is_empty()) {
            Some(weights) => weights,
            None => return Ok(hosts[rng.gen_range(0..hosts.len())].clone()),
        };

        let per_host: Vec<i64> = hosts
            .iter()
            .map(|host| weights.get(host).copied().unwrap_or(DEFAULT_WEIGHT).max(0))
            .collect();
        let total: i64 = per_host.iter().sum();
        if total <= 0 {
            return Ok(hosts[rng.gen_range(0..hosts.len())].clone());
        }

        let hit = rng.gen_range(0..total);
        let mut cumulative = 0;
        for (host, weight) in hosts.iter().zip(per_host) {
            cumulative += weight;
            if hit < cumulative {
                return Ok(host.clone());
            }
        }
        Err(DubboError::Registry(format!(
            "weighted routing failed for interface {}",
            interface
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// An in-memory stand-in for the coordination service: children lists
    /// per path, single-shot watches, recorded ephemeral creations.
    #[derive(Default)]
    struct MemoryNaming {
        nodes: Mutex<HashMap<String, Vec<String>>>,
        watches: Mutex<HashMap<String, Vec<WatchHandler>>>,
        ephemerals: Mutex<Vec<String>>,
    }

    impl MemoryNaming {
        fn set_children(&self, path: &str, children: &[&str]) {
            self.nodes.lock().unwrap().insert(
                path.to_string(),
                children.iter().map(|child| child.to_string()).collect(),
            );
        }

        /// Fires and removes the watches for a path, the way a single-shot
        /// service watch behaves.
        fn fire(&self, path: &str) {
            let handlers = self.watches.lock().unwrap().remove(path);
            for handler in handlers.unwrap_or_default() {
                handler(path);
            }
        }
    }

    impl NamingService for MemoryNaming {
        fn children(&self, path: &str, watch: Option<WatchHandler>) -> DubboResult<Vec<String>> {
            if let Some(watch) = watch {
                self.watches
                    .lock()
                    .unwrap()
                    .entry(path.to_string())
                    .or_default()
                    .push(watch);
            }
            Ok(self
                .nodes
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .unwrap_or_default())
        }

        fn ensure_path(&self, path: &str) -> DubboResult<()> {
            self.nodes
                .lock()
                .unwrap()
                .entry(path.to_string())
                .or_default();
            Ok(())
        }

        fn create_ephemeral(&self, path: &str) -> DubboResult<()> {
            self.ephemerals.lock().unwrap().push(path.to_string());
            Ok(())
        }
    }

    const INTERFACE: &str = "me.hourui.echo.provider.Echo";

    fn provider_url(host: &str) -> String {
        let url = format!(
            "dubbo://{}/{}?dubbo=2.4.10&interface={}&methods=echo&revision=1.0.0&version=1.0.0",
            host, INTERFACE, INTERFACE
        );
        utf8_percent_encode(&url, NON_ALPHANUMERIC).to_string()
    }

    fn override_url(host: &str, weight: i64) -> String {
        let url = format!("override://{}/?weight={}", host, weight);
        utf8_percent_encode(&url, NON_ALPHANUMERIC).to_string()
    }

    fn registry_with(naming: Arc<MemoryNaming>) -> Registry {
        Registry::new(naming, "search_platform", None)
    }

    #[test]
    fn test_no_providers_is_an_error() {
        let naming = Arc::new(MemoryNaming::default());
        let registry = registry_with(naming);
        assert!(matches!(
            registry.get_provider_host(INTERFACE),
            Err(DubboError::Registry(_))
        ));
    }

    #[test]
    fn test_non_dubbo_schemes_are_filtered() {
        let naming = Arc::new(MemoryNaming::default());
        naming.set_children(
            &providers_path(INTERFACE),
            &[&utf8_percent_encode(
                "jsonrpc://10.0.0.1:8080/x?interface=x",
                NON_ALPHANUMERIC,
            )
            .to_string()],
        );
        let registry = registry_with(naming);
        assert!(registry.get_provider_host(INTERFACE).is_err());
    }

    #[test]
    fn test_lookup_registers_consumer() {
        let naming = Arc::new(MemoryNaming::default());
        naming.set_children(&providers_path(INTERFACE), &[&provider_url("10.0.0.1:20880")]);

        let registry = registry_with(naming.clone());
        let host = registry.get_provider_host(INTERFACE).unwrap();
        assert_eq!(host, "10.0.0.1:20880");

        let ephemerals = naming.ephemerals.lock().unwrap();
        assert_eq!(ephemerals.len(), 1);
        let node = &ephemerals[0];
        assert!(node.starts_with(&format!("{}/", consumers_path(INTERFACE))));

        let encoded = node.rsplit('/').next().unwrap();
        let consumer = percent_decode_str(encoded).decode_utf8().unwrap();
        assert!(consumer.starts_with("consumer://"));
        assert!(consumer.contains("application=search_platform"));
        assert!(consumer.contains("category=consumers"));
        assert!(consumer.contains("check=false"));
        assert!(consumer.contains("side=consumer"));
        assert!(consumer.contains(&format!("interface={}", INTERFACE)));

        // Query fields must come out sorted by key.
        let query = consumer.split('?').nth(1).unwrap().to_string();
        let keys: Vec<&str> = query
            .split('&')
            .map(|pair| pair.split('=').next().unwrap())
            .collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_zero_weight_host_is_never_chosen() {
        let naming = Arc::new(MemoryNaming::default());
        naming.set_children(
            &providers_path(INTERFACE),
            &[
                &provider_url("10.0.0.1:20880"),
                &provider_url("10.0.0.2:20880"),
            ],
        );
        naming.set_children(
            &configurators_path(INTERFACE),
            &[
                &override_url("10.0.0.1:20880", 100),
                &override_url("10.0.0.2:20880", 0),
            ],
        );

        let registry = registry_with(naming);
        for _ in 0..200 {
            assert_eq!(
                registry.get_provider_host(INTERFACE).unwrap(),
                "10.0.0.1:20880"
            );
        }
    }

    #[test]
    fn test_weighted_ratio_is_roughly_proportional() {
        let naming = Arc::new(MemoryNaming::default());
        naming.set_children(
            &providers_path(INTERFACE),
            &[
                &provider_url("10.0.0.1:20880"),
                &provider_url("10.0.0.2:20880"),
            ],
        );
        naming.set_children(
            &configurators_path(INTERFACE),
            &[
                &override_url("10.0.0.1:20880", 100),
                &override_url("10.0.0.2:20880", 300),
            ],
        );

        let registry = registry_with(naming);
        let draws = 4000;
        let mut first = 0;
        for _ in 0..draws {
            if registry.get_provider_host(INTERFACE).unwrap() == "10.0.0.1:20880" {
                first += 1;
            }
        }
        // Expect about a quarter of the draws; allow a generous band.
        assert!(first > 700 && first < 1300, "first host drew {}", first);
    }

    #[test]
    fn test_uniform_selection_without_weights() {
        let naming = Arc::new(MemoryNaming::default());
        naming.set_children(
            &providers_path(INTERFACE),
            &[
                &provider_url("10.0.0.1:20880"),
                &provider_url("10.0.0.2:20880"),
            ],
        );

        let registry = registry_with(naming);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(registry.get_provider_host(INTERFACE).unwrap());
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_watch_replaces_provider_snapshot_and_rearms() {
        let naming = Arc::new(MemoryNaming::default());
        let path = providers_path(INTERFACE);
        naming.set_children(&path, &[&provider_url("10.0.0.1:20880")]);

        let registry = registry_with(naming.clone());
        assert_eq!(
            registry.get_provider_host(INTERFACE).unwrap(),
            "10.0.0.1:20880"
        );

        naming.set_children(&path, &[&provider_url("10.0.0.9:20880")]);
        naming.fire(&path);
        assert_eq!(
            registry.get_provider_host(INTERFACE).unwrap(),
            "10.0.0.9:20880"
        );

        // The handler re-subscribed, so a second fire must work too.
        naming.set_children(&path, &[&provider_url("10.0.0.7:20880")]);
        naming.fire(&path);
        assert_eq!(
            registry.get_provider_host(INTERFACE).unwrap(),
            "10.0.0.7:20880"
        );
    }

    #[test]
    fn test_providers_emptied_by_watch_fail_lookups() {
        let naming = Arc::new(MemoryNaming::default());
        let path = providers_path(INTERFACE);
        naming.set_children(&path, &[&provider_url("10.0.0.1:20880")]);

        let registry = registry_with(naming.clone());
        registry.get_provider_host(INTERFACE).unwrap();

        naming.set_children(&path, &[]);
        naming.fire(&path);
        assert!(matches!(
            registry.get_provider_host(INTERFACE),
            Err(DubboError::Registry(_))
        ));
    }

    #[test]
    fn test_configurator_deletion_resets_to_uniform() {
        let naming = Arc::new(MemoryNaming::default());
        naming.set_children(
            &providers_path(INTERFACE),
            &[
                &provider_url("10.0.0.1:20880"),
                &provider_url("10.0.0.2:20880"),
            ],
        );
        let conf_path = configurators_path(INTERFACE);
        naming.set_children(
            &conf_path,
            &[
                &override_url("10.0.0.1:20880", 100),
                &override_url("10.0.0.2:20880", 0),
            ],
        );

        let registry = registry_with(naming.clone());
        for _ in 0..50 {
            assert_eq!(
                registry.get_provider_host(INTERFACE).unwrap(),
                "10.0.0.1:20880"
            );
        }

        // Configurators deleted: the snapshot is replaced by an empty map
        // and selection falls back to uniform.
        naming.set_children(&conf_path, &[]);
        naming.fire(&conf_path);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(registry.get_provider_host(INTERFACE).unwrap());
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_negative_weights_are_clamped() {
        let naming = Arc::new(MemoryNaming::default());
        naming.set_children(
            &providers_path(INTERFACE),
            &[
                &provider_url("10.0.0.1:20880"),
                &provider_url("10.0.0.2:20880"),
            ],
        );
        naming.set_children(
            &configurators_path(INTERFACE),
            &[
                &override_url("10.0.0.1:20880", -50),
                &override_url("10.0.0.2:20880", 100),
            ],
        );

        let registry = registry_with(naming);
        for _ in 0..200 {
            assert_eq!(
                registry.get_provider_host(INTERFACE).unwrap(),
                "10.0.0.2:20880"
            );
        }
    }
}
