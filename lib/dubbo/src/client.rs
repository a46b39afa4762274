use crate::codec::RpcRequest;
use crate::error::DubboResult;
use crate::logging::{self, Logger};
use crate::pool::ConnectionPool;
use crate::registry::Registry;
use hessian2::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_SERVICE_VERSION: &str = "1.0.0";
const DEFAULT_DUBBO_VERSION: &str = "2.4.10";

enum Target {
    /// A fixed `host:port`, bypassing discovery.
    Direct(String),
    /// Resolve a provider per call through the registry.
    Registry(Arc<Registry>),
}

/// Client for one remote interface. Cheap to construct; the pool it shares
/// carries all connection state, so many clients can ride one pool.
pub struct DubboClient {
    interface: String,
    version: String,
    dubbo_version: String,
    pool: Arc<ConnectionPool>,
    target: Target,
    log: Logger,
}

impl DubboClient {
    /// A client that always talks to `host` directly.
    pub fn direct<'a, I, H, L>(interface: I, host: H, pool: Arc<ConnectionPool>, log: L) -> DubboClient
    where
        I: Into<String>,
        H: Into<String>,
        L: Into<Option<&'a Logger>>,
    {
        DubboClient::new(interface, Target::Direct(host.into()), pool, log)
    }

    /// A client that resolves providers through the registry.
    pub fn with_registry<'a, I, L>(
        interface: I,
        registry: Arc<Registry>,
        pool: Arc<ConnectionPool>,
        log: L,
    ) -> DubboClient
    where
        I: Into<String>,
        L: Into<Option<&'a Logger>>,
    {
        DubboClient::new(interface, Target::Registry(registry), pool, log)
    }

    fn new<'a, I, L>(interface: I, target: Target, pool: Arc<ConnectionPool>, log: L) -> DubboClient
    where
        I: Into<String>,
        L: Into<Option<&'a Logger>>,
    {
        let interface = interface.into();
        let log = logging::child(log);
        logging::debug!(log, "client created"; "interface" => &interface);
        DubboClient {
            interface,
            version: DEFAULT_SERVICE_VERSION.to_string(),
            dubbo_version: DEFAULT_DUBBO_VERSION.to_string(),
            pool,
            target,
            log,
        }
    }

    /// Overrides the service version (default `1.0.0`).
    pub fn service_version<S: Into<String>>(mut self, version: S) -> DubboClient {
        self.version = version.into();
        self
    }

    /// Overrides the advertised protocol version (default `2.4.10`).
    pub fn dubbo_version<S: Into<String>>(mut self, version: S) -> DubboClient {
        self.dubbo_version = version.into();
        self
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Invokes `method` with the given arguments and waits for the reply,
    /// bounded by `timeout` when one is given.
    pub fn call(
        &self,
        method: &str,
        arguments: Vec<Value>,
        timeout: Option<Duration>,
    ) -> DubboResult<Value> {
        let host = match &self.target {
            Target::Direct(host) => host.clone(),
            Target::Registry(registry) => registry.get_provider_host(&self.interface)?,
        };

        let request = RpcRequest {
            dubbo_version: self.dubbo_version.clone(),
            path: self.interface.clone(),
            version: self.version.clone(),
            method: method.to_string(),
            arguments,
        };

        logging::debug!(self.log, "call started";
                        "host" => &host, "method" => method, "timeout" => ?timeout);
        let started = Instant::now();
        let result = self.pool.call(&host, &request, timeout);
        let cost_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => {
                logging::debug!(self.log, "call finished";
                                "host" => &host, "method" => method, "cost_ms" => cost_ms);
            }
            Err(error) => {
                logging::debug!(self.log, "call failed";
                                "host" => &host,
                                "method" => method,
                                "cost_ms" => cost_ms,
                                "error" => %error);
            }
        }
        result
    }
}
