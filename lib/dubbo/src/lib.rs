//! A Dubbo RPC client: Hessian-serialized calls over pooled, multiplexed TCP
//! connections, with provider discovery and weighted routing driven by a
//! coordination service.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod logging;
pub mod pool;
pub mod registry;
pub mod util;

mod connection;

pub use crate::client::DubboClient;
pub use crate::codec::RpcRequest;
pub use crate::config::ClientConfig;
pub use crate::error::{DubboError, DubboResult};
pub use crate::pool::ConnectionPool;
pub use crate::registry::{NamingService, Registry, WatchHandler};

pub use hessian2::{Object, Value};
