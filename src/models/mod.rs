pub mod metric;
pub mod proxy;

pub use metric::{DailyAggregate, RequestMetric};
pub use proxy::{PoolEntry, Proxy, ProxyScheme, ProxyStatus};
