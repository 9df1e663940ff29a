//! Task execution capabilities: the HTTP executor and the response
//! cache. Both are small traits assembled at composition time; the
//! orchestrator depends on the capability, never on a concrete client.

pub mod cache;
pub mod http;

pub use cache::{cache_key, CacheConfig, CacheProvider, CachedResponse, InMemoryCache};
pub use http::{HttpExecutor, HttpTaskRequest, HttpTaskResponse, ReqwestExecutor};
