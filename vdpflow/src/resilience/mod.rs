//! Backend resilience: circuit breakers, the health-checked router and
//! backoff schedules.

mod backoff;
mod breaker;
#[cfg(feature = "http")]
mod http;
mod router;

pub use backoff::{BackoffConfig, BackoffStrategy, JitterStrategy};
pub use breaker::{BreakerConfig, BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker};
#[cfg(feature = "http")]
pub use http::HttpBackend;
pub use router::{
    Backend, BackendConfig, ExtractionMetadata, ExtractionRequest, HealthCheckedRouter,
    RoutedResponse, RouterConfig,
};
