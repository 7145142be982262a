//! Connection pooling and circuit breaking

pub mod circuit;
pub mod connection;

pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState, CircuitStats};
pub use connection::{
    Connection, ConnectionPool, ConnectionStatus, PoolConfig, PoolError, PoolStats,
    PooledConnection,
};
