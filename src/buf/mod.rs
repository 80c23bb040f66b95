//! Byte storage used by connections and the response path.
//!
//! Everything here is reactor-thread-local and unsynchronized. Connections
//! expose their `ByteBuf`s directly so the application can parse and build
//! messages in place, the TLS pump keeps its record windows in `NetBuf`s,
//! and responses accumulate in a `BufChain` of pooled buffers so bodies are
//! written once and never copied again.

pub use self::byte::ByteBuf;
pub use self::chain::{BufChain, Inserter, StaleInsert};
pub use self::net::NetBuf;
pub use self::pool::{Pool, Pooled, Reset};

mod byte;
mod chain;
mod net;
mod pool;
