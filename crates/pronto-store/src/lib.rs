//! State backends for the realtime core: buffered request state, one-time
//! auth tickets, provider result cache and advisory job locks.

pub mod cache;
pub mod error;
pub mod locks;
pub mod request_state;
pub mod tickets;

pub use cache::{cache_key, MemoryProviderCache, ProviderCache};
pub use error::StoreError;
pub use locks::{lock_key, JobLocks, MemoryJobLocks};
pub use request_state::{JobOwner, JobOwners, RequestStateStore};
pub use tickets::{
    mint_ticket, ticket_key, IssuedTicket, MemoryTicketStore, RedisTicketStore, TicketRecord,
    TicketStore, DEFAULT_TICKET_TTL,
};
