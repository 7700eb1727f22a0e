//! The snowcast engine: everything between the operator REPL and the wire.
//!
//! A single poller thread observes readiness on the listening socket and on
//! every connected client, dispatching control-plane work to a fixed pool of
//! workers, while each station runs its own pacer thread broadcasting song
//! chunks over UDP on a fixed cadence.

pub mod client;
pub mod poller;
pub mod pool;
pub mod proto;
pub mod server;
pub mod station;
