//! The readiness loop. One dedicated thread waits until no control-plane
//! job is in flight, snapshots readiness across the listener and every
//! client socket, then dispatches work: a single inline accept for the
//! listener, one queued job per ready client. Because the poller is the
//! sole author of registry-mutating jobs and waits them all out before the
//! next readiness call, the descriptor set it hands to the operating system
//! is never mutated concurrently, which is why the blocking wait itself
//! does not need to pin the registry lock.

use crate::client::{Client, LISTENER_TOKEN, WAKE_TOKEN};
use crate::server;
use crate::server::ServerContext;
use frost::logging;
use mio::{Events, Token};
use std::sync::Arc;

pub fn run(ctx: Arc<ServerContext>) {
    let mut events = Events::with_capacity(256);
    let mut ready: Vec<Arc<Client>> = Vec::new();

    loop {
        {
            let mut registry = ctx.clients.lock();
            ctx.clients.wait_quiescent(&mut registry);
            if ctx.is_stopped() {
                break;
            }
            registry.maybe_shrink();
        }

        // No job is outstanding and only jobs mutate the registry, so the
        // descriptor set is frozen for the duration of the wait.
        if let Err(err) = ctx.poll.poll(&mut events, None) {
            logging::error!(ctx.log, "readiness poll failed"; "error" => %err);
            continue;
        }
        if ctx.is_stopped() {
            break;
        }

        let mut accept_pending = false;

        {
            let mut registry = ctx.clients.lock();

            // Resolve every ready slot to its client before any job can
            // run; jobs are dispatched against the records, not the
            // indices, so later swap-removals cannot misdirect them.
            ready.clear();
            for event in &events {
                match event.token() {
                    WAKE_TOKEN => (),
                    LISTENER_TOKEN => accept_pending = true,
                    Token(slot) => {
                        if let Some(client) = registry.get(slot - 1) {
                            ready.push(client.clone());
                        }
                    }
                }
            }

            let units = ready.len() + accept_pending as usize;
            registry.begin_jobs(units);
        }

        if accept_pending {
            let _ticket = server::JobTicket::new(ctx.clone());
            server::accept_and_handshake(&ctx);
        }

        for client in ready.drain(..) {
            let job_ctx = ctx.clone();
            let ticket = server::JobTicket::new(ctx.clone());
            ctx.pool.add_job(move || {
                let _ticket = ticket;
                server::handle_request(&job_ctx, &client);
            });
        }
    }

    logging::debug!(ctx.log, "poller exiting");
}
