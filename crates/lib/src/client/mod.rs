//! Client-side optimistic mutation engine.
//!
//! A [`Client`] executes user-registered named mutator functions against its
//! [`LayeredCache`] immediately, tracks each successful execution as a
//! pending [`Op`], and replays all still-pending ops whenever authoritative
//! deltas arrive from the server ("rebase"). The engine is single-threaded
//! and callback driven: socket message handling, mutation execution, and
//! delta application all run synchronously relative to each other, and the
//! engine never reorders a client's own operations.
//!
//! # Failure semantics
//!
//! A mutator error during first-time execution rolls the cache back and
//! propagates to the caller; no event fires and the op is not recorded. The
//! same error during replay is caught, reported through the mutation-error
//! observers, and does not stop subsequent replays.

pub mod errors;
pub mod events;

use std::collections::HashMap;

pub use errors::ClientError;
pub use events::{Observers, Subscription};
use rand::Rng;
use serde_json::Value;
use tracing::{debug, warn};

use crate::Result;
use crate::cache::LayeredCache;
use crate::protocol::{ClientMsg, Delta, Op, OpId, ServerMsg};

/// Outgoing half of a bidirectional message channel, injected by the host.
///
/// The inbound half is the host feeding [`Client::handle_server_msg`].
pub trait ClientSocket: Send {
    fn send(&mut self, msg: &ClientMsg) -> Result<()>;
}

/// A named mutator: runs against the cache with the op's arguments.
pub type Mutator = Box<dyn Fn(&mut LayeredCache, &[Value]) -> Result<()> + Send + Sync>;

/// Ephemeral connection state, created on the server handshake and dropped
/// on disconnect.
#[derive(Debug, Clone)]
pub struct Session {
    /// Actor id assigned by the server.
    pub actor: u64,
    /// Opaque session resume key.
    pub session_key: String,
    /// Gates when pending ops may be (re)sent.
    pub caught_up: bool,
}

/// Event payload for a mutator failure during rebase/replay.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationError {
    pub op_id: OpId,
    pub name: String,
    pub reason: String,
}

/// The optimistic mutation engine.
///
/// The cache always has one long-lived transaction open holding speculative
/// local state; each mutation runs in a nested sub-transaction on top of it.
pub struct Client {
    cache: LayeredCache,
    mutations: HashMap<String, Mutator>,
    pending: Vec<Op>,
    session: Option<Session>,
    socket: Option<Box<dyn ClientSocket>>,
    /// Highest server clock this client has incorporated.
    last_clock: u64,
    /// Short base-26 key prefixing this client's op ids.
    client_key: String,
    next_seq: u64,
    on_change: Observers<()>,
    on_mutation_error: Observers<MutationError>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let client_key: String = (0..3).map(|_| rng.gen_range(b'A'..=b'Z') as char).collect();

        let mut cache = LayeredCache::new();
        // Speculative layer; authoritative state lives below it.
        cache.start_transaction();

        Client {
            cache,
            mutations: HashMap::new(),
            pending: Vec::new(),
            session: None,
            socket: None,
            last_clock: 0,
            client_key,
            next_seq: 1,
            on_change: Observers::new(),
            on_mutation_error: Observers::new(),
        }
    }

    /// Registers a named mutator. Names are validated at registration time;
    /// re-registering a name is an error.
    pub fn register_mutator(
        &mut self,
        name: impl Into<String>,
        mutator: impl Fn(&mut LayeredCache, &[Value]) -> Result<()> + Send + Sync + 'static,
    ) -> Result<()> {
        let name = name.into();
        if self.mutations.contains_key(&name) {
            return Err(ClientError::MutationAlreadyRegistered { name }.into());
        }
        self.mutations.insert(name, Box::new(mutator));
        Ok(())
    }

    /// Runs the named mutator optimistically.
    ///
    /// On success the sub-transaction commits, a fresh op id is assigned,
    /// and the op joins the pending set (sent immediately when the session
    /// is established and caught up). On error the sub-transaction rolls
    /// back and the error propagates; nothing is recorded and no event
    /// fires.
    pub fn mutate(&mut self, name: &str, args: Vec<Value>) -> Result<OpId> {
        let mutator = self
            .mutations
            .get(name)
            .ok_or_else(|| ClientError::UnknownMutation {
                name: name.to_string(),
            })?;

        self.cache.start_transaction();
        match mutator(&mut self.cache, &args) {
            Ok(()) => {
                self.cache.commit()?;
            }
            Err(err) => {
                self.cache.rollback()?;
                return Err(err);
            }
        }

        let op_id = self.next_op_id();
        let op = Op {
            id: op_id.clone(),
            name: name.to_string(),
            args,
        };
        self.pending.push(op.clone());
        if self.session.as_ref().is_some_and(|s| s.caught_up) {
            self.send_msg(&ClientMsg::Op { op });
        }
        self.on_change.emit(&());
        Ok(op_id)
    }

    /// Attaches to a message channel. Any previous session is discarded;
    /// the server must handshake again before anything else flows.
    pub fn connect(&mut self, socket: Box<dyn ClientSocket>) {
        self.session = None;
        self.socket = Some(socket);
    }

    /// Severs the session. Pending ops stay in memory and are replayed and
    /// resent after the next successful handshake and catch-up.
    pub fn disconnect(&mut self) {
        self.session = None;
        self.socket = None;
    }

    /// Feeds one inbound server message into the engine.
    ///
    /// Protocol violations (a handshake on an established session, or any
    /// other message before one) are fatal to the connection and surface as
    /// errors immediately.
    pub fn handle_server_msg(&mut self, msg: ServerMsg) -> Result<()> {
        match msg {
            ServerMsg::First {
                actor,
                session_key,
                server_clock,
            } => {
                if self.socket.is_none() {
                    return Err(ClientError::NotConnected.into());
                }
                if self.session.is_some() {
                    return Err(ClientError::ProtocolViolation {
                        reason: "unexpected handshake on an established session".to_string(),
                    }
                    .into());
                }
                let caught_up = self.last_clock >= server_clock;
                debug!(actor, server_clock, caught_up, "session established");
                self.session = Some(Session {
                    actor,
                    session_key,
                    caught_up,
                });
                if caught_up {
                    self.flush_pending();
                } else {
                    let since = self.last_clock;
                    self.send_msg(&ClientMsg::CatchUp { since });
                }
                Ok(())
            }
            ServerMsg::Delta {
                deltas,
                server_clock,
                full_cc,
                is_initial_sync,
            } => {
                if self.session.is_none() {
                    return Err(ClientError::ProtocolViolation {
                        reason: "delta received before session establishment".to_string(),
                    }
                    .into());
                }
                self.apply_deltas(&deltas, full_cc)?;
                self.last_clock = server_clock;
                if is_initial_sync {
                    if let Some(session) = self.session.as_mut() {
                        session.caught_up = true;
                    }
                    self.flush_pending();
                }
                Ok(())
            }
        }
    }

    /// Reconciles authoritative deltas into the cache and rebases pending
    /// ops on top of them.
    ///
    /// With `full = true` the cache is reset entirely (initial or catch-up
    /// sync); otherwise the speculative transaction is rolled back first.
    /// Deltas apply deletions before updates; a delta whose op id matches a
    /// pending op acknowledges it. Afterwards a fresh transaction opens and
    /// every still-pending op replays in original submission order.
    pub fn apply_deltas(&mut self, deltas: &[Delta], full: bool) -> Result<()> {
        if full {
            self.cache = LayeredCache::new();
        } else {
            self.cache.rollback()?;
        }

        for delta in deltas {
            for key in &delta.deleted {
                self.cache.delete(key);
            }
            for (key, value) in &delta.updated {
                self.cache.set(key.clone(), value.clone());
            }
            if let Some(op_id) = &delta.op_id {
                self.pending.retain(|op| &op.id != op_id);
            }
        }

        self.cache.start_transaction();

        let pending = self.pending.clone();
        let mut failures = Vec::new();
        for op in &pending {
            self.cache.start_transaction();
            let outcome = match self.mutations.get(&op.name) {
                Some(mutator) => mutator(&mut self.cache, &op.args),
                None => Err(ClientError::UnknownMutation {
                    name: op.name.clone(),
                }
                .into()),
            };
            match outcome {
                Ok(()) => self.cache.commit()?,
                Err(err) => {
                    self.cache.rollback()?;
                    warn!(op_id = %op.id, name = %op.name, %err, "replay failed");
                    failures.push(MutationError {
                        op_id: op.id.clone(),
                        name: op.name.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        for failure in &failures {
            self.on_mutation_error.emit(failure);
        }
        self.on_change.emit(&());
        Ok(())
    }

    /// The merged cache contents as a JSON object.
    pub fn data(&self) -> Value {
        self.cache.to_json()
    }

    /// Reads a single key through the cache layers.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.cache.get(key)
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn is_caught_up(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.caught_up)
    }

    /// Unacknowledged ops, in submission order.
    pub fn pending_ops(&self) -> &[Op] {
        &self.pending
    }

    pub fn last_clock(&self) -> u64 {
        self.last_clock
    }

    /// Subscribes to change notifications (fires after each successful
    /// mutation and after each delta application).
    pub fn on_change(&self, cb: impl Fn(&()) + Send + 'static) -> Subscription {
        self.on_change.subscribe(cb)
    }

    /// Subscribes to replay failures. First-time mutation failures do not
    /// fire here; they propagate from [`Client::mutate`] instead.
    pub fn on_mutation_error(&self, cb: impl Fn(&MutationError) + Send + 'static) -> Subscription {
        self.on_mutation_error.subscribe(cb)
    }

    fn next_op_id(&mut self) -> OpId {
        let id = OpId::new(format!("{}:{}", self.client_key, self.next_seq));
        self.next_seq += 1;
        id
    }

    fn flush_pending(&mut self) {
        for op in self.pending.clone() {
            self.send_msg(&ClientMsg::Op { op });
        }
    }

    /// Best-effort send. A failed send leaves the op pending; it will be
    /// flushed again once a session is caught up.
    fn send_msg(&mut self, msg: &ClientMsg) {
        if let Some(socket) = self.socket.as_mut()
            && let Err(err) = socket.send(msg)
        {
            warn!(%err, "socket send failed; message stays queued");
        }
    }
}
