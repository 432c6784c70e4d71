//! Fan-out Broadcaster
//!
//! Delivers tick batches to every interested client session.
//!
//! # Architecture
//!
//! The broadcaster owns the [`SubscriptionRegistry`], the [`TickCache`]
//! and the per-client outbound queues behind a single lock. Ingesting a
//! batch, subscribing and disconnecting all take that lock, which gives
//! three guarantees:
//!
//! - the registry and the connector's desired set change together
//! - a tick reaches a new subscriber either as its cached snapshot or as a
//!   live push, never both
//! - per-instrument order is the upstream arrival order
//!
//! Interest pinned through the admin HTTP API is held in the same registry
//! under [`ADMIN_CLIENT`], an owner with no session and no queue.
//!
//! Each client has a bounded queue drained by its own session task.
//! Delivery uses `try_send`; a client whose queue is full or whose
//! receiver is gone is disconnected on the spot.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{FeedControl, TickSink};
use crate::domain::cache::TickCache;
use crate::domain::streaming::{InstrumentToken, Tick, TickBatch};
use crate::domain::subscription::{ClientId, SubscriptionRegistry, TokenDelta};
use crate::infrastructure::config::{ClientSettings, InstrumentDirectory};
use crate::infrastructure::metrics::{self, ShedReason};
use crate::infrastructure::protocol::{ServerMessage, TickPayload};

/// Registry owner for tokens pinned through the admin API.
///
/// Session ids start at 1, so this never names a live client.
pub const ADMIN_CLIENT: ClientId = 0;

// =============================================================================
// Errors
// =============================================================================

/// Errors returned to the session layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    /// The request was malformed; nothing was changed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The client is gone or could not keep up and has been disconnected.
    #[error("client {0} is unreachable")]
    ClientUnreachable(ClientId),
}

// =============================================================================
// Client Session
// =============================================================================

/// Receiving half of a client registration, owned by the session task.
#[derive(Debug)]
pub struct ClientSession {
    /// Identifier used for every later call.
    pub id: ClientId,
    /// Messages to write to the socket, in order.
    pub outbound: mpsc::Receiver<ServerMessage>,
    /// Cancelled when the broadcaster drops the client.
    pub closed: CancellationToken,
}

#[derive(Debug)]
struct SessionHandle {
    tx: mpsc::Sender<ServerMessage>,
    closed: CancellationToken,
}

impl SessionHandle {
    fn enqueue(&self, message: ServerMessage) -> Result<(), ShedReason> {
        self.tx.try_send(message).map_err(|err| match err {
            TrySendError::Full(_) => ShedReason::QueueFull,
            TrySendError::Closed(_) => ShedReason::Closed,
        })
    }
}

#[derive(Debug, Default)]
struct HubState {
    registry: SubscriptionRegistry,
    cache: TickCache,
    sessions: HashMap<ClientId, SessionHandle>,
}

/// Point-in-time broadcaster statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Connected clients.
    pub clients: usize,
    /// Tokens requested upstream.
    pub required_tokens: usize,
    /// Instruments with a cached tick.
    pub cached_instruments: usize,
}

// =============================================================================
// Broadcaster
// =============================================================================

/// Registry, cache and client queues behind one lock.
pub struct FanoutBroadcaster {
    state: Mutex<HubState>,
    feed: Arc<dyn FeedControl>,
    directory: InstrumentDirectory,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl std::fmt::Debug for FanoutBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutBroadcaster")
            .field("stats", &self.stats())
            .field("queue_capacity", &self.queue_capacity)
            .finish_non_exhaustive()
    }
}

impl FanoutBroadcaster {
    /// Create a broadcaster that forwards upstream deltas to `feed`.
    #[must_use]
    pub fn new(
        feed: Arc<dyn FeedControl>,
        settings: &ClientSettings,
        directory: InstrumentDirectory,
    ) -> Self {
        Self {
            state: Mutex::new(HubState::default()),
            feed,
            directory,
            next_id: AtomicU64::new(1),
            queue_capacity: settings.queue_capacity.max(1),
        }
    }

    /// Register a new client with no interest.
    ///
    /// The first queued message is [`ServerMessage::Connected`].
    pub fn on_client_connect(&self) -> ClientSession {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, outbound) = mpsc::channel(self.queue_capacity);
        let closed = CancellationToken::new();
        let handle = SessionHandle {
            tx,
            closed: closed.clone(),
        };

        let mut state = self.state.lock();
        // Queue is empty and has capacity of at least one.
        let _ = handle.enqueue(ServerMessage::Connected);
        state.sessions.insert(id, handle);
        metrics::set_clients(state.sessions.len());
        drop(state);

        tracing::info!(client_id = id, "Client connected");
        ClientSession {
            id,
            outbound,
            closed,
        }
    }

    /// Add `tokens` to the client's interest.
    ///
    /// Queues the `subscribed` acknowledgement and then one `ticks`
    /// message holding the cached tick of every token the client did not
    /// already hold. Returns the acknowledged tokens.
    ///
    /// # Errors
    ///
    /// [`HubError::InvalidArgument`] if any token is invalid (no state is
    /// changed), [`HubError::ClientUnreachable`] if the client is unknown or
    /// its queue overflowed.
    pub fn on_client_subscribe(
        &self,
        client: ClientId,
        raw_tokens: &[i64],
    ) -> Result<Vec<InstrumentToken>, HubError> {
        let tokens = validate(raw_tokens)?;

        let mut state = self.state.lock();
        if !state.sessions.contains_key(&client) {
            return Err(HubError::ClientUnreachable(client));
        }

        let fresh: Vec<InstrumentToken> = tokens
            .iter()
            .copied()
            .filter(|token| !state.registry.is_interested(client, *token))
            .collect();

        let delta = state.registry.add_interest(client, &tokens);
        self.forward_subscribe(&delta);
        metrics::set_required_tokens(state.registry.stats().token_count);

        let snapshot: Vec<TickPayload> = fresh
            .iter()
            .filter_map(|token| state.cache.get(*token))
            .map(|tick| self.format(tick))
            .collect();

        let mut messages = vec![ServerMessage::Subscribed {
            tokens: tokens.clone(),
        }];
        if !snapshot.is_empty() {
            messages.push(ServerMessage::Ticks { data: snapshot });
        }
        self.enqueue_all(&mut state, client, messages)?;
        drop(state);

        tracing::debug!(
            client_id = client,
            tokens = tokens.len(),
            upstream_delta = delta.len(),
            "Client subscribed"
        );
        Ok(tokens)
    }

    /// Remove `tokens` from the client's interest.
    ///
    /// Queues the `unsubscribed` acknowledgement. Tokens the client never
    /// held are acknowledged but change nothing.
    ///
    /// # Errors
    ///
    /// Same as [`Self::on_client_subscribe`].
    pub fn on_client_unsubscribe(
        &self,
        client: ClientId,
        raw_tokens: &[i64],
    ) -> Result<Vec<InstrumentToken>, HubError> {
        let tokens = validate(raw_tokens)?;

        let mut state = self.state.lock();
        if !state.sessions.contains_key(&client) {
            return Err(HubError::ClientUnreachable(client));
        }

        let delta = state.registry.remove_interest(client, &tokens);
        self.forward_unsubscribe(&delta);
        metrics::set_required_tokens(state.registry.stats().token_count);

        self.enqueue_all(
            &mut state,
            client,
            vec![ServerMessage::Unsubscribed {
                tokens: tokens.clone(),
            }],
        )?;
        drop(state);

        tracing::debug!(
            client_id = client,
            tokens = tokens.len(),
            upstream_delta = delta.len(),
            "Client unsubscribed"
        );
        Ok(tokens)
    }

    /// Drop the client everywhere and release its upstream interest.
    ///
    /// Idempotent; unknown clients are ignored.
    pub fn on_client_disconnect(&self, client: ClientId) {
        let mut state = self.state.lock();
        if self.remove_session(&mut state, client) {
            tracing::info!(client_id = client, "Client disconnected");
        }
    }

    /// Pin `tokens` upstream without a client session.
    ///
    /// Returns every token requested upstream afterwards.
    ///
    /// # Errors
    ///
    /// [`HubError::InvalidArgument`] if any token is invalid; nothing is
    /// changed.
    pub fn admin_subscribe(&self, raw_tokens: &[i64]) -> Result<TokenDelta, HubError> {
        let tokens = validate(raw_tokens)?;

        let mut state = self.state.lock();
        let delta = state.registry.add_interest(ADMIN_CLIENT, &tokens);
        self.forward_subscribe(&delta);
        metrics::set_required_tokens(state.registry.stats().token_count);
        let required = state.registry.required_tokens();
        drop(state);

        tracing::info!(
            tokens = tokens.len(),
            upstream_delta = delta.len(),
            "Admin subscribed"
        );
        Ok(required)
    }

    /// Release tokens pinned by [`Self::admin_subscribe`].
    ///
    /// Client interest in the same tokens is untouched. Returns every token
    /// requested upstream afterwards.
    ///
    /// # Errors
    ///
    /// Same as [`Self::admin_subscribe`].
    pub fn admin_unsubscribe(&self, raw_tokens: &[i64]) -> Result<TokenDelta, HubError> {
        let tokens = validate(raw_tokens)?;

        let mut state = self.state.lock();
        let delta = state.registry.remove_interest(ADMIN_CLIENT, &tokens);
        self.forward_unsubscribe(&delta);
        metrics::set_required_tokens(state.registry.stats().token_count);
        let required = state.registry.required_tokens();
        drop(state);

        tracing::info!(
            tokens = tokens.len(),
            upstream_delta = delta.len(),
            "Admin unsubscribed"
        );
        Ok(required)
    }

    /// Enqueue `ticks` to every interested live client.
    ///
    /// Returns the number of messages queued.
    pub fn deliver(&self, ticks: &[Tick]) -> usize {
        let mut state = self.state.lock();
        self.deliver_locked(&mut state, ticks)
    }

    /// Cache and deliver one batch atomically with respect to subscribes.
    pub fn ingest(&self, batch: TickBatch) -> usize {
        let mut state = self.state.lock();
        for tick in &batch {
            state.cache.update(tick.clone());
        }
        self.deliver_locked(&mut state, &batch)
    }

    /// Last cached tick for `token`.
    #[must_use]
    pub fn last_tick(&self, token: InstrumentToken) -> Option<Tick> {
        self.state.lock().cache.get(token).cloned()
    }

    /// Number of connected clients.
    #[must_use]
    pub fn active_clients(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Tokens with at least one interested client.
    #[must_use]
    pub fn required_tokens(&self) -> TokenDelta {
        self.state.lock().registry.required_tokens()
    }

    /// Tokens held by `client`; [`ADMIN_CLIENT`] gives the pinned set.
    #[must_use]
    pub fn client_tokens(&self, client: ClientId) -> TokenDelta {
        self.state.lock().registry.client_tokens(client)
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        let state = self.state.lock();
        HubStats {
            clients: state.sessions.len(),
            required_tokens: state.registry.stats().token_count,
            cached_instruments: state.cache.len(),
        }
    }

    // -------------------------------------------------------------------------
    // Internals (caller holds the state lock)
    // -------------------------------------------------------------------------

    fn deliver_locked(&self, state: &mut HubState, ticks: &[Tick]) -> usize {
        let mut per_client: HashMap<ClientId, Vec<TickPayload>> = HashMap::new();
        for tick in ticks {
            let clients = state.registry.interested_clients(tick.instrument_token);
            if clients.is_empty() {
                continue;
            }
            let payload = self.format(tick);
            for client in clients {
                per_client.entry(client).or_default().push(payload.clone());
            }
        }

        let mut queued = 0;
        let mut shed = Vec::new();
        for (client, data) in per_client {
            let Some(session) = state.sessions.get(&client) else {
                continue;
            };
            match session.enqueue(ServerMessage::Ticks { data }) {
                Ok(()) => queued += 1,
                Err(reason) => shed.push((client, reason)),
            }
        }

        for (client, reason) in shed {
            self.shed(state, client, reason);
        }

        queued
    }

    fn enqueue_all(
        &self,
        state: &mut HubState,
        client: ClientId,
        messages: Vec<ServerMessage>,
    ) -> Result<(), HubError> {
        let Some(session) = state.sessions.get(&client) else {
            return Err(HubError::ClientUnreachable(client));
        };

        let failure = messages
            .into_iter()
            .find_map(|message| session.enqueue(message).err());

        match failure {
            None => Ok(()),
            Some(reason) => {
                self.shed(state, client, reason);
                Err(HubError::ClientUnreachable(client))
            }
        }
    }

    fn shed(&self, state: &mut HubState, client: ClientId, reason: ShedReason) {
        if self.remove_session(state, client) {
            metrics::record_client_shed(reason);
            tracing::warn!(client_id = client, ?reason, "Dropping unresponsive client");
        }
    }

    fn remove_session(&self, state: &mut HubState, client: ClientId) -> bool {
        let Some(session) = state.sessions.remove(&client) else {
            return false;
        };
        session.closed.cancel();

        let delta = state.registry.drop_client(client);
        self.forward_unsubscribe(&delta);

        metrics::set_clients(state.sessions.len());
        metrics::set_required_tokens(state.registry.stats().token_count);
        true
    }

    fn forward_subscribe(&self, delta: &TokenDelta) {
        if !delta.is_empty() {
            let tokens: Vec<_> = delta.iter().copied().collect();
            self.feed.subscribe(&tokens);
        }
    }

    fn forward_unsubscribe(&self, delta: &TokenDelta) {
        if !delta.is_empty() {
            let tokens: Vec<_> = delta.iter().copied().collect();
            self.feed.unsubscribe(&tokens);
        }
    }

    fn format(&self, tick: &Tick) -> TickPayload {
        TickPayload::from_tick(tick, self.directory.symbol(tick.instrument_token))
    }
}

impl TickSink for FanoutBroadcaster {
    fn ingest(&self, batch: TickBatch) -> usize {
        Self::ingest(self, batch)
    }
}

/// Validate raw client tokens, dropping duplicates but keeping order.
fn validate(raw_tokens: &[i64]) -> Result<Vec<InstrumentToken>, HubError> {
    let mut seen = BTreeSet::new();
    let mut tokens = Vec::with_capacity(raw_tokens.len());

    for &raw in raw_tokens {
        let token =
            InstrumentToken::try_from(raw).map_err(|e| HubError::InvalidArgument(e.to_string()))?;
        if seen.insert(token) {
            tokens.push(token);
        }
    }

    Ok(tokens)
}

// =============================================================================
// Tests
// =============================================================================
