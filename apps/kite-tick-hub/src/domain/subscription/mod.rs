//! Subscription Registry
//!
//! Tracks which downstream clients are interested in which instruments
//! and derives the set of tokens that must be requested upstream.
//!
//! # Design
//!
//! The registry keeps two indexes in lockstep:
//! - instrument token -> interested clients
//! - client -> subscribed tokens
//!
//! Every mutating call returns the upstream delta: the tokens whose
//! interest went from zero to non-zero (or back). The registry never talks
//! to the feed connector; the caller decides what to do with the delta.
//! It holds no lock of its own and is serialized by its owner.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::domain::streaming::InstrumentToken;

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a downstream client session.
pub type ClientId = u64;

/// Tokens whose upstream interest changed, in ascending order.
pub type TokenDelta = BTreeSet<InstrumentToken>;

// =============================================================================
// Registry
// =============================================================================

/// Instrument interest across all connected clients.
///
/// # Example
///
/// ```rust
/// use kite_tick_hub::domain::streaming::InstrumentToken;
/// use kite_tick_hub::domain::subscription::SubscriptionRegistry;
///
/// let nifty = InstrumentToken::new(256_265);
/// let mut registry = SubscriptionRegistry::new();
///
/// // First client: token must be requested upstream
/// assert!(registry.add_interest(1, &[nifty]).contains(&nifty));
///
/// // Second client: already requested
/// assert!(registry.add_interest(2, &[nifty]).is_empty());
///
/// // Client 1 leaves, client 2 still interested
/// assert!(registry.remove_interest(1, &[nifty]).is_empty());
///
/// // Last client leaves: token can be dropped upstream
/// assert!(registry.drop_client(2).contains(&nifty));
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    token_clients: HashMap<InstrumentToken, HashSet<ClientId>>,
    client_tokens: HashMap<ClientId, HashSet<InstrumentToken>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest of `client` in `tokens`.
    ///
    /// Returns tokens that went from zero to one interested client.
    /// Tokens the client already holds are skipped.
    pub fn add_interest(&mut self, client: ClientId, tokens: &[InstrumentToken]) -> TokenDelta {
        let mut added = TokenDelta::new();
        if tokens.is_empty() {
            return added;
        }

        let held = self.client_tokens.entry(client).or_default();
        for &token in tokens {
            if !held.insert(token) {
                continue;
            }

            let interested = self.token_clients.entry(token).or_default();
            interested.insert(client);
            if interested.len() == 1 {
                added.insert(token);
            }
        }

        added
    }

    /// Withdraw interest of `client` in `tokens`.
    ///
    /// Returns tokens that no client is interested in any more. Tokens the
    /// client never held are ignored.
    pub fn remove_interest(&mut self, client: ClientId, tokens: &[InstrumentToken]) -> TokenDelta {
        let mut removed = TokenDelta::new();
        let Some(held) = self.client_tokens.get_mut(&client) else {
            return removed;
        };

        for token in tokens {
            if !held.remove(token) {
                continue;
            }
            if Self::release(&mut self.token_clients, *token, client) {
                removed.insert(*token);
            }
        }

        if held.is_empty() {
            self.client_tokens.remove(&client);
        }

        removed
    }

    /// Remove every interest held by `client`.
    ///
    /// Returns the union of tokens that became empty.
    pub fn drop_client(&mut self, client: ClientId) -> TokenDelta {
        let Some(held) = self.client_tokens.remove(&client) else {
            return TokenDelta::new();
        };

        held.into_iter()
            .filter(|token| Self::release(&mut self.token_clients, *token, client))
            .collect()
    }

    /// Tokens with at least one interested client.
    #[must_use]
    pub fn required_tokens(&self) -> TokenDelta {
        self.token_clients.keys().copied().collect()
    }

    /// Clients interested in `token`.
    #[must_use]
    pub fn interested_clients(&self, token: InstrumentToken) -> Vec<ClientId> {
        self.token_clients
            .get(&token)
            .map(|clients| clients.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Tokens currently held by `client`.
    #[must_use]
    pub fn client_tokens(&self, client: ClientId) -> TokenDelta {
        self.client_tokens
            .get(&client)
            .map(|tokens| tokens.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether `client` is interested in `token`.
    #[must_use]
    pub fn is_interested(&self, client: ClientId, token: InstrumentToken) -> bool {
        self.client_tokens
            .get(&client)
            .is_some_and(|tokens| tokens.contains(&token))
    }

    /// Current token and client counts.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            token_count: self.token_clients.len(),
            client_count: self.client_tokens.len(),
        }
    }

    /// Drop `client` from the interest set of `token`.
    ///
    /// Returns true when the token has no interested clients left.
    fn release(
        token_clients: &mut HashMap<InstrumentToken, HashSet<ClientId>>,
        token: InstrumentToken,
        client: ClientId,
    ) -> bool {
        let Some(clients) = token_clients.get_mut(&token) else {
            return false;
        };
        clients.remove(&client);
        if clients.is_empty() {
            token_clients.remove(&token);
            return true;
        }
        false
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Number of tokens with at least one interested client.
    pub token_count: usize,
    /// Number of clients holding at least one token.
    pub client_count: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const NIFTY: InstrumentToken = InstrumentToken::new(256_265);
    const RELIANCE: InstrumentToken = InstrumentToken::new(738_561);
    const INFY: InstrumentToken = InstrumentToken::new(408_065);

    #[test]
    fn add_interest_new_token() {
        let mut registry = SubscriptionRegistry::new();

        let delta = registry.add_interest(1, &[NIFTY]);

        assert_eq!(delta, BTreeSet::from([NIFTY]));
        assert_eq!(registry.required_tokens(), BTreeSet::from([NIFTY]));
    }

    #[test]
    fn add_interest_existing_token() {
        let mut registry = SubscriptionRegistry::new();

        registry.add_interest(1, &[NIFTY]);
        let delta = registry.add_interest(2, &[NIFTY]);

        assert!(delta.is_empty());
        assert_eq!(registry.interested_clients(NIFTY).len(), 2);
    }

    #[test]
    fn duplicate_subscribe_is_noop() {
        let mut registry = SubscriptionRegistry::new();

        registry.add_interest(1, &[NIFTY]);
        let delta = registry.add_interest(1, &[NIFTY, NIFTY]);

        assert!(delta.is_empty());
        assert_eq!(registry.interested_clients(NIFTY), vec![1]);
    }

    #[test]
    fn repeated_token_in_one_call_reported_once() {
        let mut registry = SubscriptionRegistry::new();

        let delta = registry.add_interest(1, &[RELIANCE, RELIANCE]);

        assert_eq!(delta.len(), 1);
    }

    #[test]
    fn empty_token_list_registers_nothing() {
        let mut registry = SubscriptionRegistry::new();

        assert!(registry.add_interest(1, &[]).is_empty());
        assert_eq!(registry.stats(), SubscriptionStats::default());
    }

    #[test]
    fn remove_interest_with_remaining_clients() {
        let mut registry = SubscriptionRegistry::new();

        registry.add_interest(1, &[NIFTY]);
        registry.add_interest(2, &[NIFTY]);

        assert!(registry.remove_interest(1, &[NIFTY]).is_empty());
        assert_eq!(registry.interested_clients(NIFTY), vec![2]);
    }

    #[test]
    fn remove_interest_last_client() {
        let mut registry = SubscriptionRegistry::new();

        registry.add_interest(1, &[NIFTY]);

        assert_eq!(registry.remove_interest(1, &[NIFTY]), BTreeSet::from([NIFTY]));
        assert!(registry.required_tokens().is_empty());
        assert!(registry.client_tokens(1).is_empty());
    }

    #[test]
    fn remove_never_subscribed_token_is_noop() {
        let mut registry = SubscriptionRegistry::new();

        registry.add_interest(1, &[NIFTY]);

        assert!(registry.remove_interest(1, &[RELIANCE]).is_empty());
        assert!(registry.remove_interest(2, &[NIFTY]).is_empty());
        assert_eq!(registry.required_tokens(), BTreeSet::from([NIFTY]));
    }

    #[test]
    fn drop_client_returns_union_of_emptied_tokens() {
        let mut registry = SubscriptionRegistry::new();

        registry.add_interest(1, &[NIFTY, RELIANCE, INFY]);
        registry.add_interest(2, &[RELIANCE]);

        let delta = registry.drop_client(1);

        assert_eq!(delta, BTreeSet::from([NIFTY, INFY]));
        assert_eq!(registry.required_tokens(), BTreeSet::from([RELIANCE]));
        assert_eq!(registry.interested_clients(RELIANCE), vec![2]);
    }

    #[test]
    fn drop_unknown_client_is_noop() {
        let mut registry = SubscriptionRegistry::new();

        registry.add_interest(1, &[NIFTY]);

        assert!(registry.drop_client(7).is_empty());
        assert_eq!(registry.stats().token_count, 1);
    }

    #[test]
    fn client_tokens_and_interest() {
        let mut registry = SubscriptionRegistry::new();

        registry.add_interest(1, &[NIFTY, RELIANCE]);
        registry.add_interest(2, &[INFY]);

        assert_eq!(registry.client_tokens(1), BTreeSet::from([NIFTY, RELIANCE]));
        assert!(registry.is_interested(2, INFY));
        assert!(!registry.is_interested(2, NIFTY));
        assert!(registry.client_tokens(99).is_empty());
    }

    #[test]
    fn stats_are_accurate() {
        let mut registry = SubscriptionRegistry::new();

        registry.add_interest(1, &[NIFTY, RELIANCE]);
        registry.add_interest(2, &[NIFTY]);

        assert_eq!(
            registry.stats(),
            SubscriptionStats {
                token_count: 2,
                client_count: 2,
            }
        );
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(ClientId, Vec<u32>),
        Remove(ClientId, Vec<u32>),
        Drop(ClientId),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        let client = 0u64..5;
        let tokens = prop::collection::vec(1u32..8, 0..4);
        prop_oneof![
            (client.clone(), tokens.clone()).prop_map(|(c, t)| Op::Add(c, t)),
            (client.clone(), tokens).prop_map(|(c, t)| Op::Remove(c, t)),
            client.prop_map(Op::Drop),
        ]
    }

    fn to_tokens(raw: &[u32]) -> Vec<InstrumentToken> {
        raw.iter().copied().map(InstrumentToken::new).collect()
    }

    proptest! {
        #[test]
        fn required_set_tracks_interest(ops in prop::collection::vec(op_strategy(), 1..60)) {
            let mut registry = SubscriptionRegistry::new();
            let mut model: HashMap<ClientId, BTreeSet<InstrumentToken>> = HashMap::new();

            for op in ops {
                let before: BTreeSet<_> = model.values().flatten().copied().collect();

                let delta = match &op {
                    Op::Add(client, raw) => {
                        let tokens = to_tokens(raw);
                        model.entry(*client).or_default().extend(tokens.iter().copied());
                        registry.add_interest(*client, &tokens)
                    }
                    Op::Remove(client, raw) => {
                        let tokens = to_tokens(raw);
                        if let Some(held) = model.get_mut(client) {
                            for token in &tokens {
                                held.remove(token);
                            }
                        }
                        registry.remove_interest(*client, &tokens)
                    }
                    Op::Drop(client) => {
                        model.remove(client);
                        registry.drop_client(*client)
                    }
                };

                let after: BTreeSet<_> = model.values().flatten().copied().collect();
                prop_assert_eq!(registry.required_tokens(), after.clone());

                let expected_delta: BTreeSet<_> = match op {
                    Op::Add(..) => after.difference(&before).copied().collect(),
                    Op::Remove(..) | Op::Drop(_) => before.difference(&after).copied().collect(),
                };
                prop_assert_eq!(delta, expected_delta);

                for (client, held) in &model {
                    prop_assert_eq!(&registry.client_tokens(*client), held);
                    for token in held {
                        prop_assert!(registry.interested_clients(*token).contains(client));
                    }
                }
            }
        }
    }
}
