//! Endpoint tracker — learns our externally visible endpoint by vote.
//!
//! Every Pong tells us how the answering node saw our address. Each remote
//! source gets one vote, for the endpoint it reported most recently. Votes
//! age out after `max_age`; an endpoint is only used once `min_votes`
//! distinct sources agree on it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use meshwire_core::config::EndpointConfig;
use meshwire_core::Endpoint;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    pub min_votes: usize,
    pub max_age: Duration,
}

impl From<&EndpointConfig> for TrackerConfig {
    fn from(c: &EndpointConfig) -> Self {
        Self {
            min_votes: c.min_votes,
            max_age: Duration::from_secs(c.max_age_secs),
        }
    }
}

struct Bucket {
    /// source → time of its latest statement
    voters: HashMap<Endpoint, Instant>,
    updated: Instant,
}

#[derive(Default)]
struct Statements {
    /// claimed endpoint → who claimed it
    buckets: HashMap<Endpoint, Bucket>,
    /// source → the endpoint it currently claims
    claims: HashMap<Endpoint, Endpoint>,
}

impl Statements {
    fn withdraw(&mut self, source: &Endpoint, claimed: &Endpoint) {
        if let Some(bucket) = self.buckets.get_mut(claimed) {
            bucket.voters.remove(source);
            if bucket.voters.is_empty() {
                self.buckets.remove(claimed);
            }
        }
    }
}

pub struct EndpointTracker {
    config: TrackerConfig,
    inner: Mutex<Statements>,
}

impl EndpointTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Statements::default()),
        }
    }

    pub fn config(&self) -> TrackerConfig {
        self.config
    }

    /// Record that `source` observed us at `observed`. Returns the number of
    /// distinct sources now backing `observed`.
    pub fn add_endpoint_statement(&self, source: Endpoint, observed: Endpoint) -> usize {
        self.add_statement_at(source, observed, Instant::now())
    }

    pub fn add_statement_at(&self, source: Endpoint, observed: Endpoint, now: Instant) -> usize {
        let mut guard = self.inner.lock();
        let s = &mut *guard;

        if let Some(previous) = s.claims.insert(source, observed) {
            if previous != observed {
                s.withdraw(&source, &previous);
            }
        }

        let bucket = s.buckets.entry(observed).or_insert_with(|| Bucket {
            voters: HashMap::new(),
            updated: now,
        });
        bucket.voters.insert(source, now);
        bucket.updated = now;
        bucket.voters.len()
    }

    /// Endpoint with the most distinct voters; ties go to the most recently
    /// updated. `None` when no statements are held.
    pub fn best_endpoint(&self) -> Option<Endpoint> {
        self.best().map(|(endpoint, _)| endpoint)
    }

    /// `best_endpoint` once it has at least `min_votes` voters.
    pub fn authoritative_endpoint(&self) -> Option<Endpoint> {
        self.best()
            .filter(|(_, votes)| *votes >= self.config.min_votes)
            .map(|(endpoint, _)| endpoint)
    }

    fn best(&self) -> Option<(Endpoint, usize)> {
        let s = self.inner.lock();
        s.buckets
            .iter()
            .max_by(|(_, a), (_, b)| {
                a.voters
                    .len()
                    .cmp(&b.voters.len())
                    .then(a.updated.cmp(&b.updated))
            })
            .map(|(endpoint, bucket)| (*endpoint, bucket.voters.len()))
    }

    pub fn votes_for(&self, endpoint: &Endpoint) -> usize {
        self.inner
            .lock()
            .buckets
            .get(endpoint)
            .map_or(0, |b| b.voters.len())
    }

    /// Drop statements older than `max_age`.
    pub fn garbage_collect_statements(&self, max_age: Duration) {
        self.garbage_collect_at(max_age, Instant::now());
    }

    /// Drop statements older than the configured `max_age`.
    pub fn collect_expired(&self) {
        self.garbage_collect_statements(self.config.max_age);
    }

    pub fn garbage_collect_at(&self, max_age: Duration, now: Instant) {
        let mut guard = self.inner.lock();
        let s = &mut *guard;

        let mut expired = Vec::new();
        s.buckets.retain(|_, bucket| {
            bucket.voters.retain(|source, at| {
                let keep = now.saturating_duration_since(*at) <= max_age;
                if !keep {
                    expired.push(*source);
                }
                keep
            });
            if let Some(latest) = bucket.voters.values().max() {
                bucket.updated = *latest;
            }
            !bucket.voters.is_empty()
        });
        for source in expired {
            s.claims.remove(&source);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ep(last: u8, port: u16) -> Endpoint {
        Endpoint::new(format!("10.0.0.{last}").parse().unwrap(), port, port)
    }

    fn tracker() -> EndpointTracker {
        EndpointTracker::new(TrackerConfig {
            min_votes: 3,
            max_age: Duration::from_secs(60),
        })
    }

    #[test]
    fn majority_wins_and_counts_are_returned() {
        let t = tracker();
        let e1 = ep(100, 30303);
        let e2 = ep(101, 30303);

        assert_eq!(t.add_endpoint_statement(ep(1, 1), e1), 1);
        assert_eq!(t.add_endpoint_statement(ep(2, 1), e1), 2);
        assert_eq!(t.add_endpoint_statement(ep(3, 1), e1), 3);
        assert_eq!(t.add_endpoint_statement(ep(4, 1), e2), 1);
        assert_eq!(t.add_endpoint_statement(ep(5, 1), e2), 2);

        assert_eq!(t.best_endpoint(), Some(e1));
    }

    #[test]
    fn repeated_statement_does_not_double_count() {
        let t = tracker();
        let e1 = ep(100, 1);
        assert_eq!(t.add_endpoint_statement(ep(1, 1), e1), 1);
        assert_eq!(t.add_endpoint_statement(ep(1, 1), e1), 1);
        assert_eq!(t.votes_for(&e1), 1);
    }

    #[test]
    fn switching_claim_moves_the_vote() {
        let t = tracker();
        let e1 = ep(100, 1);
        let e2 = ep(101, 1);
        t.add_endpoint_statement(ep(1, 1), e1);
        assert_eq!(t.add_endpoint_statement(ep(1, 1), e2), 1);
        assert_eq!(t.votes_for(&e1), 0);
        assert_eq!(t.best_endpoint(), Some(e2));
    }

    #[test]
    fn tie_goes_to_most_recent() {
        let t = tracker();
        let base = Instant::now();
        let e1 = ep(100, 1);
        let e2 = ep(101, 1);
        t.add_statement_at(ep(1, 1), e1, base);
        t.add_statement_at(ep(2, 1), e1, base);
        t.add_statement_at(ep(3, 1), e2, base + Duration::from_secs(1));
        t.add_statement_at(ep(4, 1), e2, base + Duration::from_secs(2));
        assert_eq!(t.best_endpoint(), Some(e2));
    }

    #[test]
    fn garbage_collection_lets_newer_majority_win() {
        let t = tracker();
        let base = Instant::now();
        let e1 = ep(100, 1);
        let e2 = ep(101, 1);
        for i in 1..=3 {
            t.add_statement_at(ep(i, 1), e1, base);
        }
        for i in 4..=5 {
            t.add_statement_at(ep(i, 1), e2, base + Duration::from_secs(30));
        }
        assert_eq!(t.best_endpoint(), Some(e1));

        t.garbage_collect_at(Duration::from_secs(20), base + Duration::from_secs(40));
        assert_eq!(t.best_endpoint(), Some(e2));
        assert_eq!(t.votes_for(&e1), 0);

        // Expired sources can vote again from scratch.
        assert_eq!(t.add_statement_at(ep(1, 1), e1, base + Duration::from_secs(41)), 1);
    }

    #[test]
    fn gc_of_everything_leaves_nothing() {
        let t = tracker();
        let base = Instant::now();
        t.add_statement_at(ep(1, 1), ep(100, 1), base);
        t.garbage_collect_at(Duration::from_secs(1), base + Duration::from_secs(5));
        assert!(t.is_empty());
        assert_eq!(t.best_endpoint(), None);
    }

    #[test]
    fn authoritative_requires_threshold() {
        let t = tracker();
        let e1 = ep(100, 1);
        t.add_endpoint_statement(ep(1, 1), e1);
        t.add_endpoint_statement(ep(2, 1), e1);
        assert_eq!(t.best_endpoint(), Some(e1));
        assert_eq!(t.authoritative_endpoint(), None);
        t.add_endpoint_statement(ep(3, 1), e1);
        assert_eq!(t.authoritative_endpoint(), Some(e1));
    }

    #[test]
    fn concurrent_statements_are_all_counted() {
        let t = Arc::new(tracker());
        let target = ep(100, 1);
        let handles: Vec<_> = (0..8u8)
            .map(|thread| {
                let t = t.clone();
                std::thread::spawn(move || {
                    for i in 0..25u16 {
                        t.add_endpoint_statement(ep(thread, 1000 + i), target);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(t.votes_for(&target), 200);
    }
}
