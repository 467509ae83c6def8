//! Latest-classification mailbox

use std::sync::atomic::{AtomicU64, Ordering};

use inference_engine::Classification;
use metrics::counter;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::telemetry::STALE_RESULTS;

/// What happened to a published result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// Completed before the result already in the cell
    Older,
    /// Belongs to a session that has since stopped
    StaleEpoch,
}

/// Single-slot cell holding the latest classification.
///
/// Published values are monotonic in their `finished` instant. Every stop
/// advances the epoch; results tagged with an earlier epoch are discarded.
/// The epoch is checked under the cell's lock, so a result can never land
/// after the reset that ended its session.
///
/// A cell built with [`ResultCell::journaled`] also queues every accepted
/// result, in publish order, for the detection log. Readers of the `watch`
/// side only ever see the latest one.
pub struct ResultCell {
    tx: watch::Sender<Option<Classification>>,
    epoch: AtomicU64,
    journal: Option<mpsc::UnboundedSender<Classification>>,
}

impl ResultCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx,
            epoch: AtomicU64::new(0),
            journal: None,
        }
    }

    /// Cell that also queues every accepted result on the returned receiver
    pub fn journaled() -> (Self, mpsc::UnboundedReceiver<Classification>) {
        let (journal_tx, journal_rx) = mpsc::unbounded_channel();
        let cell = Self {
            journal: Some(journal_tx),
            ..Self::new()
        };
        (cell, journal_rx)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Invalidate in-flight results and clear the cell; returns the new epoch
    pub fn advance_epoch(&self) -> u64 {
        let next = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.tx.send_replace(None);
        debug!("Result epoch advanced to {}", next);
        next
    }

    pub fn publish(&self, classification: Classification, epoch: u64) -> PublishOutcome {
        let mut outcome = PublishOutcome::Published;
        self.tx.send_if_modified(|current| {
            if epoch != self.epoch.load(Ordering::SeqCst) {
                outcome = PublishOutcome::StaleEpoch;
                return false;
            }
            if let Some(previous) = current {
                if previous.finished > classification.finished {
                    outcome = PublishOutcome::Older;
                    return false;
                }
            }
            if let Some(journal) = &self.journal {
                if journal.send(classification.clone()).is_err() {
                    debug!("Result journal closed");
                }
            }
            *current = Some(classification);
            true
        });

        if outcome != PublishOutcome::Published {
            debug!("Discarded result: {:?}", outcome);
            counter!(STALE_RESULTS).increment(1);
        }
        outcome
    }

    pub fn latest(&self) -> Option<Classification> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Classification>> {
        self.tx.subscribe()
    }
}

impl Default for ResultCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;
    use std::time::{Duration, Instant};

    fn classification(label: &str, offset_ms: u64) -> Classification {
        Classification {
            label: label.to_string(),
            class_index: 0,
            confidence: 0.9,
            completed_at: Local::now(),
            finished: Instant::now() + Duration::from_millis(offset_ms),
            frame_sequence: 0,
        }
    }

    #[test]
    fn test_older_result_is_discarded() {
        let cell = ResultCell::new();
        let newer = classification("NORMAL", 100);
        let older = classification("CRASH", 0);

        assert_eq!(cell.publish(newer.clone(), 0), PublishOutcome::Published);
        assert_eq!(cell.publish(older, 0), PublishOutcome::Older);
        assert_eq!(cell.latest(), Some(newer));
    }

    #[test]
    fn test_result_from_stopped_session_is_discarded() {
        let cell = ResultCell::new();
        let epoch = cell.epoch();
        cell.publish(classification("NORMAL", 0), epoch);

        let next = cell.advance_epoch();
        assert_eq!(cell.latest(), None);
        assert_eq!(cell.publish(classification("CRASH", 50), epoch), PublishOutcome::StaleEpoch);
        assert_eq!(cell.latest(), None);

        assert_eq!(cell.publish(classification("CRASH", 60), next), PublishOutcome::Published);
        assert_eq!(cell.latest().map(|c| c.label), Some("CRASH".to_string()));
    }

    #[test]
    fn test_ordering_ignores_wall_clock() {
        let cell = ResultCell::new();
        let first = classification("NORMAL", 0);
        let mut second = classification("CRASH", 10);
        // Wall clock stepped back between the two completions
        second.completed_at = first.completed_at - chrono::Duration::hours(1);

        cell.publish(first, 0);
        assert_eq!(cell.publish(second, 0), PublishOutcome::Published);
        assert_eq!(cell.latest().map(|c| c.label), Some("CRASH".to_string()));
    }

    #[test]
    fn test_journal_keeps_every_accepted_result() {
        let (cell, mut journal) = ResultCell::journaled();
        cell.publish(classification("CRASH", 0), 0);
        cell.publish(classification("NORMAL", 10), 0);
        cell.publish(classification("CRASH", 5), 0);
        cell.advance_epoch();
        cell.publish(classification("CRASH", 20), 0);

        assert_eq!(cell.latest(), None);
        let journaled: Vec<String> = std::iter::from_fn(|| journal.try_recv().ok())
            .map(|c| c.label)
            .collect();
        assert_eq!(journaled, vec!["CRASH", "NORMAL"]);
    }

    #[tokio::test]
    async fn test_subscribers_see_updates() {
        let cell = ResultCell::new();
        let mut rx = cell.subscribe();
        cell.publish(classification("NORMAL", 0), 0);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().as_ref().map(|c| c.label.clone()), Some("NORMAL".into()));
    }
}
