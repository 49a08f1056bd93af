use std::collections::HashMap;

use shared::domain::{Deal, DealId, Stage, StageId};
use tracing::{debug, warn};

/// Cards fetched from the gateway, tagged with the local sequence observed
/// when the fetch was issued.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub batch_seq: u64,
    pub cards: Vec<Deal>,
}

/// One board column: an active stage and its cards in display order.
#[derive(Debug, Clone, PartialEq)]
pub struct StageGroup {
    pub stage: Stage,
    pub cards: Vec<Deal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingMarker {
    seq: u64,
    in_flight: u32,
}

/// Client-side copy of the board. Holds optimistic edits until the store
/// confirms or replaces them.
#[derive(Debug, Default)]
pub struct MirrorStore {
    cards: HashMap<DealId, Deal>,
    stages: Vec<Stage>,
    pending: HashMap<DealId, PendingMarker>,
    seq: u64,
}

impl MirrorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Moves a card locally and marks it as awaiting a persist. Unknown ids
    /// are logged and ignored; returns whether the card was found.
    pub fn apply_optimistic_move(
        &mut self,
        card_id: DealId,
        stage_id: StageId,
        sort_order: f64,
    ) -> bool {
        let seq = self.next_seq();
        let Some(card) = self.cards.get_mut(&card_id) else {
            warn!(card_id = %card_id, "optimistic move for unknown card ignored");
            return false;
        };
        card.stage_id = stage_id;
        card.sort_order = sort_order;

        let marker = self.pending.entry(card_id).or_insert(PendingMarker {
            seq,
            in_flight: 0,
        });
        marker.seq = seq;
        marker.in_flight += 1;
        true
    }

    /// Records that one persist for `card_id` finished, successfully or not.
    /// A fetch issued after this call supersedes the local value.
    pub fn settle_write(&mut self, card_id: DealId) {
        let seq = self.next_seq();
        if let Some(marker) = self.pending.get_mut(&card_id) {
            marker.in_flight = marker.in_flight.saturating_sub(1);
            marker.seq = seq;
        }
    }

    /// Sequence to attach to the snapshot of a fetch about to be issued.
    pub fn begin_batch(&self) -> u64 {
        self.seq
    }

    /// Replaces the card collection with `snapshot`, except for cards whose
    /// local edit is newer than the fetch or still being written.
    pub fn reconcile(&mut self, snapshot: Snapshot) {
        let mut next: HashMap<DealId, Deal> = snapshot
            .cards
            .into_iter()
            .map(|card| (card.id, card))
            .collect();

        let mut kept = HashMap::new();
        for (card_id, marker) in std::mem::take(&mut self.pending) {
            if marker.in_flight > 0 || marker.seq > snapshot.batch_seq {
                if let Some(local) = self.cards.remove(&card_id) {
                    next.insert(card_id, local);
                }
                kept.insert(card_id, marker);
            }
        }

        debug!(
            cards = next.len(),
            pending = kept.len(),
            batch_seq = snapshot.batch_seq,
            "mirror reconciled"
        );
        self.cards = next;
        self.pending = kept;
    }

    pub fn replace_stages(&mut self, mut stages: Vec<Stage>) {
        stages.sort_by(|a, b| a.display_order.cmp(&b.display_order).then(a.id.cmp(&b.id)));
        self.stages = stages;
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, stage_id: StageId) -> Option<&Stage> {
        self.stages.iter().find(|stage| stage.id == stage_id)
    }

    pub fn card(&self, card_id: DealId) -> Option<&Deal> {
        self.cards.get(&card_id)
    }

    pub fn cards(&self) -> impl Iterator<Item = &Deal> {
        self.cards.values()
    }

    pub fn is_pending(&self, card_id: DealId) -> bool {
        self.pending.contains_key(&card_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Cards of one stage in display order, optionally without `excluding`.
    pub fn siblings(&self, stage_id: StageId, excluding: Option<DealId>) -> Vec<&Deal> {
        let mut cards: Vec<&Deal> = self
            .cards
            .values()
            .filter(|card| card.stage_id == stage_id && Some(card.id) != excluding)
            .collect();
        cards.sort_by(|a, b| by_key_then_id(a, b));
        cards
    }

    pub fn sibling_keys(&self, stage_id: StageId, excluding: Option<DealId>) -> Vec<f64> {
        self.siblings(stage_id, excluding)
            .into_iter()
            .map(|card| card.sort_order)
            .collect()
    }

    /// Active stages in display order, each with its cards sorted by key.
    pub fn group_by_stage(&self) -> Vec<StageGroup> {
        self.stages
            .iter()
            .filter(|stage| stage.is_active)
            .map(|stage| StageGroup {
                stage: stage.clone(),
                cards: self
                    .siblings(stage.id, None)
                    .into_iter()
                    .cloned()
                    .collect(),
            })
            .collect()
    }
}

fn by_key_then_id(a: &Deal, b: &Deal) -> std::cmp::Ordering {
    a.sort_order
        .total_cmp(&b.sort_order)
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
#[path = "tests/mirror_tests.rs"]
mod tests;
