use shared::domain::{DealId, StageId};
use thiserror::Error;
use tracing::debug;

/// A slot on the board. `index` counts cards of the stage with the dragged
/// card left out, so dropping a card where it came from keeps its index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DropTarget {
    pub stage_id: StageId,
    pub index: usize,
}

impl DropTarget {
    pub fn new(stage_id: StageId, index: usize) -> Self {
        Self { stage_id, index }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DragState {
    Idle,
    Dragging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DragOutcome {
    Dropped {
        card_id: DealId,
        source: DropTarget,
        target: DropTarget,
    },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DragError {
    #[error("card {0} is already being dragged")]
    AlreadyDragging(DealId),
    #[error("no drag in progress")]
    NotDragging,
}

#[derive(Debug, Clone, Copy)]
struct DragSession {
    card_id: DealId,
    source: DropTarget,
    hover: Option<DropTarget>,
    valid: bool,
}

/// Tracks a single pick-up/hover/drop gesture.
#[derive(Debug, Default)]
pub struct DragSessionController {
    session: Option<DragSession>,
}

impl DragSessionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DragState {
        if self.session.is_some() {
            DragState::Dragging
        } else {
            DragState::Idle
        }
    }

    pub fn is_dragging(&self) -> bool {
        self.session.is_some()
    }

    pub fn dragged_card(&self) -> Option<DealId> {
        self.session.map(|session| session.card_id)
    }

    pub fn pick_up(
        &mut self,
        card_id: DealId,
        source_stage: StageId,
        source_index: usize,
    ) -> Result<(), DragError> {
        if let Some(active) = self.session {
            return Err(DragError::AlreadyDragging(active.card_id));
        }
        let source = DropTarget::new(source_stage, source_index);
        debug!(card_id = %card_id, stage_id = %source_stage, source_index, "drag started");
        self.session = Some(DragSession {
            card_id,
            source,
            // Releasing without moving drops the card back where it was.
            hover: Some(source),
            valid: true,
        });
        Ok(())
    }

    /// Updates the hover target. `None` means the pointer left every drop
    /// zone; releasing then cancels.
    pub fn hover(&mut self, target: Option<DropTarget>) -> Result<(), DragError> {
        let session = self.session.as_mut().ok_or(DragError::NotDragging)?;
        session.valid = target.is_some();
        session.hover = target;
        Ok(())
    }

    pub fn drop_target(&self) -> Option<DropTarget> {
        self.session
            .filter(|session| session.valid)
            .and_then(|session| session.hover)
    }

    /// Ends the gesture. The controller is idle afterwards whatever the
    /// outcome.
    #[allow(clippy::should_implement_trait)]
    pub fn drop(&mut self) -> DragOutcome {
        let Some(session) = self.session.take() else {
            return DragOutcome::Cancelled;
        };
        match (session.valid, session.hover) {
            (true, Some(target)) => DragOutcome::Dropped {
                card_id: session.card_id,
                source: session.source,
                target,
            },
            _ => {
                debug!(card_id = %session.card_id, "drag released outside a drop zone");
                DragOutcome::Cancelled
            }
        }
    }

    pub fn cancel(&mut self) {
        if let Some(session) = self.session.take() {
            debug!(card_id = %session.card_id, "drag cancelled");
        }
    }
}

#[cfg(test)]
#[path = "tests/drag_tests.rs"]
mod tests;
