//! Fractional sort keys for cards inside a stage.
//!
//! Keys are plain `f64`s. Inserting between two neighbours takes their
//! midpoint, so a stage can absorb many moves before two neighbours get too
//! close to split. When that happens the stage is renumbered to evenly spaced
//! integer keys and the insertion is retried once.

use shared::{
    domain::{SORT_KEY_BASELINE, SORT_KEY_STEP},
    error::{PipelineError, PipelineResult},
};

/// Key handed to the first card placed in an empty stage.
pub const BASELINE_KEY: f64 = SORT_KEY_BASELINE;
/// Gap left after the last card when appending.
pub const KEY_INCREMENT: f64 = SORT_KEY_STEP;
/// Neighbours closer than this are considered exhausted.
pub const MIN_KEY_GAP: f64 = 1e-6;

/// Where a card lands, plus the rewritten sibling keys when the stage had to
/// be renumbered first.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub key: f64,
    /// New keys for every sibling, in the same order as the input.
    pub renormalized: Option<Vec<f64>>,
}

/// Computes the key for a card inserted at `index` among `siblings`, which
/// must be sorted ascending and must not contain the moving card.
pub fn compute_key(siblings: &[f64], index: usize) -> PipelineResult<f64> {
    let Some(&first) = siblings.first() else {
        return Ok(BASELINE_KEY);
    };

    if index == 0 {
        let key = first / 2.0;
        if key >= MIN_KEY_GAP && key < first && first - key >= MIN_KEY_GAP {
            return Ok(key);
        }
        return Err(PipelineError::KeyExhaustion {
            lower: 0.0,
            upper: first,
        });
    }

    if index >= siblings.len() {
        let last = siblings[siblings.len() - 1];
        let key = last + KEY_INCREMENT;
        if key.is_finite() && key > last {
            return Ok(key);
        }
        return Err(PipelineError::KeyExhaustion {
            lower: last,
            upper: key,
        });
    }

    let lower = siblings[index - 1];
    let upper = siblings[index];
    // Also rejects equal, inverted and NaN neighbours.
    if !(upper - lower >= MIN_KEY_GAP) {
        return Err(PipelineError::KeyExhaustion { lower, upper });
    }
    let key = lower + (upper - lower) / 2.0;
    if lower < key && key < upper {
        Ok(key)
    } else {
        Err(PipelineError::KeyExhaustion { lower, upper })
    }
}

/// Evenly spaced keys `1000, 2000, ...` for `count` cards.
pub fn renormalized_keys(count: usize) -> Vec<f64> {
    (1..=count).map(|slot| slot as f64 * KEY_INCREMENT).collect()
}

/// Like [`compute_key`], but renumbers the stage and retries once when the
/// neighbours are exhausted.
pub fn compute_key_or_renormalize(siblings: &[f64], index: usize) -> PipelineResult<Placement> {
    match compute_key(siblings, index) {
        Ok(key) => Ok(Placement {
            key,
            renormalized: None,
        }),
        Err(PipelineError::KeyExhaustion { lower, upper }) => {
            tracing::debug!(
                lower,
                upper,
                siblings = siblings.len(),
                "sort keys exhausted; renormalizing stage"
            );
            let keys = renormalized_keys(siblings.len());
            let key = compute_key(&keys, index)?;
            Ok(Placement {
                key,
                renormalized: Some(keys),
            })
        }
        Err(other) => Err(other),
    }
}

#[cfg(test)]
#[path = "tests/ordering_tests.rs"]
mod tests;
