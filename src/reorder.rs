//! Fractional ordering for manual drag-reorder.
//!
//! Only relative order matters. A move re-keys the moved item alone, using
//! the midpoint of its new neighbours, so a drag costs one write instead of
//! one per sibling. When the neighbours' keys have collapsed onto each other
//! (no representable midpoint) the whole partition is renumbered on integer
//! steps instead.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::model::Task;

/// Gap between neighbours when only one side is known.
pub const DEFAULT_STEP: f64 = 1000.0;

/// A single `sort_order` write.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderUpdate {
    pub id: String,
    pub sort_order: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReorderPlan {
    pub moved_id: String,
    /// One entry on the fast path; one per changed item after a renumber.
    pub updates: Vec<OrderUpdate>,
}

impl ReorderPlan {
    pub fn is_renumber(&self) -> bool {
        self.updates.len() > 1
    }

    pub fn order_of(&self, id: &str) -> Option<f64> {
        self.updates
            .iter()
            .find(|update| update.id == id)
            .map(|update| update.sort_order)
    }
}

pub fn compare_orders(left: f64, right: f64) -> Ordering {
    left.total_cmp(&right)
}

/// Sort tasks by `sort_order`; ties keep their incoming order.
pub fn sort_by_order(tasks: &mut [Task]) {
    tasks.sort_by(|left, right| compare_orders(left.sort_order, right.sort_order));
}

/// Key that places a new item before everything in `existing`.
pub fn prepend_key(existing: impl IntoIterator<Item = f64>, step: f64) -> f64 {
    existing
        .into_iter()
        .filter(|value| value.is_finite())
        .min_by(|a, b| compare_orders(*a, *b))
        .map(|min| min - step)
        .unwrap_or(step)
}

/// Key that places an item after everything in `existing`.
pub fn append_key(existing: impl IntoIterator<Item = f64>, step: f64) -> f64 {
    existing
        .into_iter()
        .filter(|value| value.is_finite())
        .max_by(|a, b| compare_orders(*a, *b))
        .map(|max| max + step)
        .unwrap_or(step)
}

/// Key strictly between `prev` and `next`, or `None` when no such value is
/// representable (equal or inverted neighbours).
pub fn key_between(prev: Option<f64>, next: Option<f64>, base: f64, step: f64) -> Option<f64> {
    let prev = prev.filter(|value| value.is_finite());
    let next = next.filter(|value| value.is_finite());
    match (prev, next) {
        (Some(prev), Some(next)) => {
            let mid = prev + (next - prev) / 2.0;
            (prev < mid && mid < next).then_some(mid)
        }
        (Some(prev), None) => Some(prev + step),
        (None, Some(next)) => Some(next - step),
        (None, None) => Some(if base.is_finite() { base } else { step }),
    }
}

/// Plan the writes for moving `items[source]` to `destination`.
///
/// `items` is the partition in display order as `(id, sort_order)` pairs.
/// Returns `Ok(None)` for a no-op move.
pub fn plan_move(
    items: &[(String, f64)],
    source: usize,
    destination: usize,
    step: f64,
) -> Result<Option<ReorderPlan>> {
    if source >= items.len() || destination >= items.len() {
        return Err(Error::Validation(format!(
            "reorder indices {source} -> {destination} out of range for {} items",
            items.len()
        )));
    }
    if source == destination {
        return Ok(None);
    }

    let mut order: Vec<&(String, f64)> = items.iter().collect();
    let moved = order.remove(source);
    order.insert(destination, moved);

    let prev = destination.checked_sub(1).map(|idx| order[idx].1);
    let next = order.get(destination + 1).map(|entry| entry.1);

    if let Some(key) = key_between(prev, next, moved.1, step) {
        return Ok(Some(ReorderPlan {
            moved_id: moved.0.clone(),
            updates: vec![OrderUpdate {
                id: moved.0.clone(),
                sort_order: key,
            }],
        }));
    }

    Ok(Some(ReorderPlan {
        moved_id: moved.0.clone(),
        updates: renumber(&order, step),
    }))
}

fn renumber(order: &[&(String, f64)], step: f64) -> Vec<OrderUpdate> {
    order
        .iter()
        .enumerate()
        .filter_map(|(idx, (id, current))| {
            let key = (idx as f64 + 1.0) * step;
            (*current != key).then(|| OrderUpdate {
                id: id.clone(),
                sort_order: key,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(orders: &[f64]) -> Vec<(String, f64)> {
        orders
            .iter()
            .enumerate()
            .map(|(idx, order)| (format!("t{idx}"), *order))
            .collect()
    }

    fn apply(items: &[(String, f64)], plan: &ReorderPlan) -> Vec<(String, f64)> {
        let mut out: Vec<(String, f64)> = items
            .iter()
            .map(|(id, order)| (id.clone(), plan.order_of(id).unwrap_or(*order)))
            .collect();
        out.sort_by(|a, b| compare_orders(a.1, b.1));
        out
    }

    #[test]
    fn same_index_is_noop() {
        let list = items(&[1000.0, 2000.0, 3000.0]);
        assert_eq!(plan_move(&list, 1, 1, DEFAULT_STEP).expect("plan"), None);
    }

    #[test]
    fn moved_item_lands_at_destination_for_every_pair() {
        let list = items(&[1000.0, 2000.0, 3000.0, 4000.0, 5000.0]);
        for source in 0..list.len() {
            for destination in 0..list.len() {
                let Some(plan) = plan_move(&list, source, destination, DEFAULT_STEP)
                    .expect("plan")
                else {
                    assert_eq!(source, destination);
                    continue;
                };
                assert_eq!(plan.updates.len(), 1);
                let sorted = apply(&list, &plan);
                assert_eq!(sorted[destination].0, list[source].0);
            }
        }
    }

    #[test]
    fn midpoint_between_neighbours() {
        let list = items(&[1000.0, 2000.0, 3000.0]);
        let plan = plan_move(&list, 0, 1, DEFAULT_STEP).expect("plan").expect("move");
        assert_eq!(plan.order_of("t0"), Some(2500.0));
    }

    #[test]
    fn edges_step_away_from_single_neighbour() {
        let list = items(&[1000.0, 2000.0, 3000.0]);
        let to_end = plan_move(&list, 0, 2, DEFAULT_STEP).expect("plan").expect("move");
        assert_eq!(to_end.order_of("t0"), Some(4000.0));
        let to_start = plan_move(&list, 2, 0, DEFAULT_STEP).expect("plan").expect("move");
        assert_eq!(to_start.order_of("t2"), Some(0.0));
    }

    #[test]
    fn equal_neighbours_fall_back_to_integer_steps() {
        let list = items(&[5.0, 7.0, 7.0, 9.0]);
        let plan = plan_move(&list, 0, 1, DEFAULT_STEP).expect("plan").expect("move");
        assert!(plan.is_renumber());
        let sorted = apply(&list, &plan);
        assert_eq!(sorted[1].0, "t0");
        for pair in sorted.windows(2) {
            assert!(pair[0].1 < pair[1].1);
        }
    }

    #[test]
    fn out_of_range_is_validation_error() {
        let list = items(&[1.0, 2.0]);
        let err = plan_move(&list, 0, 5, DEFAULT_STEP).expect_err("out of range");
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn prepend_and_append_keys() {
        assert_eq!(prepend_key([3000.0, 1000.0, f64::NAN], DEFAULT_STEP), 0.0);
        assert_eq!(prepend_key(std::iter::empty(), DEFAULT_STEP), DEFAULT_STEP);
        assert_eq!(append_key([3000.0, 1000.0], DEFAULT_STEP), 4000.0);
    }
}
