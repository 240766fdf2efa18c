//! Queue ordering for dequeue.
//!
//! Weights are reduced by their GCD first, so `{a: 6, b: 3}` and `{a: 2, b: 1}` behave the same.

use std::collections::BTreeMap;

use rand::Rng;
use rand::seq::SliceRandom;

#[derive(Debug, Clone)]
pub(crate) struct QueueOrder {
    weights: BTreeMap<String, u32>,
    strict: bool,
    /// Precomputed order for strict priority: weight desc, then name.
    by_priority: Vec<String>,
}

impl QueueOrder {
    pub(crate) fn new(queues: &BTreeMap<String, u32>, strict: bool) -> Self {
        let weights = normalize(queues);
        let mut by_priority: Vec<(&String, &u32)> = weights.iter().collect();
        by_priority.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        let by_priority = by_priority.into_iter().map(|(q, _)| q.clone()).collect();
        Self {
            weights,
            strict,
            by_priority,
        }
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.weights.keys().cloned().collect()
    }

    /// Order in which to try the queues for one dequeue.
    pub(crate) fn next<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<String> {
        if self.weights.len() <= 1 || self.strict {
            return self.by_priority.clone();
        }
        let mut slots: Vec<&String> = self
            .weights
            .iter()
            .flat_map(|(q, w)| std::iter::repeat_n(q, *w as usize))
            .collect();
        slots.shuffle(rng);

        let mut order: Vec<String> = Vec::with_capacity(self.weights.len());
        for q in slots {
            if !order.contains(q) {
                order.push(q.clone());
                if order.len() == self.weights.len() {
                    break;
                }
            }
        }
        order
    }
}

/// Divide every weight by the GCD of all of them. Zero weights are dropped.
pub(crate) fn normalize(queues: &BTreeMap<String, u32>) -> BTreeMap<String, u32> {
    let divisor = queues
        .values()
        .copied()
        .filter(|w| *w > 0)
        .fold(0, gcd);
    if divisor == 0 {
        return BTreeMap::new();
    }
    queues
        .iter()
        .filter(|(_, w)| **w > 0)
        .map(|(q, w)| (q.clone(), w / divisor))
        .collect()
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 { a } else { gcd(b, a % b) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rstest::rstest;

    fn weights(pairs: &[(&str, u32)]) -> BTreeMap<String, u32> {
        pairs.iter().map(|(q, w)| (q.to_string(), *w)).collect()
    }

    #[rstest]
    #[case::common_divisor(&[("a", 6), ("b", 3)], &[("a", 2), ("b", 1)])]
    #[case::coprime(&[("a", 3), ("b", 2)], &[("a", 3), ("b", 2)])]
    #[case::zero_dropped(&[("a", 4), ("b", 0)], &[("a", 1)])]
    #[case::all_zero(&[("a", 0)], &[])]
    fn normalize_by_gcd(#[case] input: &[(&str, u32)], #[case] want: &[(&str, u32)]) {
        assert_eq!(normalize(&weights(input)), weights(want));
    }

    #[test]
    fn strict_priority_orders_by_weight() {
        let order = QueueOrder::new(&weights(&[("low", 1), ("critical", 6), ("default", 3)]), true);
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(order.next(&mut rng), ["critical", "default", "low"]);
    }

    #[test]
    fn single_queue_is_returned_as_is() {
        let order = QueueOrder::new(&weights(&[("only", 5)]), false);
        assert_eq!(order.next(&mut StdRng::seed_from_u64(1)), ["only"]);
    }

    #[test]
    fn weighted_order_is_a_deduplicated_permutation() {
        let order = QueueOrder::new(&weights(&[("a", 6), ("b", 3), ("c", 1)]), false);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..50 {
            let mut got = order.next(&mut rng);
            got.sort();
            assert_eq!(got, ["a", "b", "c"]);
        }
    }

    #[test]
    fn heavier_queues_come_first_more_often() {
        let order = QueueOrder::new(&weights(&[("heavy", 9), ("light", 1)]), false);
        let mut rng = StdRng::seed_from_u64(3);
        let heavy_first = (0..1000)
            .filter(|_| order.next(&mut rng)[0] == "heavy")
            .count();
        assert!(heavy_first > 800, "heavy first {heavy_first} times");
    }
}
