//! Stochastic traversal of the DAG: tip selection and confidence.
//!
//! The biased random walk descends from a starting node toward a tip,
//! preferring children whose cumulative weight is close to the current
//! node's — heavier subtrees attract more walks. The same walk powers both
//! parent selection for freshly authored transactions and the confirmation
//! confidence of an existing one.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use rand::Rng;

use crate::constants::{
    CONFIDENCE_DEPTH_MARGIN, CONFIDENCE_WALK_SET, DEFAULT_WALK_ALPHA, PARENT_COUNT, WALK_EPSILON,
};
use crate::crypto::keys::PublicKey;
use crate::hash::TxHash;
use crate::tangle::{Tangle, TangleError, TransactionNode};

/// Walk from `start` toward a tip, biased by cumulative weight.
///
/// At each node with children and cumulative weight `W`, child `c` is chosen
/// with probability proportional to `max(ε, exp(-alpha · (W - W_c)))`. The
/// ε floor keeps the distribution well-defined when the exponential
/// underflows. Terminates at the first node with no children.
pub fn biased_random_walk(
    start: &Arc<TransactionNode>,
    alpha: f64,
) -> Arc<TransactionNode> {
    biased_random_walk_with(start, alpha, 0.0)
}

/// Biased random walk with an optional upward step: with probability
/// `step_back_prob` the walk moves to a random parent instead of descending.
/// The default of zero disables the branch.
pub fn biased_random_walk_with(
    start: &Arc<TransactionNode>,
    alpha: f64,
    step_back_prob: f64,
) -> Arc<TransactionNode> {
    let mut rng = rand::thread_rng();
    let mut current = Arc::clone(start);
    loop {
        if step_back_prob > 0.0
            && !current.parents().is_empty()
            && rng.gen::<f64>() < step_back_prob
        {
            let parents = current.parents();
            current = Arc::clone(&parents[rng.gen_range(0..parents.len())]);
            continue;
        }

        let children = current.children();
        if children.is_empty() {
            return current;
        }

        let weight = current.cumulative_weight();
        let step_weights: Vec<f64> = children
            .iter()
            .map(|c| (-alpha * (weight - c.cumulative_weight())).exp().max(WALK_EPSILON))
            .collect();
        let total: f64 = step_weights.iter().sum();

        let roll: f64 = rng.gen_range(0.0..total);
        let mut cumulative = 0.0;
        let mut chosen = children.len() - 1;
        for (i, w) in step_weights.iter().enumerate() {
            cumulative += w;
            if roll <= cumulative {
                chosen = i;
                break;
            }
        }
        current = Arc::clone(&children[chosen]);
    }
}

/// Distance from the genesis: 0 for the genesis, otherwise one more than the
/// furthest parent.
pub fn height(node: &Arc<TransactionNode>) -> u64 {
    solve_longest(node, |n| n.parents().to_vec(), |n| n.is_genesis())
}

/// Distance to the tip frontier: 0 for a tip, otherwise one more than the
/// deepest child.
pub fn depth(node: &Arc<TransactionNode>) -> u64 {
    solve_longest(node, |n| n.children(), |n| n.is_tip())
}

/// Own weight plus the scores of the direct parents, following the
/// recursive definition (shared ancestors count once per path).
pub fn score(node: &Arc<TransactionNode>) -> f64 {
    let mut memo: HashMap<TxHash, f64> = HashMap::new();
    let mut stack = vec![Arc::clone(node)];
    while let Some(current) = stack.last().cloned() {
        if memo.contains_key(&current.hash()) {
            stack.pop();
            continue;
        }
        let pending: Vec<_> = current
            .parents()
            .iter()
            .filter(|p| !memo.contains_key(&p.hash()))
            .cloned()
            .collect();
        if pending.is_empty() {
            let parent_sum: f64 = current
                .parents()
                .iter()
                .map(|p| memo.get(&p.hash()).copied().unwrap_or(0.0))
                .sum();
            memo.insert(current.hash(), current.own_weight() + parent_sum);
            stack.pop();
        } else {
            stack.extend(pending);
        }
    }
    memo.get(&node.hash()).copied().unwrap_or(0.0)
}

/// Iterative longest-path solver shared by [`height`] and [`depth`].
fn solve_longest(
    node: &Arc<TransactionNode>,
    neighbors: impl Fn(&Arc<TransactionNode>) -> Vec<Arc<TransactionNode>>,
    is_base: impl Fn(&Arc<TransactionNode>) -> bool,
) -> u64 {
    let mut memo: HashMap<TxHash, u64> = HashMap::new();
    let mut stack = vec![Arc::clone(node)];
    while let Some(current) = stack.last().cloned() {
        if memo.contains_key(&current.hash()) {
            stack.pop();
            continue;
        }
        if is_base(&current) {
            memo.insert(current.hash(), 0);
            stack.pop();
            continue;
        }
        let next = neighbors(&current);
        let pending: Vec<_> = next
            .iter()
            .filter(|n| !memo.contains_key(&n.hash()))
            .cloned()
            .collect();
        if pending.is_empty() {
            let best = next
                .iter()
                .map(|n| memo.get(&n.hash()).copied().unwrap_or(0))
                .max()
                .unwrap_or(0);
            memo.insert(current.hash(), 1 + best);
            stack.pop();
        } else {
            stack.extend(pending);
        }
    }
    memo.get(&node.hash()).copied().unwrap_or(0)
}

impl Tangle {
    /// Walk from the genesis toward a tip with the given bias.
    pub fn random_walk(&self, alpha: f64) -> Arc<TransactionNode> {
        biased_random_walk(&self.genesis(), alpha)
    }

    /// Select parents for a new transaction: independent walks from the
    /// genesis, deduplicated. Always returns at least one node.
    pub fn select_parents(&self, alpha: f64) -> Vec<Arc<TransactionNode>> {
        let mut chosen: Vec<Arc<TransactionNode>> = Vec::with_capacity(PARENT_COUNT);
        let mut seen = HashSet::new();
        for _ in 0..PARENT_COUNT {
            let tip = self.random_walk(alpha);
            if seen.insert(tip.hash()) {
                chosen.push(tip);
            }
        }
        chosen
    }

    /// Fraction of biased random walks that end on a tip descending from
    /// `target`, in `[0, 1]`.
    ///
    /// The walks start from the ancestor frontier a few levels behind the
    /// target (its depth plus a margin); when the requested distance exceeds
    /// the DAG height the genesis stands in alone. Entries are replicated to
    /// reach the minimum walk-set size.
    pub fn confirmation_confidence(&self, target: &Arc<TransactionNode>) -> f64 {
        let levels = depth(target) + CONFIDENCE_DEPTH_MARGIN;
        let mut frontier = vec![Arc::clone(target)];
        for _ in 0..levels {
            let mut next = Vec::new();
            let mut seen = HashSet::new();
            for node in &frontier {
                for parent in node.parents() {
                    if seen.insert(parent.hash()) {
                        next.push(Arc::clone(parent));
                    }
                }
            }
            if next.is_empty() {
                frontier = vec![self.genesis()];
                break;
            }
            frontier = next;
        }

        let base = frontier.clone();
        let mut fill = 0usize;
        while frontier.len() < CONFIDENCE_WALK_SET {
            frontier.push(Arc::clone(&base[fill % base.len()]));
            fill += 1;
        }

        let hits = frontier
            .iter()
            .filter(|entry| {
                let tip = biased_random_walk(entry, DEFAULT_WALK_ALPHA);
                target.has_descendant(tip.hash())
            })
            .count();
        hits as f64 / frontier.len() as f64
    }

    /// Balance counting only transactions whose confirmation confidence
    /// meets `min_confidence`. Advisory: unlike
    /// [`Tangle::query_balance`], partial sums are not treated as
    /// corruption, because skipping low-confidence credits can legitimately
    /// expose their spends.
    pub fn query_balance_with_confidence(
        &self,
        account: &PublicKey,
        min_confidence: f64,
    ) -> Result<f64, TangleError> {
        if min_confidence <= 0.0 {
            return self.query_balance(account);
        }
        let fingerprint = account.fingerprint();
        let genesis = self.genesis();
        let mut queue = VecDeque::from([Arc::clone(&genesis)]);
        let mut visited = HashSet::from([genesis.hash()]);
        let mut balance = 0.0_f64;
        while let Some(node) = queue.pop_front() {
            let counted =
                node.is_genesis() || self.confirmation_confidence(&node) >= min_confidence;
            if counted {
                let tx = node.transaction();
                for output in &tx.outputs {
                    if output.account.fingerprint() == fingerprint {
                        balance += output.amount;
                    }
                }
                for input in &tx.inputs {
                    if input.account.fingerprint() == fingerprint {
                        balance -= input.amount;
                    }
                }
            }
            for child in node.children() {
                if visited.insert(child.hash()) {
                    queue.push_back(child);
                }
            }
        }
        Ok(balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::KeyPair;
    use crate::transaction::{Transaction, TransactionBuilder, TxOutput};

    fn build_tangle(chain_len: usize) -> (Tangle, KeyPair, Vec<TxHash>) {
        let k = KeyPair::generate();
        let tangle = Tangle::with_update_weights(
            Transaction::genesis(vec![TxOutput {
                account: k.public().clone(),
                amount: 1e9,
            }]),
            false,
        )
        .unwrap();
        let mut hashes = vec![tangle.genesis().hash()];
        for _ in 0..chain_len {
            let parent = *hashes.last().unwrap();
            let tx = TransactionBuilder::new()
                .add_input(&k, 1.0)
                .add_output(k.public().clone(), 1.0)
                .parent(parent)
                .difficulty(1)
                .build()
                .unwrap();
            let node = tangle.resolve_node(tx).unwrap();
            hashes.push(tangle.add(node).unwrap());
        }
        (tangle, k, hashes)
    }

    #[test]
    fn walk_terminates_at_a_tip() {
        let (tangle, _, _) = build_tangle(6);
        tangle.update_weights_from_tips();
        for _ in 0..50 {
            let tip = tangle.random_walk(DEFAULT_WALK_ALPHA);
            assert!(tip.is_tip());
        }
    }

    #[test]
    fn walk_from_a_tip_returns_it() {
        let (tangle, _, hashes) = build_tangle(3);
        let tip = tangle.find(*hashes.last().unwrap()).unwrap();
        let result = biased_random_walk(&tip, DEFAULT_WALK_ALPHA);
        assert_eq!(result.hash(), tip.hash());
    }

    #[test]
    fn height_depth_score_on_a_chain() {
        let (tangle, _, hashes) = build_tangle(4);
        let genesis = tangle.genesis();
        let middle = tangle.find(hashes[2]).unwrap();
        let tip = tangle.find(hashes[4]).unwrap();

        assert_eq!(height(&genesis), 0);
        assert_eq!(height(&middle), 2);
        assert_eq!(height(&tip), 4);

        assert_eq!(depth(&tip), 0);
        assert_eq!(depth(&middle), 2);
        assert_eq!(depth(&genesis), 4);

        // Chain of four difficulty-1 nodes: each adds 0.2; genesis adds nothing.
        assert!((score(&tip) - 0.8).abs() < 1e-9);
        assert!((score(&genesis) - 0.0).abs() < 1e-9);
    }

    #[test]
    fn confidence_is_one_on_a_single_chain() {
        let (tangle, _, hashes) = build_tangle(4);
        tangle.update_weights_from_tips();
        let middle = tangle.find(hashes[2]).unwrap();
        // Every walk on a chain ends at the single tip, which descends from
        // every node.
        assert!((tangle.confirmation_confidence(&middle) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn select_parents_returns_tips() {
        let (tangle, _, _) = build_tangle(3);
        tangle.update_weights_from_tips();
        let parents = tangle.select_parents(DEFAULT_WALK_ALPHA);
        assert!(!parents.is_empty());
        assert!(parents.len() <= PARENT_COUNT);
        for p in &parents {
            assert!(p.is_tip());
        }
    }
}
