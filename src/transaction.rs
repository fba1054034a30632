use std::collections::HashSet;

use crate::graph::{Action, Delta};
use crate::model::Quad;

/// A staging batch of deltas to apply together in one atomic step.
///
/// Deltas are deduplicated: staging an add for a quad whose remove is
/// already staged cancels the remove instead (and vice versa). Order of
/// surviving deltas is preserved for replay.
#[derive(Debug, Default)]
pub struct Transaction {
    deltas: Vec<Delta>,
    staged: HashSet<Delta>,
}

impl Transaction {
    pub fn new() -> Transaction {
        Transaction::with_capacity(10)
    }

    pub fn with_capacity(n: usize) -> Transaction {
        Transaction {
            deltas: Vec::with_capacity(n),
            staged: HashSet::with_capacity(n),
        }
    }

    /// Stages an addition, unless the same quad's removal is staged, in
    /// which case the two annihilate.
    pub fn add_quad(&mut self, q: Quad) {
        let ad = Delta::add(q.clone());
        let rd = Delta::delete(q);
        if self.staged.contains(&ad) {
            return;
        }
        if self.staged.contains(&rd) {
            self.delete_delta(&rd);
        } else {
            self.add_delta(ad);
        }
    }

    /// Stages a removal, unless the same quad's addition is staged, in
    /// which case the two annihilate.
    pub fn remove_quad(&mut self, q: Quad) {
        let ad = Delta::add(q.clone());
        let rd = Delta::delete(q);
        if self.staged.contains(&ad) {
            self.delete_delta(&ad);
        } else if !self.staged.contains(&rd) {
            self.add_delta(rd);
        }
    }

    /// The staged deltas in staging order.
    pub fn deltas(&self) -> &[Delta] {
        &self.deltas
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    fn add_delta(&mut self, d: Delta) {
        self.deltas.push(d.clone());
        self.staged.insert(d);
    }

    fn delete_delta(&mut self, d: &Delta) {
        self.staged.remove(d);
        if let Some(pos) = self.deltas.iter().position(|x| x == d) {
            self.deltas.remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Value;

    fn quad(s: &str, p: &str, o: &str) -> Quad {
        Quad::new(Value::iri(s), Value::iri(p), Value::iri(o), None)
    }

    #[test]
    fn add_then_remove_annihilates() {
        let mut tx = Transaction::new();
        tx.add_quad(quad("a", "knows", "b"));
        tx.remove_quad(quad("a", "knows", "b"));
        assert!(tx.is_empty());
    }

    #[test]
    fn remove_then_add_annihilates() {
        let mut tx = Transaction::new();
        tx.remove_quad(quad("a", "knows", "b"));
        tx.add_quad(quad("a", "knows", "b"));
        assert!(tx.is_empty());
    }

    #[test]
    fn duplicate_adds_are_staged_once() {
        let mut tx = Transaction::new();
        tx.add_quad(quad("a", "knows", "b"));
        tx.add_quad(quad("a", "knows", "b"));
        assert_eq!(tx.len(), 1);
    }

    #[test]
    fn order_is_preserved() {
        let mut tx = Transaction::new();
        tx.add_quad(quad("a", "knows", "b"));
        tx.add_quad(quad("b", "knows", "c"));
        tx.remove_quad(quad("c", "knows", "d"));
        let actions: Vec<Action> = tx.deltas().iter().map(|d| d.action).collect();
        assert_eq!(actions, vec![Action::Add, Action::Add, Action::Delete]);
        assert_eq!(tx.deltas()[1].quad, quad("b", "knows", "c"));
    }
}
