//! Splitting of quad deltas into per-node refcount updates and per-quad
//! add/delete records, keyed by value hash.

use std::collections::HashMap;

use crate::graph::{Action, Delta};
use crate::model::{Quad, Value, ValueHash};

/// A pending refcount change for one value, aggregated across the batch.
#[derive(Debug, Clone)]
pub struct NodeUpdate {
    pub hash: ValueHash,
    pub val: Value,
    pub ref_inc: i64,
}

/// One quad mutation with its direction hashes. `ind` points back into
/// the caller's delta slice for error reporting.
#[derive(Debug, Clone)]
pub struct QuadUpdate {
    pub ind: usize,
    pub quad: [Option<ValueHash>; 4],
    pub del: bool,
}

#[derive(Debug, Default)]
pub struct Deltas {
    pub inc_node: Vec<NodeUpdate>,
    pub dec_node: Vec<NodeUpdate>,
    pub quad_add: Vec<QuadUpdate>,
    pub quad_del: Vec<QuadUpdate>,
}

#[derive(Debug, Default)]
struct NodeAgg {
    updates: Vec<NodeUpdate>,
    by_hash: HashMap<ValueHash, usize>,
}

impl NodeAgg {
    fn bump(&mut self, v: &Value, inc: i64) -> ValueHash {
        let hash = v.hash();
        match self.by_hash.get(&hash) {
            Some(&i) => self.updates[i].ref_inc += inc,
            None => {
                self.by_hash.insert(hash, self.updates.len());
                self.updates.push(NodeUpdate {
                    hash,
                    val: v.clone(),
                    ref_inc: inc,
                });
            }
        }
        hash
    }
}

fn quad_update(agg: &mut NodeAgg, ind: usize, q: &Quad, inc: i64, del: bool) -> QuadUpdate {
    let mut dirs: [Option<ValueHash>; 4] = [None; 4];
    for (i, d) in crate::model::Direction::ALL.iter().enumerate() {
        if let Some(v) = q.get(*d) {
            dirs[i] = Some(agg.bump(v, inc));
        }
    }
    QuadUpdate {
        ind,
        quad: dirs,
        del,
    }
}

/// Splits a batch of deltas into node refcount updates (one per distinct
/// value, increments and decrements kept apart) and quad updates.
pub fn split_deltas(deltas: &[Delta]) -> Deltas {
    let mut inc = NodeAgg::default();
    let mut dec = NodeAgg::default();
    let mut out = Deltas::default();
    for (ind, d) in deltas.iter().enumerate() {
        match d.action {
            Action::Add => {
                let qu = quad_update(&mut inc, ind, &d.quad, 1, false);
                out.quad_add.push(qu);
            }
            Action::Delete => {
                let qu = quad_update(&mut dec, ind, &d.quad, -1, true);
                out.quad_del.push(qu);
            }
        }
    }
    out.inc_node = inc.updates;
    out.dec_node = dec.updates;
    out
}

/// The add-only split used by the streaming writer.
pub fn insert_quads(quads: &[Quad]) -> Deltas {
    let mut inc = NodeAgg::default();
    let mut out = Deltas::default();
    for (ind, q) in quads.iter().enumerate() {
        let qu = quad_update(&mut inc, ind, q, 1, false);
        out.quad_add.push(qu);
    }
    out.inc_node = inc.updates;
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iri(s: &str) -> Value {
        Value::iri(s)
    }

    #[test]
    fn shared_values_aggregate_refcounts() {
        let deltas = vec![
            Delta::add(Quad::new(iri("a"), iri("p"), iri("b"), None)),
            Delta::add(Quad::new(iri("a"), iri("p"), iri("c"), None)),
        ];
        let split = split_deltas(&deltas);
        assert_eq!(split.quad_add.len(), 2);
        assert!(split.quad_del.is_empty());
        let a = split
            .inc_node
            .iter()
            .find(|n| n.val == iri("a"))
            .expect("a present");
        assert_eq!(a.ref_inc, 2);
        let p = split
            .inc_node
            .iter()
            .find(|n| n.val == iri("p"))
            .expect("p present");
        assert_eq!(p.ref_inc, 2);
        assert_eq!(split.inc_node.len(), 4); // a, p, b, c
    }

    #[test]
    fn deletions_decrement() {
        let deltas = vec![Delta::delete(Quad::new(iri("a"), iri("p"), iri("b"), None))];
        let split = split_deltas(&deltas);
        assert!(split.quad_add.is_empty());
        assert_eq!(split.quad_del.len(), 1);
        assert!(split.quad_del[0].del);
        assert!(split.dec_node.iter().all(|n| n.ref_inc == -1));
        // label absent
        assert_eq!(split.quad_del[0].quad[3], None);
    }
}
