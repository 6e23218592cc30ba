//! Structural sharing: merge structurally equal gates into a single node.

use rustc_hash::FxHashMap;

use crate::circuit::{Circuit, GateType};
use crate::Conflict;

/// Hash-consing key of a gate. Two gates are equal iff they have the same
/// type, the same cardinality bounds and the same child indices, with
/// commutative children pre-sorted so the comparison ignores their order.
#[derive(Clone, Eq, Hash, PartialEq)]
struct GateKey {
    typ: GateType,
    tmin: usize,
    tmax: usize,
    children: Vec<usize>,
}

/// Walk the DAG leaves-first and redirect every gate that duplicates an
/// already seen one. Determined values of merged gates are combined;
/// contradicting values are a [`Conflict`]. Input (`Var`) gates are never
/// merged.
pub fn share(c: &mut Circuit) -> Result<(), Conflict> {
    let mut table: FxHashMap<GateKey, usize> = FxHashMap::default();
    let mut done = vec![false; c.len()];
    for root in 0..c.len() {
        if done[root] || c.gate(root).is_deleted() {
            continue;
        }
        let mut stack: Vec<(usize, bool)> = vec![(root, false)];
        while let Some((g, expanded)) = stack.pop() {
            if done[g] || c.gate(g).is_deleted() {
                continue;
            }
            if !expanded {
                stack.push((g, true));
                for i in 0..c.gate(g).children.len() {
                    let ch = c.gate(g).children[i];
                    if !done[ch] {
                        stack.push((ch, false));
                    }
                }
                continue;
            }
            done[g] = true;
            if c.gate(g).typ == GateType::Var {
                continue;
            }
            if c.gate(g).typ.is_commutative() {
                c.gate_mut(g).children.sort_unstable();
            }
            let key = GateKey {
                typ: c.gate(g).typ,
                tmin: c.gate(g).tmin,
                tmax: c.gate(g).tmax,
                children: c.gate(g).children.clone(),
            };
            match table.get(&key) {
                Some(&existing) => merge(c, g, existing)?,
                None => {
                    table.insert(key, g);
                }
            }
        }
    }
    Ok(())
}

/// Unify `dup` into `existing`: combine determined values, move every
/// incoming edge and every handle over, and mark `dup` deleted.
fn merge(c: &mut Circuit, dup: usize, existing: usize) -> Result<(), Conflict> {
    debug_assert_ne!(dup, existing);
    if c.gate(dup).determined {
        let v = c.gate(dup).value;
        if c.gate(existing).determined {
            if c.gate(existing).value != v {
                return Err(Conflict);
            }
        } else {
            c.gate_mut(existing).determined = true;
            c.gate_mut(existing).value = v;
            c.push(existing);
        }
    }
    c.remove_all_children(dup);
    c.redirect_parents(dup, existing);
    c.migrate_handles(dup, existing);
    c.gate_mut(dup).typ = GateType::Deleted;
    c.changed = true;
    Ok(())
}
