use std::collections::VecDeque;

use tracing::debug;

use crate::Conflict;

/// The Boolean function computed by a gate.
///
/// `Threshold` and `AtLeast` carry their bounds in the gate's `tmin`/`tmax`
/// fields. `Undef` only exists transiently inside the parser (a forward
/// reference whose definition has not been seen yet); `Deleted` marks a gate
/// that has been structurally replaced and must be skipped by every pass.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum GateType {
    False,
    True,
    Var,
    Ref,
    Not,
    Or,
    And,
    Equiv,
    Odd,
    Even,
    Ite,
    Threshold,
    AtLeast,
    Undef,
    Deleted,
}

impl GateType {
    /// Child order is irrelevant for these types. They are still kept in a
    /// stable order between rewrites so that structural hashing is
    /// deterministic.
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            GateType::Or
                | GateType::And
                | GateType::Equiv
                | GateType::Odd
                | GateType::Even
                | GateType::Threshold
                | GateType::AtLeast
        )
    }
}

/// An external reference to a gate. Handles do not affect semantics; they
/// carry symbolic names through rewriting so that the emitted CNF can map
/// names back to literals. On gate unification handles are moved, never
/// copied, to the surviving gate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Handle {
    Name(String),
}

impl Handle {
    pub fn name(&self) -> &str {
        match self {
            Handle::Name(n) => n,
        }
    }
}

/// A node of the constraint circuit.
///
/// `children` is ordered (the order is semantic for `Ite`); `parents` holds
/// one entry per incoming edge, so a gate appearing twice among the children
/// of the same parent is backed by two parent entries. The two sides are kept
/// in sync by the edge API on [`Circuit`].
#[derive(Clone, Debug)]
pub struct Gate {
    pub typ: GateType,
    pub children: Vec<usize>,
    pub parents: Vec<usize>,
    pub handles: Vec<Handle>,
    /// `determined` pins the gate to `value`. Once set, an attempt to pin the
    /// opposite value is a conflict (the circuit is unsatisfiable).
    pub determined: bool,
    pub value: bool,
    /// Lower cardinality bound of `Threshold`/`AtLeast` gates.
    pub tmin: usize,
    /// Upper cardinality bound of `Threshold` gates.
    pub tmax: usize,
    /// Polarity-reachability flags, written only by the polarity analysis.
    pub mir_pos: bool,
    pub mir_neg: bool,
}

impl Gate {
    fn new(typ: GateType) -> Gate {
        Gate {
            typ,
            children: Vec::new(),
            parents: Vec::new(),
            handles: Vec::new(),
            determined: false,
            value: false,
            tmin: 0,
            tmax: 0,
            mir_pos: false,
            mir_neg: false,
        }
    }

    /// The first symbolic name attached to this gate, if any.
    pub fn first_name(&self) -> Option<&str> {
        self.handles.first().map(|h| h.name())
    }

    pub fn is_deleted(&self) -> bool {
        self.typ == GateType::Deleted
    }

    /// Number of determined-true, determined-false and undetermined children.
    fn child_info(&self, gates: &[Gate]) -> (usize, usize, usize) {
        let mut nof_true = 0;
        let mut nof_false = 0;
        let mut nof_undet = 0;
        for &ch in &self.children {
            let child = &gates[ch];
            if child.determined {
                if child.value {
                    nof_true += 1;
                } else {
                    nof_false += 1;
                }
            } else {
                nof_undet += 1;
            }
        }
        (nof_true, nof_false, nof_undet)
    }
}

/// The gate store. Owns every gate of the DAG; gates are addressed by their
/// dense `index` assigned on install and never reused. Deleted gates stay in
/// the store (keeping indices stable) until the circuit is dropped.
///
/// The propagation stack `pstack` is the only scheduler of the simplifier:
/// every rewrite that changes a gate or its neighbourhood enqueues the
/// affected gates for re-simplification.
#[derive(Clone, Debug)]
pub struct Circuit {
    gates: Vec<Gate>,
    pstack: Vec<usize>,
    in_pstack: Vec<bool>,
    /// Gates the input file constrains to true, in file order.
    pub assigned_to_true: VecDeque<usize>,
    /// Gates the input file constrains to false, in file order.
    pub assigned_to_false: VecDeque<usize>,
    /// Set by any rewrite that changed the DAG; used for fixed-point
    /// detection when alternating simplification and sharing.
    pub changed: bool,
    /// False when the caller asked to preserve all satisfying assignments,
    /// which forbids rewrites that touch input (`Var`) gates.
    pub may_transform_input_gates: bool,
}

impl Circuit {
    pub fn new() -> Circuit {
        Circuit {
            gates: Vec::new(),
            pstack: Vec::new(),
            in_pstack: Vec::new(),
            assigned_to_true: VecDeque::new(),
            assigned_to_false: VecDeque::new(),
            changed: false,
            may_transform_input_gates: true,
        }
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    pub fn gate(&self, g: usize) -> &Gate {
        &self.gates[g]
    }

    pub fn gate_mut(&mut self, g: usize) -> &mut Gate {
        &mut self.gates[g]
    }

    /// Number of non-deleted gates.
    pub fn count_gates(&self) -> usize {
        self.gates.iter().filter(|g| !g.is_deleted()).count()
    }

    /// Install a fresh gate and return its index.
    pub fn install(&mut self, typ: GateType, children: Vec<usize>) -> usize {
        match typ {
            GateType::Ref | GateType::Not => debug_assert_eq!(children.len(), 1),
            GateType::Ite => debug_assert_eq!(children.len(), 3),
            GateType::False | GateType::True | GateType::Var | GateType::Undef => {
                debug_assert!(children.is_empty())
            }
            _ => debug_assert!(!children.is_empty()),
        }
        let index = self.gates.len();
        self.gates.push(Gate::new(typ));
        self.in_pstack.push(false);
        for ch in children {
            self.add_child(index, ch);
        }
        index
    }

    /// Install a `Threshold` gate with bounds `[tmin, tmax]`.
    pub fn install_threshold(&mut self, tmin: usize, tmax: usize, children: Vec<usize>) -> usize {
        let g = self.install(GateType::Threshold, children);
        self.gates[g].tmin = tmin;
        self.gates[g].tmax = tmax;
        g
    }

    /// Install an `AtLeast` gate with lower bound `tmin`.
    pub fn install_atleast(&mut self, tmin: usize, children: Vec<usize>) -> usize {
        let g = self.install(GateType::AtLeast, children);
        self.gates[g].tmin = tmin;
        g
    }

    /// Add an edge making `child` the last child of `parent`.
    pub fn add_child(&mut self, parent: usize, child: usize) {
        self.gates[parent].children.push(child);
        self.gates[child].parents.push(parent);
    }

    /// Remove the edge at `pos` in `parent`'s child list, returning the
    /// former child. The child is pushed on the propagation stack when the
    /// removal orphaned it.
    pub fn remove_child_at(&mut self, parent: usize, pos: usize) -> usize {
        let child = self.gates[parent].children.remove(pos);
        let back = self.gates[child]
            .parents
            .iter()
            .position(|&p| p == parent)
            .expect("edge missing its parent backlink");
        self.gates[child].parents.swap_remove(back);
        if self.gates[child].parents.is_empty() {
            self.push(child);
        }
        child
    }

    /// Unlink every child edge of `parent`, pushing orphaned children.
    pub fn remove_all_children(&mut self, parent: usize) {
        while !self.gates[parent].children.is_empty() {
            let last = self.gates[parent].children.len() - 1;
            self.remove_child_at(parent, last);
        }
    }

    /// Rewire the edge at `pos` in `parent`'s child list to `new_child`.
    pub fn replace_child_at(&mut self, parent: usize, pos: usize, new_child: usize) {
        let old = self.gates[parent].children[pos];
        let back = self.gates[old]
            .parents
            .iter()
            .position(|&p| p == parent)
            .expect("edge missing its parent backlink");
        self.gates[old].parents.swap_remove(back);
        self.gates[parent].children[pos] = new_child;
        self.gates[new_child].parents.push(parent);
    }

    /// Move every incoming edge of `from` over to `to`. Used when `from` is
    /// unified with `to`; the caller is responsible for migrating handles and
    /// marking `from` deleted.
    pub fn redirect_parents(&mut self, from: usize, to: usize) {
        while let Some(&parent) = self.gates[from].parents.last() {
            let pos = self.gates[parent]
                .children
                .iter()
                .position(|&c| c == from)
                .expect("edge missing its child link");
            self.replace_child_at(parent, pos, to);
        }
    }

    /// Move all handles of `from` to `to`.
    pub fn migrate_handles(&mut self, from: usize, to: usize) {
        let mut handles = std::mem::take(&mut self.gates[from].handles);
        self.gates[to].handles.append(&mut handles);
    }

    /// Turn `g` into a determined constant, unlinking all of its children.
    /// The caller must already have checked that a previously determined
    /// value agrees with `v`.
    pub fn transform_into_constant(&mut self, g: usize, v: bool) {
        let gate = &mut self.gates[g];
        if gate.determined {
            assert_eq!(gate.value, v, "constant transform against determined value");
        } else {
            gate.determined = true;
            gate.value = v;
        }
        gate.typ = if v { GateType::True } else { GateType::False };
        gate.tmin = 0;
        gate.tmax = 0;
        self.remove_all_children(g);
        self.changed = true;
    }

    /// Request re-simplification of `g`. No-op if already queued.
    pub fn push(&mut self, g: usize) {
        if !self.in_pstack[g] {
            self.in_pstack[g] = true;
            self.pstack.push(g);
        }
    }

    pub fn pop(&mut self) -> Option<usize> {
        let g = self.pstack.pop()?;
        self.in_pstack[g] = false;
        Some(g)
    }

    pub fn in_pstack(&self, g: usize) -> bool {
        self.in_pstack[g]
    }

    /// Push every parent of `g`.
    pub fn push_parents(&mut self, g: usize) {
        for i in 0..self.gates[g].parents.len() {
            let p = self.gates[g].parents[i];
            self.push(p);
        }
    }

    /// Push every child of `g`.
    pub fn push_children(&mut self, g: usize) {
        for i in 0..self.gates[g].children.len() {
            let c = self.gates[g].children[i];
            self.push(c);
        }
    }

    /// Determined-true, determined-false and undetermined child counts of `g`.
    pub(crate) fn child_info(&self, g: usize) -> (usize, usize, usize) {
        self.gates[g].child_info(&self.gates)
    }

    /// True iff `b` is in the transitive child-closure of `a`.
    pub fn depends_on(&self, a: usize, b: usize) -> bool {
        let mut visited = vec![false; self.gates.len()];
        let mut stack = vec![a];
        while let Some(g) = stack.pop() {
            for &ch in &self.gates[g].children {
                if ch == b {
                    return true;
                }
                if !visited[ch] {
                    visited[ch] = true;
                    stack.push(ch);
                }
            }
        }
        false
    }

    /// Constrain `g` to true; [`Conflict`] if it is already pinned false.
    pub fn force_true(&mut self, g: usize) -> Result<(), Conflict> {
        self.force(g, true)
    }

    /// Constrain `g` to false; [`Conflict`] if it is already pinned true.
    pub fn force_false(&mut self, g: usize) -> Result<(), Conflict> {
        self.force(g, false)
    }

    fn force(&mut self, g: usize, v: bool) -> Result<(), Conflict> {
        let gate = &mut self.gates[g];
        if gate.determined {
            if gate.value != v {
                return Err(Conflict);
            }
        } else {
            gate.determined = true;
            gate.value = v;
        }
        self.push(g);
        self.push_parents(g);
        Ok(())
    }

    /// Drain the two initial-constraint queues populated by the parser,
    /// the force-true queue first.
    pub fn apply_assignments(&mut self) -> Result<(), Conflict> {
        while let Some(g) = self.assigned_to_true.pop_front() {
            self.force_true(g)?;
        }
        while let Some(g) = self.assigned_to_false.pop_front() {
            self.force_false(g)?;
        }
        Ok(())
    }

    /// Drop every name handle whose name starts with `_`. Such names are
    /// internal to the producing tool and must not leak into the DIMACS
    /// name-map comments.
    pub fn remove_underscore_names(&mut self) {
        for gate in &mut self.gates {
            gate.handles.retain(|h| !h.name().starts_with('_'));
        }
    }

    /// First names of all input (`Var`) gates, in installation order.
    pub fn input_gate_names(&self) -> Vec<&str> {
        self.gates
            .iter()
            .filter(|g| g.typ == GateType::Var)
            .filter_map(|g| g.first_name())
            .collect()
    }

    /// Verify that the DAG is acyclic. On failure returns the names found on
    /// one cycle (possibly empty if the cycle runs through unnamed gates).
    pub fn check_acyclic(&self) -> Result<(), Vec<String>> {
        const WHITE: u8 = 0;
        const GREY: u8 = 1;
        const BLACK: u8 = 2;
        let mut color = vec![WHITE; self.gates.len()];
        for root in 0..self.gates.len() {
            if color[root] != WHITE {
                continue;
            }
            // Iterative DFS keeping the grey path explicit so a cycle can be
            // reported with the names along it.
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
            color[root] = GREY;
            while let Some(&mut (g, ref mut cursor)) = stack.last_mut() {
                if *cursor < self.gates[g].children.len() {
                    let ch = self.gates[g].children[*cursor];
                    *cursor += 1;
                    match color[ch] {
                        WHITE => {
                            color[ch] = GREY;
                            stack.push((ch, 0));
                        }
                        GREY => {
                            let mut names: Vec<String> = Vec::new();
                            for &(on_path, _) in
                                stack.iter().skip_while(|&&(n, _)| n != ch)
                            {
                                if let Some(n) = self.gates[on_path].first_name() {
                                    names.push(n.to_string());
                                }
                            }
                            return Err(names);
                        }
                        _ => debug_assert_eq!(color[ch], BLACK),
                    }
                } else {
                    color[g] = BLACK;
                    stack.pop();
                }
            }
        }
        Ok(())
    }

    /// Local truth-table check: does the determined value of `g` follow from
    /// the determined values of its children alone? Only gates that are
    /// determined but not justified need CNF clauses; justified constraints
    /// are already explained by their cone.
    pub fn is_justified(&self, g: usize) -> bool {
        let gate = &self.gates[g];
        if !gate.determined {
            return false;
        }
        let (nof_true, nof_false, nof_undet) = gate.child_info(&self.gates);
        let nof_children = nof_true + nof_false + nof_undet;
        match gate.typ {
            GateType::False | GateType::True | GateType::Var => true,
            GateType::Ref => {
                (gate.value && nof_true > 0) || (!gate.value && nof_false > 0)
            }
            GateType::Not => {
                (gate.value && nof_false > 0) || (!gate.value && nof_true > 0)
            }
            GateType::Equiv => {
                if gate.value {
                    nof_children == 1
                        || nof_true == nof_children
                        || nof_false == nof_children
                } else {
                    nof_true > 0 && nof_false > 0
                }
            }
            GateType::Or => {
                if gate.value {
                    nof_true > 0
                } else {
                    nof_false == nof_children
                }
            }
            GateType::And => {
                if gate.value {
                    nof_true == nof_children
                } else {
                    nof_false > 0
                }
            }
            GateType::Odd => {
                nof_undet == 0 && (nof_true % 2 == 1) == gate.value
            }
            GateType::Even => {
                nof_undet == 0 && (nof_true % 2 == 0) == gate.value
            }
            GateType::Ite => {
                let i = &self.gates[gate.children[0]];
                let t = &self.gates[gate.children[1]];
                let e = &self.gates[gate.children[2]];
                let known = |g: &Gate, v: bool| g.determined && g.value == v;
                if gate.value {
                    (known(i, true) && known(t, true))
                        || (known(i, false) && known(e, true))
                        || (known(t, true) && known(e, true))
                } else {
                    (known(i, true) && known(t, false))
                        || (known(i, false) && known(e, false))
                        || (known(t, false) && known(e, false))
                }
            }
            GateType::Threshold => {
                if gate.value {
                    gate.tmin <= nof_true && nof_children - nof_false <= gate.tmax
                } else {
                    nof_true > gate.tmax || nof_children - nof_false < gate.tmin
                }
            }
            GateType::AtLeast => {
                if gate.value {
                    nof_true >= gate.tmin
                } else {
                    nof_children - nof_false < gate.tmin
                }
            }
            GateType::Undef | GateType::Deleted => {
                unreachable!("justification query on {:?} gate", gate.typ)
            }
        }
    }

    /// Give every undetermined gate its value under the functional semantics
    /// of its type, assigning undetermined input gates to false first. Used
    /// by the SAT shortcut when the whole circuit is already decided.
    pub fn evaluate_all(&mut self) {
        for gate in &mut self.gates {
            if gate.typ == GateType::Var && !gate.determined {
                gate.determined = true;
                gate.value = false;
            }
        }
        for g in 0..self.gates.len() {
            if !self.gates[g].is_deleted() {
                self.evaluate(g);
            }
        }
        debug!("evaluated all remaining gates");
    }

    fn evaluate(&mut self, root: usize) {
        if self.gates[root].determined {
            return;
        }
        // Explicit post-order stack; the second visit computes the value
        // from the by-then determined children.
        let mut stack: Vec<(usize, bool)> = vec![(root, false)];
        while let Some((g, expanded)) = stack.pop() {
            if self.gates[g].determined {
                continue;
            }
            if !expanded {
                stack.push((g, true));
                for i in 0..self.gates[g].children.len() {
                    let ch = self.gates[g].children[i];
                    if !self.gates[ch].determined {
                        stack.push((ch, false));
                    }
                }
                continue;
            }
            let (nof_true, nof_false, nof_undet) = self.gates[g].child_info(&self.gates);
            assert_eq!(nof_undet, 0, "evaluation visited an undetermined child");
            let gate = &self.gates[g];
            let value = match gate.typ {
                GateType::False => false,
                GateType::True => true,
                GateType::Var => unreachable!("input gates are assigned before evaluation"),
                GateType::Ref => nof_true == 1,
                GateType::Not => nof_true == 0,
                GateType::Equiv => !(nof_true > 0 && nof_false > 0),
                GateType::Or => nof_true > 0,
                GateType::And => nof_false == 0,
                GateType::Odd => nof_true % 2 == 1,
                GateType::Even => nof_true % 2 == 0,
                GateType::Ite => {
                    let i = self.gates[gate.children[0]].value;
                    let t = self.gates[gate.children[1]].value;
                    let e = self.gates[gate.children[2]].value;
                    if i {
                        t
                    } else {
                        e
                    }
                }
                GateType::Threshold => gate.tmin <= nof_true && nof_true <= gate.tmax,
                GateType::AtLeast => nof_true >= gate.tmin,
                GateType::Undef | GateType::Deleted => {
                    unreachable!("evaluation reached a {:?} gate", gate.typ)
                }
            };
            let gate = &mut self.gates[g];
            gate.determined = true;
            gate.value = value;
        }
    }

    /// Post-condition of the SAT shortcut: every determined gate's value must
    /// be consistent with the determined values of its children.
    pub fn check_consistency(&self) -> bool {
        for gate in &self.gates {
            if gate.is_deleted() || !gate.determined {
                continue;
            }
            let (nof_true, nof_false, nof_undet) = gate.child_info(&self.gates);
            let nof_children = nof_true + nof_false + nof_undet;
            let ok = match gate.typ {
                GateType::False => !gate.value,
                GateType::True => gate.value,
                GateType::Var => true,
                GateType::Not => {
                    if nof_true == 1 {
                        !gate.value
                    } else if nof_false == 1 {
                        gate.value
                    } else {
                        true
                    }
                }
                GateType::Ref => {
                    if nof_true == 1 {
                        gate.value
                    } else if nof_false == 1 {
                        !gate.value
                    } else {
                        true
                    }
                }
                GateType::Equiv => {
                    if gate.value {
                        !(nof_true > 0 && nof_false > 0)
                    } else {
                        nof_true != nof_children && nof_false != nof_children
                    }
                }
                GateType::Or => {
                    if gate.value {
                        nof_false != nof_children
                    } else {
                        nof_true == 0
                    }
                }
                GateType::And => {
                    if gate.value {
                        nof_false == 0
                    } else {
                        nof_true != nof_children
                    }
                }
                GateType::Odd => nof_undet > 0 || gate.value == (nof_true % 2 == 1),
                GateType::Even => nof_undet > 0 || gate.value == (nof_true % 2 == 0),
                GateType::Ite => {
                    let i = &self.gates[gate.children[0]];
                    let t = &self.gates[gate.children[1]];
                    let e = &self.gates[gate.children[2]];
                    let known = |g: &Gate, v: bool| g.determined && g.value == v;
                    if gate.value {
                        !((known(i, true) && known(t, false))
                            || (known(i, false) && known(e, false))
                            || (known(t, false) && known(e, false)))
                    } else {
                        !((known(i, true) && known(t, true))
                            || (known(i, false) && known(e, true))
                            || (known(t, true) && known(e, true)))
                    }
                }
                GateType::Threshold => {
                    if gate.value {
                        nof_true <= gate.tmax && nof_children - nof_false >= gate.tmin
                    } else {
                        !(nof_true >= gate.tmin && nof_children - nof_false <= gate.tmax)
                    }
                }
                GateType::AtLeast => {
                    if gate.value {
                        nof_children - nof_false >= gate.tmin
                    } else {
                        !(nof_true >= gate.tmin)
                    }
                }
                GateType::Undef | GateType::Deleted => true,
            };
            if !ok {
                return false;
            }
        }
        true
    }
}

impl Default for Circuit {
    fn default() -> Circuit {
        Circuit::new()
    }
}

/// Check the parent/child edge symmetry invariant over the whole store:
/// the number of `parent -> child` entries must equal the number of
/// matching backlinks, for every pair.
#[cfg(test)]
pub(crate) fn assert_edges_consistent(c: &Circuit) {
    for g in 0..c.len() {
        for &ch in &c.gate(g).children {
            let down = c.gate(g).children.iter().filter(|&&x| x == ch).count();
            let up = c.gate(ch).parents.iter().filter(|&&x| x == g).count();
            assert_eq!(
                down, up,
                "edge count mismatch between gate {} and child {}",
                g, ch
            );
        }
        for &p in &c.gate(g).parents {
            assert!(
                c.gate(p).children.contains(&g),
                "parent backlink of gate {} without child entry in {}",
                g,
                p
            );
        }
    }
}
