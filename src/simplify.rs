//! Fixed-point simplification of the circuit.
//!
//! The propagation stack of the circuit is the only scheduler here: a rewrite
//! of one gate enqueues the gate itself when its shape changed, its parents
//! when its truth value can now propagate upward, and any child left without
//! parents (a dead-code candidate). Simplification rounds alternate with
//! structural sharing until neither changes the DAG.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::circuit::{Circuit, GateType};
use crate::share;
use crate::Conflict;

/// Rewrite the circuit to a semantically equivalent smaller form.
///
/// With `preserve_cnf_normal_form` set, rewrites that could reintroduce
/// gates outside the CNF-normalized shape (n-ary parity merging) are
/// suppressed; this is the mode used for the cleanup pass after CNF
/// normalization.
pub fn simplify(c: &mut Circuit, preserve_cnf_normal_form: bool) -> Result<(), Conflict> {
    let mut rounds = 0usize;
    loop {
        c.changed = false;
        for g in 0..c.len() {
            c.push(g);
        }
        while let Some(g) = c.pop() {
            simplify_gate(c, g, preserve_cnf_normal_form)?;
        }
        share::share(c)?;
        rounds += 1;
        if !c.changed {
            break;
        }
    }
    debug!(rounds, gates = c.count_gates(), "simplification reached a fixed point");
    Ok(())
}

fn simplify_gate(
    c: &mut Circuit,
    g: usize,
    preserve_cnf_normal_form: bool,
) -> Result<(), Conflict> {
    let typ = c.gate(g).typ;
    if typ == GateType::Deleted {
        return Ok(());
    }

    // Cone-of-influence light: a gate with no parents, no handles and no
    // constraint computes nothing anybody observes.
    if c.gate(g).parents.is_empty() && c.gate(g).handles.is_empty() && !c.gate(g).determined {
        c.push_children(g);
        c.remove_all_children(g);
        c.gate_mut(g).typ = GateType::Deleted;
        c.changed = true;
        return Ok(());
    }

    match typ {
        GateType::False => simplify_constant(c, g, false),
        GateType::True => simplify_constant(c, g, true),

        GateType::Var => {
            if c.gate(g).determined && c.may_transform_input_gates {
                let v = c.gate(g).value;
                c.transform_into_constant(g, v);
            }
            Ok(())
        }

        GateType::Ref => {
            let child = c.gate(g).children[0];
            if c.gate(g).determined {
                let v = c.gate(g).value;
                set_child_value(c, child, v)?;
                c.transform_into_constant(g, v);
                c.push_parents(g);
                return Ok(());
            }
            if c.gate(child).determined {
                let v = c.gate(child).value;
                c.transform_into_constant(g, v);
                c.push_parents(g);
                return Ok(());
            }
            // Unify this gate with its child.
            c.push_parents(g);
            c.redirect_parents(g, child);
            c.migrate_handles(g, child);
            c.remove_all_children(g);
            c.gate_mut(g).typ = GateType::Deleted;
            c.changed = true;
            Ok(())
        }

        GateType::Not => {
            let child = c.gate(g).children[0];
            if c.gate(g).determined {
                let v = c.gate(g).value;
                set_child_value(c, child, !v)?;
                c.transform_into_constant(g, v);
                c.push_parents(g);
                return Ok(());
            }
            if c.gate(child).determined {
                let v = !c.gate(child).value;
                c.transform_into_constant(g, v);
                c.push_parents(g);
                return Ok(());
            }
            if c.gate(child).typ == GateType::Not {
                // g := ~~h  -->  g := h
                let grandchild = c.gate(child).children[0];
                c.gate_mut(g).typ = GateType::Ref;
                c.remove_all_children(g);
                c.add_child(g, grandchild);
                c.push(g);
                c.changed = true;
            }
            Ok(())
        }

        GateType::Ite => simplify_ite(c, g),
        GateType::Or => simplify_or_and(c, g, true),
        GateType::And => simplify_or_and(c, g, false),
        GateType::Odd | GateType::Even => simplify_parity(c, g, preserve_cnf_normal_form),
        GateType::Equiv => simplify_equiv(c, g),
        GateType::Threshold => simplify_threshold(c, g),
        GateType::AtLeast => simplify_atleast(c, g),

        GateType::Undef | GateType::Deleted => {
            unreachable!("simplification of a {:?} gate", typ)
        }
    }
}

/// Constant gates pin themselves on first visit; a contradicting constraint
/// is a conflict. An unreferenced constant is dropped.
fn simplify_constant(c: &mut Circuit, g: usize, v: bool) -> Result<(), Conflict> {
    debug_assert!(c.gate(g).children.is_empty());
    if c.gate(g).determined {
        if c.gate(g).value != v {
            return Err(Conflict);
        }
    } else {
        c.gate_mut(g).determined = true;
        c.gate_mut(g).value = v;
        c.push_parents(g);
    }
    if c.gate(g).handles.is_empty() && c.gate(g).parents.is_empty() {
        c.gate_mut(g).typ = GateType::Deleted;
    }
    Ok(())
}

/// Pin `child` to `v`, conflicting when it is already pinned to `!v`.
fn set_child_value(c: &mut Circuit, child: usize, v: bool) -> Result<(), Conflict> {
    if c.gate(child).determined {
        if c.gate(child).value != v {
            return Err(Conflict);
        }
    } else {
        c.gate_mut(child).determined = true;
        c.gate_mut(child).value = v;
        c.push(child);
    }
    Ok(())
}

fn simplify_ite(c: &mut Circuit, g: usize) -> Result<(), Conflict> {
    let if_child = c.gate(g).children[0];
    let then_child = c.gate(g).children[1];
    let else_child = c.gate(g).children[2];

    let det = |c: &Circuit, ch: usize, v: bool| {
        c.gate(ch).determined && c.gate(ch).value == v
    };

    if det(c, if_child, true) {
        // ITE(T,t,e) --> t
        return rewrite_to_ref(c, g, then_child);
    }
    if det(c, if_child, false) {
        // ITE(F,t,e) --> e
        return rewrite_to_ref(c, g, else_child);
    }
    if det(c, then_child, true) {
        // ITE(i,T,e) --> OR(i,e)
        return rewrite_to_binary(c, g, GateType::Or, if_child, else_child);
    }
    if det(c, then_child, false) {
        // ITE(i,F,e) --> AND(~i,e)
        c.push_children(g);
        c.remove_all_children(g);
        c.gate_mut(g).typ = GateType::And;
        let new_not = c.install(GateType::Not, vec![if_child]);
        c.add_child(g, new_not);
        c.add_child(g, else_child);
        c.push(g);
        c.push(new_not);
        c.push_parents(g);
        c.changed = true;
        return Ok(());
    }
    if det(c, else_child, true) {
        // ITE(i,t,T) --> OR(~i,t)
        c.push_children(g);
        c.remove_all_children(g);
        c.gate_mut(g).typ = GateType::Or;
        let new_not = c.install(GateType::Not, vec![if_child]);
        c.add_child(g, new_not);
        c.add_child(g, then_child);
        c.push(g);
        c.push(new_not);
        c.push_parents(g);
        c.changed = true;
        return Ok(());
    }
    if det(c, else_child, false) {
        // ITE(i,t,F) --> AND(i,t)
        return rewrite_to_binary(c, g, GateType::And, if_child, then_child);
    }

    if then_child == else_child {
        // ITE(i,x,x) --> x
        return rewrite_to_ref(c, g, then_child);
    }
    if if_child == then_child {
        // ITE(x,x,e) --> OR(x,e)
        return rewrite_to_binary(c, g, GateType::Or, if_child, else_child);
    }
    if if_child == else_child {
        // ITE(x,t,x) --> AND(x,t)
        return rewrite_to_binary(c, g, GateType::And, if_child, then_child);
    }
    if c.gate(else_child).typ == GateType::Not && c.gate(else_child).children[0] == then_child {
        // ITE(x,y,~y) --> EQUIV(x,y)
        c.remove_all_children(g);
        c.gate_mut(g).typ = GateType::Equiv;
        c.add_child(g, if_child);
        c.add_child(g, then_child);
        c.push(g);
        c.changed = true;
        return Ok(());
    }
    if c.gate(then_child).typ == GateType::Not && c.gate(then_child).children[0] == else_child {
        // ITE(x,~y,y) --> ODD(x,y)
        c.remove_all_children(g);
        c.gate_mut(g).typ = GateType::Odd;
        c.add_child(g, if_child);
        c.add_child(g, else_child);
        c.push(g);
        c.changed = true;
        return Ok(());
    }
    Ok(())
}

fn rewrite_to_ref(c: &mut Circuit, g: usize, target: usize) -> Result<(), Conflict> {
    c.push_children(g);
    c.remove_all_children(g);
    c.gate_mut(g).typ = GateType::Ref;
    c.add_child(g, target);
    c.push(g);
    c.changed = true;
    Ok(())
}

fn rewrite_to_binary(
    c: &mut Circuit,
    g: usize,
    typ: GateType,
    a: usize,
    b: usize,
) -> Result<(), Conflict> {
    c.push_children(g);
    c.remove_all_children(g);
    c.gate_mut(g).typ = typ;
    c.add_child(g, a);
    c.add_child(g, b);
    c.push(g);
    c.push_parents(g);
    c.changed = true;
    Ok(())
}

/// OR and AND are duals; `is_or` selects which. The absorbing value of OR is
/// true and its identity false, and vice versa for AND.
fn simplify_or_and(c: &mut Circuit, g: usize, is_or: bool) -> Result<(), Conflict> {
    let typ = if is_or { GateType::Or } else { GateType::And };
    let absorbing = is_or;
    let identity = !is_or;
    debug_assert!(!c.gate(g).children.is_empty());

    // A forced identity value (OR = F, AND = T) pushes onto every child.
    if c.gate(g).determined && c.gate(g).value == identity {
        while !c.gate(g).children.is_empty() {
            let last = c.gate(g).children.len() - 1;
            let child = c.gate(g).children[last];
            set_child_value(c, child, identity)?;
            c.remove_child_at(g, last);
        }
        c.transform_into_constant(g, identity);
        c.push_parents(g);
        return Ok(());
    }

    // Drop determined identity children; an absorbing child decides the gate.
    let mut absorbed = false;
    let mut i = 0;
    while i < c.gate(g).children.len() {
        let child = c.gate(g).children[i];
        if c.gate(child).determined {
            if c.gate(child).value == absorbing {
                absorbed = true;
                break;
            }
            c.remove_child_at(g, i);
        } else {
            i += 1;
        }
    }
    if absorbed {
        c.transform_into_constant(g, absorbing);
        c.push_parents(g);
        return Ok(());
    }
    let nof_undet = c.gate(g).children.len();
    if nof_undet == 0 {
        // Every child carried the identity value.
        if c.gate(g).determined && c.gate(g).value != identity {
            return Err(Conflict);
        }
        c.transform_into_constant(g, identity);
        c.push_parents(g);
        return Ok(());
    }
    if nof_undet == 1 {
        c.gate_mut(g).typ = GateType::Ref;
        c.push(g);
        return Ok(());
    }

    remove_dup_and_opposed_children(c, g)?;
    if c.gate(g).typ != typ {
        return Ok(());
    }

    // Subset sharing: OR(x,y,z,v) with a live t = OR(y,z) becomes OR(x,t,v).
    // The guards (the candidate must be a referenced proper subset with more
    // than one child) are kept as in the original rewriter.
    if c.gate(g).children.len() >= 3 {
        let mine: FxHashSet<usize> = c.gate(g).children.iter().copied().collect();
        let mut replacement: Option<usize> = None;
        'outer: for &child in &c.gate(g).children {
            let mut candidates: Vec<usize> = Vec::new();
            for &p in &c.gate(child).parents {
                if !candidates.contains(&p) {
                    candidates.push(p);
                }
            }
            for p in candidates {
                if p == g || c.gate(p).typ != typ {
                    continue;
                }
                if !(c.gate(p).determined || !c.gate(p).parents.is_empty()) {
                    continue;
                }
                let pk = &c.gate(p).children;
                if pk.len() > 1
                    && pk.len() < c.gate(g).children.len()
                    && pk.iter().all(|x| mine.contains(x))
                {
                    replacement = Some(p);
                    break 'outer;
                }
            }
        }
        if let Some(p) = replacement {
            let sub: FxHashSet<usize> = c.gate(p).children.iter().copied().collect();
            let mut i = 0;
            while i < c.gate(g).children.len() {
                if sub.contains(&c.gate(g).children[i]) {
                    c.remove_child_at(g, i);
                } else {
                    i += 1;
                }
            }
            c.add_child(g, p);
        }
    }

    // Flatten single-parent nested gates of the same type.
    let mut collapsed = false;
    let mut i = 0;
    while i < c.gate(g).children.len() {
        let child = c.gate(g).children[i];
        if c.gate(child).typ == typ
            && !c.gate(child).determined
            && c.gate(child).parents.len() == 1
        {
            collapsed = true;
            let grandchildren = c.gate(child).children.clone();
            for gc in grandchildren {
                c.add_child(g, gc);
            }
            c.remove_child_at(g, i);
            c.push(child);
            continue;
        }
        i += 1;
    }
    if collapsed {
        c.push(g);
    }
    Ok(())
}

/// Remove duplicate children of OR/AND/EQUIV and detect an `x, ~x` pair,
/// which collapses the gate to its absorbing constant (`OR = T`,
/// `AND = F`, `EQUIV = F`).
fn remove_dup_and_opposed_children(c: &mut Circuit, g: usize) -> Result<(), Conflict> {
    let typ = c.gate(g).typ;
    debug_assert!(matches!(
        typ,
        GateType::Or | GateType::And | GateType::Equiv
    ));

    let mut seen: FxHashSet<usize> = FxHashSet::default();
    let mut seen_negated: FxHashSet<usize> = FxHashSet::default();
    let mut opposed = false;
    let mut i = 0;
    while i < c.gate(g).children.len() {
        let child = c.gate(g).children[i];
        if c.gate(child).determined {
            i += 1;
            continue;
        }
        if seen_negated.contains(&child) {
            opposed = true;
            break;
        }
        if !seen.insert(child) {
            c.remove_child_at(g, i);
            continue;
        }
        if c.gate(child).typ == GateType::Not {
            let grandchild = c.gate(child).children[0];
            if seen.contains(&grandchild) {
                opposed = true;
                break;
            }
            seen_negated.insert(grandchild);
        }
        i += 1;
    }

    if opposed {
        let v = match typ {
            GateType::Or => true,
            GateType::And | GateType::Equiv => false,
            _ => unreachable!(),
        };
        if c.gate(g).determined && c.gate(g).value != v {
            return Err(Conflict);
        }
        c.transform_into_constant(g, v);
        c.push_parents(g);
        return Ok(());
    }
    if c.gate(g).children.len() == 1 {
        c.push(g);
    }
    Ok(())
}

fn toggle_parity(c: &mut Circuit, g: usize) {
    let t = c.gate(g).typ;
    c.gate_mut(g).typ = match t {
        GateType::Odd => GateType::Even,
        GateType::Even => GateType::Odd,
        _ => unreachable!("parity toggle on {:?}", t),
    };
}

fn simplify_parity(
    c: &mut Circuit,
    g: usize,
    preserve_cnf_normal_form: bool,
) -> Result<(), Conflict> {
    // Absorb determined children: ODD(T,x) = EVEN(x), ODD(F,x) = ODD(x),
    // and dually for EVEN.
    let mut i = 0;
    while i < c.gate(g).children.len() {
        let child = c.gate(g).children[i];
        if !c.gate(child).determined {
            i += 1;
            continue;
        }
        if c.gate(child).value {
            toggle_parity(c, g);
        }
        c.remove_child_at(g, i);
    }

    let nof_undet = c.gate(g).children.len();
    if nof_undet == 0 {
        // ODD() = F, EVEN() = T
        let v = c.gate(g).typ == GateType::Even;
        if c.gate(g).determined && c.gate(g).value != v {
            return Err(Conflict);
        }
        c.transform_into_constant(g, v);
        c.push_parents(g);
        return Ok(());
    }
    if nof_undet == 1 {
        // ODD(x) = x, EVEN(x) = ~x
        if c.gate(g).typ == GateType::Odd {
            c.gate_mut(g).typ = GateType::Ref;
        } else {
            c.gate_mut(g).typ = GateType::Not;
            c.push_parents(g);
        }
        c.push(g);
        return Ok(());
    }

    // Absorb negations: ODD(~x,...) = EVEN(x,...) and dually.
    let mut has_determined = false;
    for i in 0..c.gate(g).children.len() {
        let child = c.gate(g).children[i];
        if c.gate(child).typ == GateType::Not {
            let grandchild = c.gate(child).children[0];
            c.replace_child_at(g, i, grandchild);
            if c.gate(grandchild).determined {
                has_determined = true;
            }
            if c.gate(child).parents.is_empty() {
                c.push(child);
            }
            toggle_parity(c, g);
            c.changed = true;
        }
    }
    if has_determined {
        // Restart; the rewrites below assume undetermined children.
        c.push(g);
        return Ok(());
    }

    remove_parity_duplicate_children(c, g)?;
    if c.in_pstack(g) {
        return Ok(());
    }
    let typ = c.gate(g).typ;
    if !(typ == GateType::Odd || typ == GateType::Even) {
        return Ok(());
    }
    let nof_undet = c.gate(g).children.len();
    debug_assert!(nof_undet >= 2);

    let determined = c.gate(g).determined;
    let value = c.gate(g).value;

    if nof_undet == 2
        && determined
        && ((typ == GateType::Even && value) || (typ == GateType::Odd && !value))
    {
        // EVEN(x,y) = T and ODD(x,y) = F pin the two children equivalent.
        let child1 = c.gate(g).children[0];
        let child2 = c.gate(g).children[1];
        if child1 == child2 {
            c.transform_into_constant(g, value);
            c.push_parents(g);
            return Ok(());
        }
        if c.may_transform_input_gates {
            if c.gate(child1).typ == GateType::Var && !c.depends_on(child2, child1) {
                c.transform_into_constant(g, value);
                c.push_parents(g);
                debug_assert!(!c.gate(child1).determined && !c.gate(child2).determined);
                c.gate_mut(child1).typ = GateType::Ref;
                c.add_child(child1, child2);
                c.push(child1);
                return Ok(());
            }
            if c.gate(child2).typ == GateType::Var && !c.depends_on(child1, child2) {
                c.transform_into_constant(g, value);
                c.push_parents(g);
                debug_assert!(!c.gate(child1).determined && !c.gate(child2).determined);
                c.gate_mut(child2).typ = GateType::Ref;
                c.add_child(child2, child1);
                c.push(child2);
                return Ok(());
            }
        }
        if c.gate(child1).parents.len() >= 2 && c.gate(child2).parents.len() >= 2 {
            // Both children are referenced elsewhere; route the foreign
            // edges of one onto the other (cycle-safely).
            if !c.depends_on(child1, child2) {
                redirect_foreign_parents(c, child2, child1, g);
                c.push_parents(child1);
            } else {
                debug_assert!(!c.depends_on(child2, child1));
                redirect_foreign_parents(c, child1, child2, g);
                c.push_parents(child2);
            }
        }
    }

    let typ = c.gate(g).typ;
    if c.gate(g).children.len() == 2
        && determined
        && ((typ == GateType::Even && !value) || (typ == GateType::Odd && value))
    {
        // EVEN(x,y) = F and ODD(x,y) = T pin the children inequivalent.
        let child1 = c.gate(g).children[0];
        let child2 = c.gate(g).children[1];
        if child1 == child2 {
            return Err(Conflict);
        }
        if c.may_transform_input_gates {
            if c.gate(child1).typ == GateType::Var && !c.depends_on(child2, child1) {
                c.transform_into_constant(g, value);
                c.push_parents(g);
                debug_assert!(!c.gate(child1).determined && !c.gate(child2).determined);
                c.gate_mut(child1).typ = GateType::Not;
                c.add_child(child1, child2);
                c.push_parents(child1);
                c.push(child1);
                return Ok(());
            }
            if c.gate(child2).typ == GateType::Var && !c.depends_on(child1, child2) {
                c.transform_into_constant(g, value);
                c.push_parents(g);
                debug_assert!(!c.gate(child1).determined && !c.gate(child2).determined);
                c.gate_mut(child2).typ = GateType::Not;
                c.add_child(child2, child1);
                c.push_parents(child2);
                c.push(child2);
                return Ok(());
            }
        }
        if c.gate(child1).parents.len() >= 2 && c.gate(child2).parents.len() >= 2 {
            if c.gate(child1).typ == GateType::Var || !c.depends_on(child1, child2) {
                let new_not = c.install(GateType::Not, vec![child1]);
                redirect_foreign_parents(c, child2, new_not, g);
                c.push_parents(new_not);
                c.push(new_not);
            } else {
                debug_assert!(!c.depends_on(child2, child1));
                let new_not = c.install(GateType::Not, vec![child2]);
                redirect_foreign_parents(c, child1, new_not, g);
                c.push_parents(new_not);
                c.push(new_not);
            }
        }
    }

    if c.gate(g).typ == GateType::Odd && c.gate(g).children.len() == 2 {
        // ODD(x, OR(x,y,z)) = AND(~x, OR(y,z)) when the OR is not shared.
        let child1 = c.gate(g).children[0];
        let child2 = c.gate(g).children[1];
        if try_parity_or_absorption(c, g, child1, child2)? {
            return Ok(());
        }
        if try_parity_or_absorption(c, g, child2, child1)? {
            return Ok(());
        }
    }

    // Flatten unshared nested parity gates: ODD(x,ODD(t,u),y) = ODD(x,t,u,y)
    // and ODD(x,EVEN(t,u),y) = EVEN(x,t,u,y), with the duals obtained by
    // toggling. This reintroduces n-ary parity gates, so it is off in the
    // cleanup pass after CNF normalization.
    if !preserve_cnf_normal_form {
        let mut collapsed = false;
        let mut i = 0;
        while i < c.gate(g).children.len() {
            let child = c.gate(g).children[i];
            let child_typ = c.gate(child).typ;
            if (child_typ == GateType::Odd || child_typ == GateType::Even)
                && !c.gate(child).determined
                && c.gate(child).parents.len() == 1
            {
                if child_typ == GateType::Even {
                    toggle_parity(c, g);
                }
                let grandchildren = c.gate(child).children.clone();
                for gc in grandchildren {
                    c.add_child(g, gc);
                }
                c.remove_child_at(g, i);
                c.push(child);
                collapsed = true;
                continue;
            }
            i += 1;
        }
        if collapsed {
            c.push(g);
        }
    }

    Ok(())
}

/// ODD(x, OR(...,x,...)) with an unshared OR rewrites to AND(~x, OR(rest)).
/// Returns true when the rewrite fired.
fn try_parity_or_absorption(
    c: &mut Circuit,
    g: usize,
    x: usize,
    or_gate: usize,
) -> Result<bool, Conflict> {
    if c.gate(or_gate).typ != GateType::Or || c.gate(or_gate).parents.len() != 1 {
        return Ok(false);
    }
    if !c.gate(or_gate).children.contains(&x) {
        return Ok(false);
    }
    let rest: Vec<usize> = c
        .gate(or_gate)
        .children
        .iter()
        .copied()
        .filter(|&ch| ch != x)
        .collect();
    if rest.is_empty() {
        return Ok(false);
    }
    let new_or = c.install(GateType::Or, rest);
    c.remove_all_children(g);
    let new_not = c.install(GateType::Not, vec![x]);
    c.gate_mut(g).typ = GateType::And;
    c.add_child(g, new_not);
    c.add_child(g, new_or);
    c.push(g);
    c.push(new_not);
    c.push(new_or);
    c.changed = true;
    Ok(true)
}

/// Move every incoming edge of `from` to `to`, except edges from `except`.
fn redirect_foreign_parents(c: &mut Circuit, from: usize, to: usize, except: usize) {
    let parents = c.gate(from).parents.clone();
    for p in parents {
        if p == except {
            continue;
        }
        let pos = c
            .gate(p)
            .children
            .iter()
            .position(|&x| x == from)
            .expect("edge missing its child link");
        c.replace_child_at(p, pos, to);
    }
    c.changed = true;
}

/// ODD(x,x,rest) = ODD(rest), EVEN(x,x,rest) = EVEN(rest): duplicate
/// children of parity gates cancel pairwise.
fn remove_parity_duplicate_children(c: &mut Circuit, g: usize) -> Result<(), Conflict> {
    let mut removed = false;
    loop {
        let mut first_pos: FxHashMap<usize, usize> = FxHashMap::default();
        let mut pair: Option<(usize, usize)> = None;
        for (i, &child) in c.gate(g).children.iter().enumerate() {
            if c.gate(child).determined {
                continue;
            }
            match first_pos.get(&child) {
                Some(&j) => {
                    pair = Some((j, i));
                    break;
                }
                None => {
                    first_pos.insert(child, i);
                }
            }
        }
        let Some((a, b)) = pair else { break };
        c.remove_child_at(g, b);
        c.remove_child_at(g, a);
        removed = true;
        c.changed = true;
    }
    if !removed {
        return Ok(());
    }

    if c.gate(g).children.is_empty() {
        let v = c.gate(g).typ == GateType::Even;
        if c.gate(g).determined && c.gate(g).value != v {
            return Err(Conflict);
        }
        c.transform_into_constant(g, v);
        c.push_parents(g);
        return Ok(());
    }
    if c.gate(g).children.len() == 1 {
        c.push(g);
    }
    Ok(())
}

fn simplify_equiv(c: &mut Circuit, g: usize) -> Result<(), Conflict> {
    if c.gate(g).children.len() == 1 {
        // EQUIV(x) = T
        if c.gate(g).determined && !c.gate(g).value {
            return Err(Conflict);
        }
        c.transform_into_constant(g, true);
        c.push_parents(g);
        return Ok(());
    }

    for i in 0..c.gate(g).children.len() {
        let child = c.gate(g).children[i];
        if !c.gate(child).determined {
            continue;
        }
        if c.gate(child).value {
            // EQUIV(T,x,y) --> AND(T,x,y)
            c.gate_mut(g).typ = GateType::And;
            c.push_parents(g);
            c.push(g);
            return Ok(());
        }
        // EQUIV(F,x,y) --> NOT(OR(F,x,y))
        let kids = c.gate(g).children.clone();
        c.remove_all_children(g);
        let new_or = c.install(GateType::Or, kids);
        c.gate_mut(g).typ = GateType::Not;
        c.add_child(g, new_or);
        c.push_parents(g);
        c.push(g);
        c.push(new_or);
        c.changed = true;
        return Ok(());
    }

    remove_dup_and_opposed_children(c, g)?;
    if c.in_pstack(g) {
        return Ok(());
    }
    if c.gate(g).typ != GateType::Equiv {
        return Ok(());
    }

    if c.gate(g).determined && c.gate(g).value {
        // All children are equivalent.
        if c.may_transform_input_gates {
            let kids = c.gate(g).children.clone();
            let mut first_input: Option<usize> = None;
            let mut unified = false;
            for (pos, &child) in kids.iter().enumerate() {
                if c.gate(child).typ != GateType::Var {
                    continue;
                }
                debug_assert!(!c.gate(child).determined);
                if c.gate(child).parents.len() == 1 {
                    // An unshared input in EQUIV(x,y,...) = T just aliases
                    // its neighbour.
                    let other = if pos + 1 < kids.len() {
                        kids[pos + 1]
                    } else {
                        kids[pos - 1]
                    };
                    debug_assert_ne!(other, child);
                    c.gate_mut(child).typ = GateType::Ref;
                    c.add_child(child, other);
                    c.push(g);
                    c.push(child);
                    c.changed = true;
                    return Ok(());
                }
                match first_input {
                    None => first_input = Some(child),
                    Some(fi) => {
                        unified = true;
                        c.gate_mut(child).typ = GateType::Ref;
                        c.add_child(child, fi);
                        c.push(child);
                        c.changed = true;
                    }
                }
            }
            if unified {
                c.push_parents(first_input.expect("unification without a first input"));
                return Ok(());
            }
        }
        // Route all foreign edges onto a least child, one no other child
        // depends on.
        let kids = c.gate(g).children.clone();
        let mut least = kids[0];
        for &k in &kids[1..] {
            if c.depends_on(least, k) {
                least = k;
            }
        }
        let mut moved = false;
        for &child in &kids {
            if child == least {
                continue;
            }
            let parents = c.gate(child).parents.clone();
            for p in parents {
                if p == g {
                    continue;
                }
                let pos = c
                    .gate(p)
                    .children
                    .iter()
                    .position(|&x| x == child)
                    .expect("edge missing its child link");
                c.replace_child_at(p, pos, least);
                moved = true;
            }
        }
        if moved {
            c.changed = true;
            c.push_parents(least);
        }
        return Ok(());
    }

    if c.gate(g).determined && !c.gate(g).value && c.gate(g).children.len() == 2 {
        // EQUIV(x,y) = F  <=>  EVEN(x,y) = F
        c.gate_mut(g).typ = GateType::Even;
        c.push_parents(g);
        c.push(g);
        return Ok(());
    }

    Ok(())
}

fn simplify_threshold(c: &mut Circuit, g: usize) -> Result<(), Conflict> {
    if c.gate(g).tmin > c.gate(g).tmax {
        if c.gate(g).determined && c.gate(g).value {
            return Err(Conflict);
        }
        c.transform_into_constant(g, false);
        c.push_parents(g);
        return Ok(());
    }

    // Remove determined children, shifting the bounds for each true one.
    let mut i = 0;
    while i < c.gate(g).children.len() {
        if c.gate(g).tmax == 0 {
            // [0,0](x,y,z) = NOT(OR(x,y,z))
            rewrite_threshold_to_negated(c, g, GateType::Or);
            return Ok(());
        }
        let child = c.gate(g).children[i];
        if !c.gate(child).determined {
            i += 1;
            continue;
        }
        if c.gate(child).value {
            debug_assert!(c.gate(g).tmax > 0);
            let gate = c.gate_mut(g);
            gate.tmin = gate.tmin.saturating_sub(1);
            gate.tmax -= 1;
        }
        c.remove_child_at(g, i);
    }

    let nof_undet = c.gate(g).children.len();
    if c.gate(g).tmin > nof_undet {
        if c.gate(g).determined && c.gate(g).value {
            return Err(Conflict);
        }
        c.transform_into_constant(g, false);
        c.push_parents(g);
        return Ok(());
    }
    if c.gate(g).tmax > nof_undet {
        c.gate_mut(g).tmax = nof_undet;
    }
    if nof_undet == 0 {
        debug_assert!(c.gate(g).tmin == 0 && c.gate(g).tmax == 0);
        // [0,0]() = T
        if c.gate(g).determined && !c.gate(g).value {
            return Err(Conflict);
        }
        c.transform_into_constant(g, true);
        c.push_parents(g);
        return Ok(());
    }
    if c.gate(g).tmax == 0 {
        rewrite_threshold_to_negated(c, g, GateType::Or);
        c.push_parents(g);
        return Ok(());
    }
    if c.gate(g).tmin == nof_undet {
        // [n,n](x_1..x_n) = AND(x_1..x_n)
        let gate = c.gate_mut(g);
        gate.typ = GateType::And;
        gate.tmin = 0;
        gate.tmax = 0;
        c.push(g);
        return Ok(());
    }
    if c.gate(g).tmin == 0 && c.gate(g).tmax == nof_undet {
        // [0,n](x_1..x_n) = T
        if c.gate(g).determined && !c.gate(g).value {
            return Err(Conflict);
        }
        c.transform_into_constant(g, true);
        c.push_parents(g);
        return Ok(());
    }
    if c.gate(g).tmin == 0 && c.gate(g).tmax + 1 == nof_undet {
        // [0,n-1](x_1..x_n) = NOT(AND(x_1..x_n))
        rewrite_threshold_to_negated(c, g, GateType::And);
        c.push_parents(g);
        return Ok(());
    }

    if c.gate(g).determined && c.gate(g).value {
        // A satisfied upper bound falsifies any AND over more than tmax of
        // the same children.
        let mine: FxHashSet<usize> = c.gate(g).children.iter().copied().collect();
        let tmax = c.gate(g).tmax;
        let mut candidates: Vec<usize> = Vec::new();
        for &child in &c.gate(g).children {
            for &p in &c.gate(child).parents {
                if c.gate(p).typ == GateType::And && !candidates.contains(&p) {
                    candidates.push(p);
                }
            }
        }
        for p in candidates {
            let pk = &c.gate(p).children;
            if pk.len() > tmax && pk.iter().all(|x| mine.contains(x)) {
                if c.gate(p).determined && c.gate(p).value {
                    return Err(Conflict);
                }
                c.transform_into_constant(p, false);
                c.push_parents(p);
            }
        }
    }

    if c.gate(g).typ != GateType::Threshold {
        return Ok(());
    }
    remove_threshold_opposed_children(c, g)
}

/// Turn a threshold gate into `NOT(inner(children))` where `inner` is OR
/// (for `[0,0]`) or AND (for `[0,n-1]`).
fn rewrite_threshold_to_negated(c: &mut Circuit, g: usize, inner: GateType) {
    let kids = c.gate(g).children.clone();
    c.remove_all_children(g);
    let new_inner = c.install(inner, kids);
    let gate = c.gate_mut(g);
    gate.typ = GateType::Not;
    gate.tmin = 0;
    gate.tmax = 0;
    c.add_child(g, new_inner);
    c.push(g);
    c.push(new_inner);
    c.changed = true;
}

/// [L,U](x,~x,rest) = [L-1,U-1](rest): a complementary pair contributes
/// exactly one to the count.
fn remove_threshold_opposed_children(c: &mut Circuit, g: usize) -> Result<(), Conflict> {
    let mut removed = false;
    loop {
        let mut pos_of: FxHashMap<usize, usize> = FxHashMap::default();
        let mut neg_of: FxHashMap<usize, usize> = FxHashMap::default();
        let mut pair: Option<(usize, usize)> = None;
        for (i, &child) in c.gate(g).children.iter().enumerate() {
            if let Some(&j) = neg_of.get(&child) {
                pair = Some((j, i));
                break;
            }
            if c.gate(child).typ == GateType::Not {
                let grandchild = c.gate(child).children[0];
                if let Some(&j) = pos_of.get(&grandchild) {
                    pair = Some((j, i));
                    break;
                }
                neg_of.entry(grandchild).or_insert(i);
            }
            pos_of.entry(child).or_insert(i);
        }
        let Some((a, b)) = pair else { break };
        if c.gate(g).tmax == 0 {
            if c.gate(g).determined && c.gate(g).value {
                return Err(Conflict);
            }
            c.transform_into_constant(g, false);
            c.push_parents(g);
            return Ok(());
        }
        c.remove_child_at(g, b);
        c.remove_child_at(g, a);
        let gate = c.gate_mut(g);
        gate.tmin = gate.tmin.saturating_sub(1);
        gate.tmax -= 1;
        removed = true;
        c.changed = true;
    }
    if removed {
        c.push(g);
    }
    Ok(())
}

fn simplify_atleast(c: &mut Circuit, g: usize) -> Result<(), Conflict> {
    // Remove determined children, shifting the bound for each true one.
    let mut i = 0;
    while i < c.gate(g).children.len() {
        let child = c.gate(g).children[i];
        if !c.gate(child).determined {
            i += 1;
            continue;
        }
        if c.gate(child).value {
            let gate = c.gate_mut(g);
            gate.tmin = gate.tmin.saturating_sub(1);
        }
        c.remove_child_at(g, i);
    }

    let nof_undet = c.gate(g).children.len();
    if c.gate(g).tmin == 0 {
        if c.gate(g).determined && !c.gate(g).value {
            return Err(Conflict);
        }
        c.transform_into_constant(g, true);
        c.push_parents(g);
        return Ok(());
    }
    if c.gate(g).tmin > nof_undet {
        if c.gate(g).determined && c.gate(g).value {
            return Err(Conflict);
        }
        c.transform_into_constant(g, false);
        c.push_parents(g);
        return Ok(());
    }
    if c.gate(g).tmin == nof_undet {
        // (>= n)(x_1..x_n) = AND(x_1..x_n)
        let gate = c.gate_mut(g);
        gate.typ = GateType::And;
        gate.tmin = 0;
        c.push(g);
        return Ok(());
    }
    if c.gate(g).tmin == 1 {
        // (>= 1)(x_1..x_n) = OR(x_1..x_n)
        let gate = c.gate_mut(g);
        gate.typ = GateType::Or;
        gate.tmin = 0;
        c.push(g);
        return Ok(());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{assert_edges_consistent, Handle};

    fn var(c: &mut Circuit, name: &str) -> usize {
        let g = c.install(GateType::Var, vec![]);
        c.gate_mut(g).handles.push(Handle::Name(name.to_string()));
        g
    }

    fn named(c: &mut Circuit, g: usize, name: &str) {
        c.gate_mut(g).handles.push(Handle::Name(name.to_string()));
    }

    fn has_name(c: &Circuit, g: usize, name: &str) -> bool {
        c.gate(g).handles.iter().any(|h| h.name() == name)
    }

    #[test]
    fn forced_and_pushes_truth_to_children() {
        let mut c = Circuit::new();
        let x = var(&mut c, "x");
        let y = var(&mut c, "y");
        let a = c.install(GateType::And, vec![x, y]);
        named(&mut c, a, "a");
        c.force_true(a).unwrap();
        simplify(&mut c, false).unwrap();
        assert!(c.gate(x).determined && c.gate(x).value);
        assert!(c.gate(y).determined && c.gate(y).value);
        assert_edges_consistent(&c);
    }

    #[test]
    fn opposed_children_decide_or_and() {
        let mut c = Circuit::new();
        let x = var(&mut c, "x");
        let nx = c.install(GateType::Not, vec![x]);
        let a = c.install(GateType::And, vec![x, nx]);
        let o = c.install(GateType::Or, vec![x, nx]);
        named(&mut c, a, "a");
        named(&mut c, o, "o");
        simplify(&mut c, false).unwrap();
        assert_eq!(c.gate(a).typ, GateType::False);
        assert_eq!(c.gate(o).typ, GateType::True);
        assert_edges_consistent(&c);
    }

    #[test]
    fn contradictory_forces_conflict() {
        let mut c = Circuit::new();
        let x = var(&mut c, "x");
        let n = c.install(GateType::Not, vec![x]);
        named(&mut c, n, "n");
        c.force_true(x).unwrap();
        c.force_true(n).unwrap();
        assert_eq!(simplify(&mut c, false), Err(Conflict));
    }

    #[test]
    fn ite_with_decided_condition_aliases_the_branch() {
        let mut c = Circuit::new();
        let i = var(&mut c, "i");
        let t = var(&mut c, "t");
        let e = var(&mut c, "e");
        let r = c.install(GateType::Ite, vec![i, t, e]);
        named(&mut c, r, "r");
        c.force_true(i).unwrap();
        simplify(&mut c, false).unwrap();
        assert!(has_name(&c, t, "r"));
        assert!(c.gate(r).is_deleted());
        assert!(c.gate(e).is_deleted());
        assert_edges_consistent(&c);
    }

    #[test]
    fn double_negation_is_aliased_away() {
        let mut c = Circuit::new();
        let x = var(&mut c, "x");
        let inner = c.install(GateType::Not, vec![x]);
        let outer = c.install(GateType::Not, vec![inner]);
        named(&mut c, outer, "r");
        simplify(&mut c, false).unwrap();
        assert!(has_name(&c, x, "r"));
        assert!(c.gate(inner).is_deleted());
        assert!(c.gate(outer).is_deleted());
    }

    #[test]
    fn parity_duplicates_cancel_pairwise() {
        let mut c = Circuit::new();
        let x = var(&mut c, "x");
        let y = var(&mut c, "y");
        let odd = c.install(GateType::Odd, vec![x, x, y]);
        named(&mut c, odd, "r");
        simplify(&mut c, false).unwrap();
        assert!(has_name(&c, y, "r"));
        assert!(c.gate(odd).is_deleted());
        assert!(c.gate(x).is_deleted());
    }

    #[test]
    fn even_true_unifies_input_children() {
        let mut c = Circuit::new();
        let x = var(&mut c, "x");
        let y = var(&mut c, "y");
        let even = c.install(GateType::Even, vec![x, y]);
        named(&mut c, even, "r");
        c.force_true(even).unwrap();
        simplify(&mut c, false).unwrap();
        // One input aliases the other; both names survive on the survivor.
        let survivor = if c.gate(x).is_deleted() { y } else { x };
        assert!(has_name(&c, survivor, "x"));
        assert!(has_name(&c, survivor, "y"));
        assert_edges_consistent(&c);
    }

    #[test]
    fn even_true_keeps_inputs_when_preserving_solutions() {
        let mut c = Circuit::new();
        let x = var(&mut c, "x");
        let y = var(&mut c, "y");
        let even = c.install(GateType::Even, vec![x, y]);
        named(&mut c, even, "r");
        c.may_transform_input_gates = false;
        c.force_true(even).unwrap();
        simplify(&mut c, false).unwrap();
        assert_eq!(c.gate(even).typ, GateType::Even);
        assert_eq!(c.gate(x).typ, GateType::Var);
        assert_eq!(c.gate(y).typ, GateType::Var);
    }

    #[test]
    fn threshold_opposed_pair_shifts_bounds() {
        let mut c = Circuit::new();
        let x = var(&mut c, "x");
        let nx = c.install(GateType::Not, vec![x]);
        let th = c.install_threshold(1, 1, vec![x, nx]);
        named(&mut c, th, "r");
        simplify(&mut c, false).unwrap();
        // Exactly one of x, ~x is always true.
        assert_eq!(c.gate(th).typ, GateType::True);
    }

    #[test]
    fn threshold_upper_bound_falsifies_wider_and() {
        let mut c = Circuit::new();
        let w = var(&mut c, "w");
        let x = var(&mut c, "x");
        let y = var(&mut c, "y");
        let z = var(&mut c, "z");
        let th = c.install_threshold(1, 2, vec![w, x, y, z]);
        let and = c.install(GateType::And, vec![w, x, y]);
        named(&mut c, th, "th");
        named(&mut c, and, "and");
        c.force_true(th).unwrap();
        simplify(&mut c, false).unwrap();
        assert!(c.gate(and).determined);
        assert!(!c.gate(and).value);
    }

    #[test]
    fn atleast_bound_extremes() {
        let mut c = Circuit::new();
        let x = var(&mut c, "x");
        let y = var(&mut c, "y");
        let all = c.install_atleast(2, vec![x, y]);
        named(&mut c, all, "all");
        let none = c.install_atleast(3, vec![x, y]);
        named(&mut c, none, "none");
        simplify(&mut c, false).unwrap();
        // (>= 2)(x,y) is AND(x,y); (>= 3)(x,y) is false.
        assert_eq!(c.gate(all).typ, GateType::And);
        assert_eq!(c.gate(none).typ, GateType::False);
    }

    #[test]
    fn or_absorbs_a_shared_subset() {
        let mut c = Circuit::new();
        let x = var(&mut c, "x");
        let y = var(&mut c, "y");
        let z = var(&mut c, "z");
        let w = var(&mut c, "w");
        let sub = c.install(GateType::Or, vec![y, z]);
        let big = c.install(GateType::Or, vec![x, y, z]);
        let top = c.install(GateType::Or, vec![sub, w]);
        named(&mut c, big, "big");
        named(&mut c, top, "top");
        simplify(&mut c, false).unwrap();
        let mut kids = c.gate(big).children.clone();
        kids.sort_unstable();
        let mut want = vec![x, sub];
        want.sort_unstable();
        assert_eq!(kids, want);
        assert_edges_consistent(&c);
    }

    #[test]
    fn nested_single_parent_or_is_flattened() {
        let mut c = Circuit::new();
        let x = var(&mut c, "x");
        let y = var(&mut c, "y");
        let z = var(&mut c, "z");
        let inner = c.install(GateType::Or, vec![y, z]);
        let outer = c.install(GateType::Or, vec![x, inner]);
        named(&mut c, outer, "r");
        simplify(&mut c, false).unwrap();
        let mut kids = c.gate(outer).children.clone();
        kids.sort_unstable();
        assert_eq!(kids, vec![x, y, z]);
        assert!(c.gate(inner).is_deleted());
    }

    #[test]
    fn simplification_is_idempotent() {
        let mut c = Circuit::new();
        let x = var(&mut c, "x");
        let y = var(&mut c, "y");
        let z = var(&mut c, "z");
        let nx = c.install(GateType::Not, vec![x]);
        let ite = c.install(GateType::Ite, vec![x, y, z]);
        let odd = c.install(GateType::Odd, vec![nx, y, z]);
        let th = c.install_threshold(1, 2, vec![x, y, z]);
        let root = c.install(GateType::And, vec![ite, odd, th]);
        named(&mut c, root, "root");
        c.force_true(root).unwrap();
        simplify(&mut c, false).unwrap();
        let snapshot: Vec<_> = (0..c.len())
            .map(|g| (c.gate(g).typ, c.gate(g).children.clone()))
            .collect();
        simplify(&mut c, false).unwrap();
        let again: Vec<_> = (0..c.len())
            .map(|g| (c.gate(g).typ, c.gate(g).children.clone()))
            .collect();
        assert_eq!(snapshot, again);
        assert_edges_consistent(&c);
    }
}
