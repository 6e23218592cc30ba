//! Rewriting of the circuit into the CNF-normalized shape, in which every
//! remaining gate has a constant-size clause template: no REF gates, no
//! unary OR/AND, no THRESHOLD or ATLEAST, no NOT with a NOT child, and no
//! EQUIV/ODD/EVEN with more than two children.

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::circuit::{Circuit, GateType};
use crate::Conflict;

/// Normalize every gate. Gates synthesized along the way are appended to the
/// store and picked up by the same scan; gates whose rewrite exposed more
/// work re-enter through the propagation stack and are drained at the end,
/// so the shape invariant holds even when the simplifier is skipped.
pub fn cnf_normalize(c: &mut Circuit) -> Result<(), Conflict> {
    let mut g = 0;
    while g < c.len() {
        normalize_gate(c, g)?;
        g += 1;
    }
    while let Some(g) = c.pop() {
        normalize_gate(c, g)?;
    }
    debug!(gates = c.count_gates(), "circuit normalized for CNF translation");
    Ok(())
}

fn normalize_gate(c: &mut Circuit, g: usize) -> Result<(), Conflict> {
    match c.gate(g).typ {
        GateType::Deleted => Ok(()),

        GateType::False => {
            if c.gate(g).determined && c.gate(g).value {
                return Err(Conflict);
            }
            c.gate_mut(g).determined = true;
            c.gate_mut(g).value = false;
            Ok(())
        }
        GateType::True => {
            if c.gate(g).determined && !c.gate(g).value {
                return Err(Conflict);
            }
            c.gate_mut(g).determined = true;
            c.gate_mut(g).value = true;
            Ok(())
        }

        GateType::Var => Ok(()),

        GateType::Ref => {
            let child = c.gate(g).children[0];
            debug_assert_ne!(child, g);
            if c.gate(g).determined {
                let v = c.gate(g).value;
                if c.gate(child).determined && c.gate(child).value != v {
                    return Err(Conflict);
                }
                c.gate_mut(child).determined = true;
                c.gate_mut(child).value = v;
                c.push(child);
            }
            c.redirect_parents(g, child);
            c.migrate_handles(g, child);
            c.remove_all_children(g);
            c.gate_mut(g).typ = GateType::Deleted;
            Ok(())
        }

        GateType::Not => {
            let child = c.gate(g).children[0];
            if c.gate(g).determined {
                // A determined NOT must push its value down, or the NOT-less
                // translation would lose the constraint.
                let v = c.gate(g).value;
                if c.gate(child).determined && c.gate(child).value == v {
                    return Err(Conflict);
                }
                c.gate_mut(child).determined = true;
                c.gate_mut(child).value = !v;
                c.push(child);
                c.transform_into_constant(g, v);
                return Ok(());
            }
            if c.gate(child).typ == GateType::Not {
                // Double negation: alias g to the grandchild.
                let grandchild = c.gate(child).children[0];
                debug_assert_ne!(grandchild, g);
                c.redirect_parents(g, grandchild);
                c.migrate_handles(g, grandchild);
                c.remove_all_children(g);
                c.gate_mut(g).typ = GateType::Deleted;
            }
            Ok(())
        }

        GateType::Or | GateType::And => {
            debug_assert!(!c.gate(g).children.is_empty());
            if c.gate(g).children.len() == 1 {
                c.gate_mut(g).typ = GateType::Ref;
                c.push(g);
            }
            Ok(())
        }

        GateType::Equiv => normalize_equiv(c, g),
        GateType::Ite => Ok(()),
        GateType::Threshold => normalize_threshold(c, g),
        GateType::AtLeast => normalize_atleast(c, g),
        GateType::Even => normalize_even(c, g),
        GateType::Odd => normalize_odd(c, g),

        GateType::Undef => unreachable!("undefined gate reached CNF normalization"),
    }
}

fn normalize_equiv(c: &mut Circuit, g: usize) -> Result<(), Conflict> {
    let n = c.gate(g).children.len();
    debug_assert!(n >= 1);
    if n == 1 {
        if c.gate(g).determined && !c.gate(g).value {
            return Err(Conflict);
        }
        c.transform_into_constant(g, true);
        return Ok(());
    }
    if n == 2 {
        return Ok(());
    }
    // g := EQUIV(c1..cn) --> g := OR(AND(c1..cn), AND(~c1..~cn))
    let kids = c.gate(g).children.clone();
    let all_true = c.install(GateType::And, kids.clone());
    let mut negs = Vec::with_capacity(kids.len());
    for &k in &kids {
        let nk = c.install(GateType::Not, vec![k]);
        c.push(nk);
        negs.push(nk);
    }
    let all_false = c.install(GateType::And, negs);
    c.remove_all_children(g);
    c.gate_mut(g).typ = GateType::Or;
    c.add_child(g, all_true);
    c.add_child(g, all_false);
    c.push(all_true);
    c.push(all_false);
    Ok(())
}

fn normalize_even(c: &mut Circuit, g: usize) -> Result<(), Conflict> {
    let n = c.gate(g).children.len();
    debug_assert!(n >= 1);
    if n == 1 {
        c.gate_mut(g).typ = GateType::Not;
        c.push(g);
        return Ok(());
    }
    if n == 2 {
        return Ok(());
    }
    // EVEN(c1..cn) --> NOT(ODD(c1..cn))
    let kids = c.gate(g).children.clone();
    c.remove_all_children(g);
    let odd = c.install(GateType::Odd, kids);
    c.gate_mut(g).typ = GateType::Not;
    c.add_child(g, odd);
    c.push(g);
    c.push(odd);
    Ok(())
}

fn normalize_odd(c: &mut Circuit, g: usize) -> Result<(), Conflict> {
    let n = c.gate(g).children.len();
    debug_assert!(n >= 1);
    if n == 1 {
        c.gate_mut(g).typ = GateType::Ref;
        c.push(g);
        return Ok(());
    }
    if n == 2 {
        return Ok(());
    }
    // ODD(c1..cn) --> ODD(c1, ODD(c2..cn)); the tail is decomposed further
    // when the scan reaches it.
    let kids = c.gate(g).children.clone();
    c.remove_all_children(g);
    let rest = c.install(GateType::Odd, kids[1..].to_vec());
    c.add_child(g, kids[0]);
    c.add_child(g, rest);
    c.push(rest);
    Ok(())
}

fn normalize_threshold(c: &mut Circuit, g: usize) -> Result<(), Conflict> {
    let n = c.gate(g).children.len();
    debug_assert!(n >= 1);
    if c.gate(g).tmin > n {
        return threshold_to_constant(c, g, false);
    }
    if c.gate(g).tmax > n {
        c.gate_mut(g).tmax = n;
    }
    if c.gate(g).tmin > c.gate(g).tmax {
        return threshold_to_constant(c, g, false);
    }
    let (tmin, tmax) = (c.gate(g).tmin, c.gate(g).tmax);

    if n == 1 {
        return match (tmin, tmax) {
            (0, 1) => threshold_to_constant(c, g, true),
            (0, 0) => {
                let gate = c.gate_mut(g);
                gate.typ = GateType::Not;
                gate.tmin = 0;
                gate.tmax = 0;
                c.push(g);
                Ok(())
            }
            (1, 1) => {
                let gate = c.gate_mut(g);
                gate.typ = GateType::Ref;
                gate.tmin = 0;
                gate.tmax = 0;
                c.push(g);
                Ok(())
            }
            _ => unreachable!("unary threshold with bounds [{},{}]", tmin, tmax),
        };
    }

    if tmin == 0 && tmax == n {
        return threshold_to_constant(c, g, true);
    }
    if tmin == 1 && tmax == n {
        let gate = c.gate_mut(g);
        gate.typ = GateType::Or;
        gate.tmin = 0;
        gate.tmax = 0;
        c.push(g);
        return Ok(());
    }

    // Narrow bounds get the sharing decomposition through ATLEAST gates;
    // wide ones the unary counter, whose size is O(n log n) instead of
    // O(tmin * n).
    let narrow = tmax <= 2 || tmin + 2 >= n || (tmin <= 2 && tmax + 2 >= n);
    if !narrow {
        let kids = c.gate(g).children.clone();
        let sum = true_counter(c, &kids);
        let width = sum.len();
        let lo = unsigned_const(c, tmin, width);
        let hi = unsigned_const(c, tmax, width);
        let ge = unsigned_ge(c, &sum, &lo);
        let le = unsigned_ge(c, &hi, &sum);
        c.remove_all_children(g);
        let gate = c.gate_mut(g);
        gate.typ = GateType::And;
        gate.tmin = 0;
        gate.tmax = 0;
        c.add_child(g, ge);
        c.add_child(g, le);
        return Ok(());
    }

    if tmin == 0 {
        // [0,u](c1..cn) = ~(>= u+1)(c1..cn)
        let kids = c.gate(g).children.clone();
        c.remove_all_children(g);
        let atleast = c.install_atleast(tmax + 1, kids);
        let gate = c.gate_mut(g);
        gate.typ = GateType::Not;
        gate.tmin = 0;
        gate.tmax = 0;
        c.add_child(g, atleast);
        c.push(g);
        c.push(atleast);
        return Ok(());
    }
    if tmax == n {
        // [l,n](c1..cn) = (>= l)(c1..cn)
        let gate = c.gate_mut(g);
        gate.typ = GateType::AtLeast;
        gate.tmax = 0;
        c.push(g);
        return Ok(());
    }
    // [l,u](c1..cn) = (>= l)(c1..cn) & ~(>= u+1)(c1..cn)
    let kids = c.gate(g).children.clone();
    let low = c.install_atleast(tmin, kids.clone());
    let high = c.install_atleast(tmax + 1, kids);
    let not_high = c.install(GateType::Not, vec![high]);
    c.remove_all_children(g);
    let gate = c.gate_mut(g);
    gate.typ = GateType::And;
    gate.tmin = 0;
    gate.tmax = 0;
    c.add_child(g, low);
    c.add_child(g, not_high);
    c.push(low);
    c.push(high);
    c.push(not_high);
    Ok(())
}

fn threshold_to_constant(c: &mut Circuit, g: usize, v: bool) -> Result<(), Conflict> {
    if c.gate(g).determined && c.gate(g).value != v {
        return Err(Conflict);
    }
    c.transform_into_constant(g, v);
    Ok(())
}

fn normalize_atleast(c: &mut Circuit, g: usize) -> Result<(), Conflict> {
    let n = c.gate(g).children.len();
    debug_assert!(n >= 1);
    let tmin = c.gate(g).tmin;
    if tmin == 0 {
        return threshold_to_constant(c, g, true);
    }
    if tmin > n {
        return threshold_to_constant(c, g, false);
    }
    if tmin == 1 {
        let gate = c.gate_mut(g);
        gate.typ = GateType::Or;
        gate.tmin = 0;
        c.push(g);
        return Ok(());
    }
    if tmin == n {
        let gate = c.gate_mut(g);
        gate.typ = GateType::And;
        gate.tmin = 0;
        c.push(g);
        return Ok(());
    }

    // (>= l)(x1..xn) == (xn & (>= l-1)(x1..x_{n-1})) | (>= l)(x1..x_{n-1}),
    // computed bottom-up over the table a[i][j] = (>= i)(x1..xj) with the
    // bases a[1][j] = OR(x1..xj) and a[i][i] = AND(x1..xi). Sharing the
    // subresults keeps the rewriting at O(l * n) gates. All entries are
    // synthesized fresh; the original gate becomes the top OR.
    let xs = c.gate(g).children.clone();
    let l = tmin;
    let mut table: FxHashMap<(usize, usize), usize> = FxHashMap::default();
    for i in 1..=l {
        for j in i..=(n - (l - i)) {
            if i == l && j == n {
                break;
            }
            let entry = if i == 1 {
                if j == 1 {
                    xs[0]
                } else {
                    let prev = table[&(1, j - 1)];
                    c.install(GateType::Or, vec![xs[j - 1], prev])
                }
            } else if i == j {
                let diag = table[&(i - 1, j - 1)];
                c.install(GateType::And, vec![xs[j - 1], diag])
            } else {
                let diag = table[&(i - 1, j - 1)];
                let with_last = c.install(GateType::And, vec![xs[j - 1], diag]);
                let without_last = table[&(i, j - 1)];
                c.install(GateType::Or, vec![with_last, without_last])
            };
            table.insert((i, j), entry);
        }
    }
    let diag = table[&(l - 1, n - 1)];
    let with_last = c.install(GateType::And, vec![xs[n - 1], diag]);
    let without_last = table[&(l, n - 1)];
    c.remove_all_children(g);
    let gate = c.gate_mut(g);
    gate.typ = GateType::Or;
    gate.tmin = 0;
    c.add_child(g, with_last);
    c.add_child(g, without_last);
    Ok(())
}

/// Synthesize the little-endian bit vector of `x1 + x2 + ... + xn`, each
/// input counting 1 when true. Divide and conquer with ripple-carry adders
/// built from binary parity, AND and OR gates, so the result is already in
/// the CNF-normalized shape.
fn true_counter(c: &mut Circuit, xs: &[usize]) -> Vec<usize> {
    debug_assert!(!xs.is_empty());
    if xs.len() == 1 {
        return vec![xs[0]];
    }
    let mid = xs.len() / 2;
    let a = true_counter(c, &xs[..mid]);
    let b = true_counter(c, &xs[mid..]);
    ripple_add(c, &a, &b)
}

fn ripple_add(c: &mut Circuit, a: &[usize], b: &[usize]) -> Vec<usize> {
    let width = a.len().max(b.len());
    let mut out = Vec::with_capacity(width + 1);
    let mut carry: Option<usize> = None;
    for i in 0..width {
        let (sum, new_carry) = match (a.get(i).copied(), b.get(i).copied(), carry) {
            (Some(x), Some(y), None) => {
                let s = c.install(GateType::Odd, vec![x, y]);
                let cy = c.install(GateType::And, vec![x, y]);
                (s, Some(cy))
            }
            (Some(x), Some(y), Some(cin)) => {
                let xy = c.install(GateType::Odd, vec![x, y]);
                let s = c.install(GateType::Odd, vec![xy, cin]);
                let both = c.install(GateType::And, vec![x, y]);
                let propagated = c.install(GateType::And, vec![cin, xy]);
                let cy = c.install(GateType::Or, vec![both, propagated]);
                (s, Some(cy))
            }
            (Some(x), None, Some(cin)) | (None, Some(x), Some(cin)) => {
                let s = c.install(GateType::Odd, vec![x, cin]);
                let cy = c.install(GateType::And, vec![x, cin]);
                (s, Some(cy))
            }
            (Some(x), None, None) | (None, Some(x), None) => (x, None),
            (None, None, _) => unreachable!("adder ran past both operand widths"),
        };
        out.push(sum);
        carry = new_carry;
    }
    if let Some(cy) = carry {
        out.push(cy);
    }
    out
}

/// Constant bit vector of `value`, little-endian, `width` bits. The constant
/// gates are shared within one call.
fn unsigned_const(c: &mut Circuit, value: usize, width: usize) -> Vec<usize> {
    debug_assert!(width >= usize::BITS as usize - value.leading_zeros() as usize);
    let mut true_gate = None;
    let mut false_gate = None;
    let mut out = Vec::with_capacity(width);
    for bit in 0..width {
        let gate = if value >> bit & 1 == 1 {
            *true_gate.get_or_insert_with(|| c.install(GateType::True, vec![]))
        } else {
            *false_gate.get_or_insert_with(|| c.install(GateType::False, vec![]))
        };
        out.push(gate);
    }
    out
}

/// Gate computing `a >= b` over two little-endian bit vectors of equal
/// width: folding up from the least significant bit,
/// `ge_i = (a_i > b_i) | (a_i = b_i & ge_{i-1})`.
fn unsigned_ge(c: &mut Circuit, a: &[usize], b: &[usize]) -> usize {
    debug_assert_eq!(a.len(), b.len());
    debug_assert!(!a.is_empty());
    let mut ge: Option<usize> = None;
    for (&ai, &bi) in a.iter().zip(b) {
        let not_b = c.install(GateType::Not, vec![bi]);
        let gt = c.install(GateType::And, vec![ai, not_b]);
        let eq = c.install(GateType::Equiv, vec![ai, bi]);
        ge = Some(match ge {
            None => c.install(GateType::Or, vec![gt, eq]),
            Some(prev) => {
                let keep = c.install(GateType::And, vec![eq, prev]);
                c.install(GateType::Or, vec![gt, keep])
            }
        });
    }
    ge.expect("comparison of empty bit vectors")
}

/// Shape invariant of the normalized circuit, checked by the test suite.
#[cfg(test)]
pub(crate) fn assert_cnf_shape(c: &Circuit) {
    for g in 0..c.len() {
        let gate = c.gate(g);
        match gate.typ {
            GateType::Deleted | GateType::False | GateType::True | GateType::Var => {}
            GateType::Ref => panic!("REF gate {} left after normalization", g),
            GateType::Threshold | GateType::AtLeast => {
                panic!("cardinality gate {} left after normalization", g)
            }
            GateType::Undef => panic!("undefined gate {} left after normalization", g),
            GateType::Not => {
                assert_eq!(gate.children.len(), 1);
                assert_ne!(
                    c.gate(gate.children[0]).typ,
                    GateType::Not,
                    "double negation left after normalization"
                );
            }
            GateType::Or | GateType::And => {
                assert!(gate.children.len() >= 2, "unary gate {} after normalization", g)
            }
            GateType::Equiv | GateType::Odd | GateType::Even => {
                assert_eq!(gate.children.len(), 2, "n-ary parity gate {} left", g)
            }
            GateType::Ite => assert_eq!(gate.children.len(), 3),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{assert_edges_consistent, Handle};
    use crate::simplify::simplify;

    fn vars(c: &mut Circuit, n: usize) -> Vec<usize> {
        (0..n).map(|_| c.install(GateType::Var, vec![])).collect()
    }

    fn constrained(c: &mut Circuit, g: usize, name: &str) {
        c.gate_mut(g).handles.push(Handle::Name(name.to_string()));
        c.force_true(g).unwrap();
    }

    #[test]
    fn nary_equiv_becomes_or_of_ands() {
        let mut c = Circuit::new();
        let xs = vars(&mut c, 3);
        let eq = c.install(GateType::Equiv, xs);
        constrained(&mut c, eq, "eq");
        cnf_normalize(&mut c).unwrap();
        assert_eq!(c.gate(eq).typ, GateType::Or);
        assert_eq!(c.gate(eq).children.len(), 2);
        assert_cnf_shape(&c);
        assert_edges_consistent(&c);
    }

    #[test]
    fn nary_odd_decomposes_to_binary_chain() {
        let mut c = Circuit::new();
        let xs = vars(&mut c, 5);
        let odd = c.install(GateType::Odd, xs);
        constrained(&mut c, odd, "odd");
        cnf_normalize(&mut c).unwrap();
        assert_cnf_shape(&c);
        assert_edges_consistent(&c);
    }

    #[test]
    fn unary_or_is_removed_even_without_simplification() {
        let mut c = Circuit::new();
        let xs = vars(&mut c, 1);
        let or = c.install(GateType::Or, xs.clone());
        constrained(&mut c, or, "o");
        cnf_normalize(&mut c).unwrap();
        // The OR became a REF and the REF was drained away.
        assert!(c.gate(or).is_deleted());
        assert_eq!(c.gate(xs[0]).first_name(), Some("o"));
        assert!(c.gate(xs[0]).determined && c.gate(xs[0]).value);
        assert_cnf_shape(&c);
    }

    #[test]
    fn threshold_sharing_decomposition() {
        let mut c = Circuit::new();
        let xs = vars(&mut c, 3);
        let th = c.install_threshold(2, 2, xs);
        constrained(&mut c, th, "th");
        cnf_normalize(&mut c).unwrap();
        assert_cnf_shape(&c);
        assert_edges_consistent(&c);
    }

    #[test]
    fn threshold_counter_construction() {
        let mut c = Circuit::new();
        let xs = vars(&mut c, 12);
        let th = c.install_threshold(4, 8, xs);
        constrained(&mut c, th, "th");
        cnf_normalize(&mut c).unwrap();
        assert_cnf_shape(&c);
        assert_edges_consistent(&c);
    }

    #[test]
    fn counter_counts_trues() {
        // Evaluate the adder network against a direct popcount for every
        // assignment of five inputs.
        for pattern in 0u32..32 {
            let mut c = Circuit::new();
            let xs = vars(&mut c, 5);
            for (bit, &x) in xs.iter().enumerate() {
                if pattern >> bit & 1 == 1 {
                    c.force_true(x).unwrap();
                } else {
                    c.force_false(x).unwrap();
                }
            }
            let sum = true_counter(&mut c, &xs);
            c.evaluate_all();
            let mut got = 0u32;
            for (bit, &s) in sum.iter().enumerate() {
                assert!(c.gate(s).determined);
                if c.gate(s).value {
                    got |= 1 << bit;
                }
            }
            assert_eq!(got, pattern.count_ones());
        }
    }

    #[test]
    fn atleast_table_matches_direct_counting() {
        // (>= 2)(a,b,c,d): normalize, then check by evaluation on all 16
        // assignments.
        for pattern in 0u32..16 {
            let mut c = Circuit::new();
            let xs = vars(&mut c, 4);
            let al = c.install_atleast(2, xs.clone());
            c.gate_mut(al).handles.push(Handle::Name("al".to_string()));
            cnf_normalize(&mut c).unwrap();
            assert_cnf_shape(&c);
            for (bit, &x) in xs.iter().enumerate() {
                if pattern >> bit & 1 == 1 {
                    c.force_true(x).unwrap();
                } else {
                    c.force_false(x).unwrap();
                }
            }
            c.evaluate_all();
            let root = (0..c.len())
                .find(|&g| c.gate(g).first_name() == Some("al"))
                .unwrap();
            assert_eq!(
                c.gate(root).value,
                pattern.count_ones() >= 2,
                "wrong value for assignment {:04b}",
                pattern
            );
        }
    }

    #[test]
    fn normalized_circuit_simplifies_without_losing_shape() {
        let mut c = Circuit::new();
        let xs = vars(&mut c, 6);
        let th = c.install_threshold(2, 4, xs.clone());
        let odd = c.install(GateType::Odd, xs[..3].to_vec());
        let both = c.install(GateType::And, vec![th, odd]);
        constrained(&mut c, both, "root");
        simplify(&mut c, false).unwrap();
        cnf_normalize(&mut c).unwrap();
        simplify(&mut c, true).unwrap();
        assert_cnf_shape(&c);
        assert_edges_consistent(&c);
    }
}
