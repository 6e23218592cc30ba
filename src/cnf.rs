//! Cone-of-influence selection, DIMACS variable numbering, polarity
//! analysis and the Tseitin clause emitter.
//!
//! The emitter runs in two passes over the relevant gates: the first counts
//! clauses exactly for the `p cnf V C` header, the second writes them. The
//! two counts are asserted equal.

use std::io::{self, Write};

use tracing::{debug, info};

use crate::circuit::{Circuit, GateType};
use crate::normalize::cnf_normalize;
use crate::share::share;
use crate::simplify::simplify;
use crate::Conflict;

/// Options of the circuit-to-CNF translation.
#[derive(Clone, Debug)]
pub struct TranslateOpts {
    /// Run the fixed-point simplifier (structural sharing runs regardless).
    pub simplify: bool,
    /// Restrict the CNF to the cone of influence of the constraints.
    pub coi: bool,
    /// NOT-less translation: NOT gates carry no variable; their literal is
    /// the negation of the child's.
    pub notless: bool,
    /// Plaisted-Greenbaum encoding: emit only the clauses required by the
    /// polarities in which each gate is actually used.
    pub polarity: bool,
    /// Forbid rewrites that change the set of satisfying assignments.
    pub preserve_all: bool,
    /// Permute the CNF variable indices with this seed.
    pub permute_seed: Option<u32>,
}

impl Default for TranslateOpts {
    fn default() -> TranslateOpts {
        TranslateOpts {
            simplify: true,
            coi: true,
            notless: true,
            polarity: false,
            preserve_all: false,
            permute_seed: None,
        }
    }
}

/// DIMACS variable assignment of the relevant gates. `var_of` is 0 for
/// gates outside the cone of influence and for NOT gates in NOT-less mode.
pub struct Numbering {
    var: Vec<i32>,
    relevant: Vec<bool>,
    pub max_var: i32,
    pub relevant_inputs: usize,
}

impl Numbering {
    pub fn var_of(&self, g: usize) -> i32 {
        self.var[g]
    }

    pub fn is_relevant(&self, g: usize) -> bool {
        self.relevant[g]
    }
}

/// Outcome of [`prepare`]: either the circuit is already decided (every
/// constraint justified), or a numbered CNF shape ready for emission.
pub enum Prepared {
    TriviallySat,
    Cnf(Numbering),
}

/// Run the rewriting pipeline on a circuit whose constraint queues have
/// already been applied: simplify (or just share), CNF-normalize, clean up,
/// then select and number the relevant gates and compute polarities when
/// requested.
pub fn prepare(c: &mut Circuit, opts: &TranslateOpts) -> Result<Prepared, Conflict> {
    c.may_transform_input_gates = !opts.preserve_all;

    if opts.simplify {
        simplify(c, false)?;
    } else {
        share(c)?;
    }
    cnf_normalize(c)?;
    if opts.simplify {
        simplify(c, true)?;
    } else {
        share(c)?;
    }

    let mut relevant = vec![false; c.len()];
    let mut nof_relevant = 0usize;
    for g in 0..c.len() {
        if c.gate(g).is_deleted() {
            continue;
        }
        if !opts.coi || (c.gate(g).determined && !c.is_justified(g)) {
            mark_coi(c, g, &mut relevant, &mut nof_relevant);
        }
    }
    info!(relevant = nof_relevant, "cone of influence marked");
    if nof_relevant == 0 {
        // Every constraint is already explained: the circuit is satisfiable
        // and a model can be read off by evaluation.
        c.evaluate_all();
        assert!(
            c.check_consistency(),
            "evaluation produced an inconsistent assignment"
        );
        return Ok(Prepared::TriviallySat);
    }

    let mut var = vec![0i32; c.len()];
    let mut max_var = 0i32;
    let mut relevant_inputs = 0usize;
    for g in 0..c.len() {
        if !relevant[g] {
            continue;
        }
        if opts.notless && c.gate(g).typ == GateType::Not {
            assert!(
                !c.gate(g).determined,
                "determined NOT gate {} survived normalization",
                g
            );
            assert!(
                c.gate(c.gate(g).children[0]).typ != GateType::Not,
                "double negation at gate {} survived normalization",
                g
            );
        } else {
            max_var += 1;
            var[g] = max_var;
        }
        if c.gate(g).typ == GateType::Var {
            relevant_inputs += 1;
        }
    }
    info!(inputs = relevant_inputs, vars = max_var, "gates numbered");

    if let Some(seed) = opts.permute_seed {
        let perm = permutation(max_var as usize, seed);
        for v in var.iter_mut() {
            if *v > 0 {
                *v = perm[*v as usize];
            }
        }
        debug!(seed, "variable indices permuted");
    }

    if opts.polarity {
        compute_polarity(c);
    }

    Ok(Prepared::Cnf(Numbering {
        var,
        relevant,
        max_var,
        relevant_inputs,
    }))
}

fn mark_coi(c: &Circuit, root: usize, relevant: &mut [bool], count: &mut usize) {
    if relevant[root] {
        return;
    }
    relevant[root] = true;
    *count += 1;
    let mut stack = vec![root];
    while let Some(g) = stack.pop() {
        for &ch in &c.gate(g).children {
            if !relevant[ch] {
                relevant[ch] = true;
                *count += 1;
                stack.push(ch);
            }
        }
    }
}

/// Knuth-shuffle permutation of `1..=n` (index 0 unused), driven by a
/// SplitMix64 stream so the emitted CNF is identical across runs and
/// platforms for a given seed.
fn permutation(n: usize, seed: u32) -> Vec<i32> {
    let mut state = seed as u64;
    let mut next = || {
        state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    };
    let mut perm: Vec<i32> = (0..=n as i32).collect();
    for i in (2..=n).rev() {
        let j = 1 + (next() % i as u64) as usize;
        perm.swap(i, j);
    }
    perm
}

/// Compute the reachable polarities (`mir_pos`/`mir_neg`) of every gate for
/// the Plaisted-Greenbaum encoding, starting from each determined gate in
/// the direction of its value. The flags are monotonic, so every gate is
/// expanded at most twice.
fn compute_polarity(c: &mut Circuit) {
    let mut work: Vec<(usize, bool)> = Vec::new();
    for g in 0..c.len() {
        if !c.gate(g).is_deleted() && c.gate(g).determined {
            work.push((g, c.gate(g).value));
        }
    }
    while let Some((g, pol)) = work.pop() {
        if c.gate(g).determined {
            if c.gate(g).value != pol {
                continue;
            }
            if c.is_justified(g) {
                continue;
            }
        }
        if pol {
            if c.gate(g).mir_pos {
                continue;
            }
            c.gate_mut(g).mir_pos = true;
        } else {
            if c.gate(g).mir_neg {
                continue;
            }
            c.gate_mut(g).mir_neg = true;
        }
        let children = c.gate(g).children.clone();
        match c.gate(g).typ {
            GateType::False | GateType::True | GateType::Var => {}
            GateType::Not => work.push((children[0], !pol)),
            GateType::Ref => work.push((children[0], pol)),
            GateType::Or | GateType::And | GateType::AtLeast => {
                for ch in children {
                    work.push((ch, pol));
                }
            }
            GateType::Equiv => {
                for ch in children {
                    work.push((ch, pol));
                    work.push((ch, !pol));
                }
            }
            GateType::Odd | GateType::Even => {
                let (nof_true, _, nof_undet) = c.child_info(g);
                if nof_undet == 1 {
                    // With one open child the required polarity follows from
                    // the parity of the determined ones.
                    let even_gate = c.gate(g).typ == GateType::Even;
                    let desired = pol ^ (nof_true % 2 == if even_gate { 0 } else { 1 });
                    for ch in children {
                        work.push((ch, desired));
                    }
                } else {
                    for ch in children {
                        work.push((ch, pol));
                        work.push((ch, !pol));
                    }
                }
            }
            GateType::Ite => {
                work.push((children[0], pol));
                work.push((children[0], !pol));
                work.push((children[1], pol));
                work.push((children[2], pol));
            }
            GateType::Threshold => {
                let (nof_true, nof_false, nof_undet) = c.child_info(g);
                let n = nof_true + nof_false + nof_undet;
                let (tmin, tmax) = (c.gate(g).tmin, c.gate(g).tmax);
                let lower_met = nof_true >= tmin;
                let upper_holds = n - nof_false <= tmax;
                let single = if pol {
                    if lower_met {
                        Some(false)
                    } else if upper_holds {
                        Some(true)
                    } else {
                        None
                    }
                } else if lower_met {
                    Some(true)
                } else if upper_holds {
                    Some(false)
                } else {
                    None
                };
                match single {
                    Some(p) => {
                        for ch in children {
                            work.push((ch, p));
                        }
                    }
                    None => {
                        for ch in children {
                            work.push((ch, pol));
                            work.push((ch, !pol));
                        }
                    }
                }
            }
            GateType::Undef | GateType::Deleted => {
                unreachable!("polarity propagation reached a deleted gate")
            }
        }
    }
}

/// The DIMACS literal of a child reference: in NOT-less mode a NOT child is
/// the negation of its own child's variable.
fn child_lit(c: &Circuit, num: &Numbering, notless: bool, child: usize) -> i32 {
    if notless && c.gate(child).typ == GateType::Not {
        let grandchild = c.gate(child).children[0];
        let v = num.var[grandchild];
        assert!(v > 0, "NOT child of gate without a variable");
        -v
    } else {
        let v = num.var[child];
        assert!(v > 0, "clause references an unnumbered gate");
        v
    }
}

fn emission_sides(c: &Circuit, g: usize, polarity: bool) -> (bool, bool) {
    if polarity {
        (c.gate(g).mir_pos, c.gate(g).mir_neg)
    } else {
        (true, true)
    }
}

/// Number of translation clauses of `g` (not counting its unit clause).
pub fn gate_clause_count(c: &Circuit, g: usize, opts: &TranslateOpts) -> usize {
    let (pos, neg) = emission_sides(c, g, opts.polarity);
    let n = c.gate(g).children.len();
    match c.gate(g).typ {
        GateType::False | GateType::True | GateType::Var => 0,
        GateType::Ref => {
            assert!(!opts.notless, "REF gate {} in NOT-less emission", g);
            pos as usize + neg as usize
        }
        GateType::Not => {
            if opts.notless {
                0
            } else {
                pos as usize + neg as usize
            }
        }
        GateType::Or => (pos as usize) + (if neg { n } else { 0 }),
        GateType::And => (if pos { n } else { 0 }) + (neg as usize),
        GateType::Equiv | GateType::Even | GateType::Odd => {
            assert_eq!(n, 2, "n-ary parity gate {} in emission", g);
            2 * pos as usize + 2 * neg as usize
        }
        GateType::Ite => 2 * pos as usize + 2 * neg as usize,
        t => unreachable!("gate {} of type {:?} in CNF emission", g, t),
    }
}

/// Append the translation clauses of `g` to `out`.
pub fn gate_clauses(
    c: &Circuit,
    num: &Numbering,
    g: usize,
    opts: &TranslateOpts,
    out: &mut Vec<Vec<i32>>,
) {
    let (pos, neg) = emission_sides(c, g, opts.polarity);
    let lit = |ch: usize| child_lit(c, num, opts.notless, ch);
    let v = num.var[g];
    match c.gate(g).typ {
        GateType::False | GateType::True | GateType::Var => {}
        GateType::Ref => {
            assert!(!opts.notless, "REF gate {} in NOT-less emission", g);
            let cl = lit(c.gate(g).children[0]);
            if pos {
                out.push(vec![-v, cl]);
            }
            if neg {
                out.push(vec![v, -cl]);
            }
        }
        GateType::Not => {
            if opts.notless {
                assert!(!c.gate(g).determined, "determined NOT gate {} in emission", g);
                return;
            }
            let cl = lit(c.gate(g).children[0]);
            if pos {
                out.push(vec![-v, -cl]);
            }
            if neg {
                out.push(vec![v, cl]);
            }
        }
        GateType::Or => {
            if pos {
                let mut clause = vec![-v];
                clause.extend(c.gate(g).children.iter().map(|&ch| lit(ch)));
                out.push(clause);
            }
            if neg {
                for &ch in &c.gate(g).children {
                    out.push(vec![v, -lit(ch)]);
                }
            }
        }
        GateType::And => {
            if pos {
                for &ch in &c.gate(g).children {
                    out.push(vec![-v, lit(ch)]);
                }
            }
            if neg {
                let mut clause = vec![v];
                clause.extend(c.gate(g).children.iter().map(|&ch| -lit(ch)));
                out.push(clause);
            }
        }
        GateType::Equiv | GateType::Even => {
            assert_eq!(c.gate(g).children.len(), 2, "n-ary parity gate {} in emission", g);
            let c1 = lit(c.gate(g).children[0]);
            let c2 = lit(c.gate(g).children[1]);
            if pos {
                out.push(vec![-v, -c1, c2]);
                out.push(vec![-v, c1, -c2]);
            }
            if neg {
                out.push(vec![v, -c1, -c2]);
                out.push(vec![v, c1, c2]);
            }
        }
        GateType::Odd => {
            assert_eq!(c.gate(g).children.len(), 2, "n-ary parity gate {} in emission", g);
            let c1 = lit(c.gate(g).children[0]);
            let c2 = lit(c.gate(g).children[1]);
            if pos {
                out.push(vec![-v, -c1, -c2]);
                out.push(vec![-v, c1, c2]);
            }
            if neg {
                out.push(vec![v, -c1, c2]);
                out.push(vec![v, c1, -c2]);
            }
        }
        GateType::Ite => {
            let i = lit(c.gate(g).children[0]);
            let t = lit(c.gate(g).children[1]);
            let e = lit(c.gate(g).children[2]);
            if pos {
                out.push(vec![-v, -i, t]);
                out.push(vec![-v, i, e]);
            }
            if neg {
                out.push(vec![v, -i, -t]);
                out.push(vec![v, i, -e]);
            }
        }
        t => unreachable!("gate {} of type {:?} in CNF emission", g, t),
    }
}

/// Full clause list of the numbered circuit, unit clauses included. Used by
/// the embedded solver path and by tests.
pub fn collect_clauses(c: &Circuit, num: &Numbering, opts: &TranslateOpts) -> Vec<Vec<i32>> {
    let mut out = Vec::new();
    for g in 0..c.len() {
        if !num.relevant[g] {
            continue;
        }
        gate_clauses(c, num, g, opts, &mut out);
        if c.gate(g).determined {
            out.push(vec![unit_lit(c, num, g)]);
        }
    }
    out
}

fn unit_lit(c: &Circuit, num: &Numbering, g: usize) -> i32 {
    let v = num.var[g];
    assert!(v > 0, "determined gate {} without a variable", g);
    if c.gate(g).value {
        v
    } else {
        -v
    }
}

/// Write the numbered circuit as a DIMACS CNF file: a comment block mapping
/// every surviving name to its literal, the exact `p cnf` header, and the
/// clauses.
pub fn write_dimacs<W: Write>(
    c: &Circuit,
    num: &Numbering,
    opts: &TranslateOpts,
    w: &mut W,
) -> io::Result<()> {
    writeln!(w, "c CNF translation of a Boolean constraint circuit")?;
    writeln!(w, "c produced by bc2cnf")?;

    for g in 0..c.len() {
        if !num.relevant[g] || c.gate(g).handles.is_empty() {
            continue;
        }
        // Under the polarity encoding only input variables keep a faithful
        // two-sided meaning, so the map is restricted to them.
        if opts.polarity && c.gate(g).typ != GateType::Var {
            continue;
        }
        let lit = if opts.notless && c.gate(g).typ == GateType::Not {
            let grandchild = c.gate(g).children[0];
            if num.var[grandchild] == 0 {
                continue;
            }
            -num.var[grandchild]
        } else {
            if num.var[g] == 0 {
                continue;
            }
            num.var[g]
        };
        for h in &c.gate(g).handles {
            writeln!(w, "c {} <-> {}", h.name(), lit)?;
        }
    }

    let mut nof_clauses = 0usize;
    for g in 0..c.len() {
        if !num.relevant[g] {
            continue;
        }
        nof_clauses += gate_clause_count(c, g, opts);
        if c.gate(g).determined {
            nof_clauses += 1;
        }
    }
    info!(vars = num.max_var, clauses = nof_clauses, "writing DIMACS");
    writeln!(w, "p cnf {} {}", num.max_var, nof_clauses)?;

    let mut written = 0usize;
    let mut buf: Vec<Vec<i32>> = Vec::new();
    for g in 0..c.len() {
        if !num.relevant[g] {
            continue;
        }
        buf.clear();
        gate_clauses(c, num, g, opts, &mut buf);
        for clause in &buf {
            for l in clause {
                write!(w, "{} ", l)?;
            }
            writeln!(w, "0")?;
        }
        written += buf.len();
        if c.gate(g).determined {
            writeln!(w, "{} 0", unit_lit(c, num, g))?;
            written += 1;
        }
    }
    assert_eq!(
        written, nof_clauses,
        "clause count differs between the counting and writing passes"
    );
    Ok(())
}

/// The circuit was decided during translation: emit a canned satisfiable
/// formula with the witness assignment in the comments.
pub fn write_trivial_sat<W: Write>(c: &Circuit, w: &mut W) -> io::Result<()> {
    writeln!(w, "c The instance was satisfiable")?;
    for g in 0..c.len() {
        if c.gate(g).is_deleted() {
            continue;
        }
        debug_assert!(c.gate(g).determined);
        for h in &c.gate(g).handles {
            writeln!(w, "c {} <-> {}", h.name(), if c.gate(g).value { "T" } else { "F" })?;
        }
    }
    writeln!(w, "p cnf 1 1")?;
    writeln!(w, "1 0")
}

/// Contradictory constraints: emit a canned unsatisfiable formula.
pub fn write_trivial_unsat<W: Write>(w: &mut W) -> io::Result<()> {
    writeln!(w, "c The instance was unsatisfiable")?;
    writeln!(w, "p cnf 1 2")?;
    writeln!(w, "1 0")?;
    writeln!(w, "-1 0")
}

/// True iff some literal of the clause holds in the model (indexed by
/// variable, entry 0 unused).
pub fn eval_clause(lits: &[i32], model: &[bool]) -> bool {
    lits.iter().any(|&l| model[l.unsigned_abs() as usize] == (l > 0))
}

/// True iff every clause holds in the model.
pub fn eval_formula(clauses: &[Vec<i32>], model: &[bool]) -> bool {
    clauses.iter().all(|cl| eval_clause(cl, model))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::Handle;
    use quickcheck::quickcheck;

    fn named(c: &mut Circuit, g: usize, name: &str) {
        c.gate_mut(g).handles.push(Handle::Name(name.to_string()));
    }

    fn dimacs_string(c: &Circuit, num: &Numbering, opts: &TranslateOpts) -> String {
        let mut buf = Vec::new();
        write_dimacs(c, num, opts, &mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn binary_equiv_has_five_clauses() {
        let mut c = Circuit::new();
        let x = c.install(GateType::Var, vec![]);
        let y = c.install(GateType::Var, vec![]);
        let r = c.install(GateType::Equiv, vec![x, y]);
        named(&mut c, x, "x");
        named(&mut c, y, "y");
        named(&mut c, r, "r");
        c.assigned_to_true.push_back(r);
        c.apply_assignments().unwrap();
        // Input-gate rewriting would alias x to y and decide the circuit;
        // keep all solutions so the EQUIV survives to the emitter.
        let opts = TranslateOpts {
            preserve_all: true,
            ..TranslateOpts::default()
        };
        let num = match prepare(&mut c, &opts).unwrap() {
            Prepared::Cnf(n) => n,
            Prepared::TriviallySat => panic!("EQUIV constraint is not trivial"),
        };
        assert_eq!(num.max_var, 3);
        let text = dimacs_string(&c, &num, &opts);
        assert!(text.contains("p cnf 3 5"), "{}", text);
    }

    #[test]
    fn ite_has_four_clauses_plus_unit() {
        let mut c = Circuit::new();
        let a = c.install(GateType::Var, vec![]);
        let b = c.install(GateType::Var, vec![]);
        let d = c.install(GateType::Var, vec![]);
        let r = c.install(GateType::Ite, vec![a, b, d]);
        named(&mut c, r, "r");
        c.assigned_to_true.push_back(r);
        c.apply_assignments().unwrap();
        let opts = TranslateOpts::default();
        let num = match prepare(&mut c, &opts).unwrap() {
            Prepared::Cnf(n) => n,
            Prepared::TriviallySat => panic!("ITE constraint is not trivial"),
        };
        assert_eq!(num.max_var, 4);
        let text = dimacs_string(&c, &num, &opts);
        assert!(text.contains("p cnf 4 5"), "{}", text);
    }

    #[test]
    fn polarity_or_emits_only_the_forward_implication() {
        let build = |polarity: bool| {
            let mut c = Circuit::new();
            let a = c.install(GateType::Var, vec![]);
            let b = c.install(GateType::Var, vec![]);
            let r = c.install(GateType::Or, vec![a, b]);
            named(&mut c, r, "r");
            c.assigned_to_true.push_back(r);
            c.apply_assignments().unwrap();
            let opts = TranslateOpts {
                polarity,
                ..TranslateOpts::default()
            };
            let num = match prepare(&mut c, &opts).unwrap() {
                Prepared::Cnf(n) => n,
                Prepared::TriviallySat => panic!("OR constraint is not trivial"),
            };
            collect_clauses(&c, &num, &opts).len()
        };
        // Standard: implication + two reverse clauses + unit.
        assert_eq!(build(false), 4);
        // Polarity: implication + unit.
        assert_eq!(build(true), 2);
    }

    #[test]
    fn notless_numbering_skips_not_gates() {
        let mut c = Circuit::new();
        let x = c.install(GateType::Var, vec![]);
        let y = c.install(GateType::Var, vec![]);
        let n = c.install(GateType::Not, vec![y]);
        let r = c.install(GateType::Or, vec![x, n]);
        named(&mut c, r, "r");
        named(&mut c, n, "ny");
        c.assigned_to_true.push_back(r);
        c.apply_assignments().unwrap();
        let opts = TranslateOpts::default();
        let num = match prepare(&mut c, &opts).unwrap() {
            Prepared::Cnf(num) => num,
            Prepared::TriviallySat => panic!("OR constraint is not trivial"),
        };
        assert_eq!(num.var_of(n), 0, "NOT gate was assigned a variable");
        assert_eq!(num.max_var, 3);
        // The NOT's name maps to the negated child literal.
        let text = dimacs_string(&c, &num, &opts);
        let y_var = num.var_of(y);
        assert!(text.contains(&format!("c ny <-> {}", -y_var)), "{}", text);
    }

    #[test]
    fn trivial_writers_emit_the_canned_formulas() {
        let mut c = Circuit::new();
        let x = c.install(GateType::Var, vec![]);
        named(&mut c, x, "x");
        c.force_true(x).unwrap();
        c.evaluate_all();
        let mut buf = Vec::new();
        write_trivial_sat(&c, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("c x <-> T"));
        assert!(text.ends_with("p cnf 1 1\n1 0\n"));

        let mut buf = Vec::new();
        write_trivial_unsat(&mut buf).unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "c The instance was unsatisfiable\np cnf 1 2\n1 0\n-1 0\n"
        );
    }

    #[test]
    fn permutations_are_permutations() {
        fn prop(n_raw: u8, seed: u32) -> bool {
            let n = n_raw as usize;
            let perm = permutation(n, seed);
            let mut seen = vec![false; n + 1];
            for &v in &perm[1..] {
                if v < 1 || v as usize > n || seen[v as usize] {
                    return false;
                }
                seen[v as usize] = true;
            }
            true
        }
        quickcheck(prop as fn(u8, u32) -> bool);
    }

    #[test]
    fn permutation_is_deterministic() {
        assert_eq!(permutation(100, 7), permutation(100, 7));
        assert_ne!(permutation(100, 7), permutation(100, 8));
    }
}
