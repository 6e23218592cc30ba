//! Embedded SAT solving of a translated circuit through `batsat`.

use batsat::callbacks;
use batsat::clause;
use batsat::core::SolverOpts;
use batsat::interface::SolverInterface;
use batsat::lbool;
use batsat::BasicSolver;
use tracing::info;

use crate::circuit::{Circuit, GateType};
use crate::cnf::{self, Prepared, TranslateOpts};

/// Result of solving a circuit: on satisfiability, the truth value of every
/// named gate, in installation order.
pub enum SolveResult {
    Unsat,
    Sat(Vec<(String, bool)>),
}

/// Translate the circuit to clauses and run the embedded solver. The
/// constraint queues must already have been applied.
pub fn solve(c: &mut Circuit, opts: &TranslateOpts) -> SolveResult {
    let num = match cnf::prepare(c, opts) {
        Err(_) => return SolveResult::Unsat,
        Ok(Prepared::TriviallySat) => {
            info!("circuit decided during translation");
            return SolveResult::Sat(named_assignment(c));
        }
        Ok(Prepared::Cnf(num)) => num,
    };

    let clauses = cnf::collect_clauses(c, &num, opts);
    let counted: usize = (0..c.len())
        .filter(|&g| num.is_relevant(g))
        .map(|g| cnf::gate_clause_count(c, g, opts) + c.gate(g).determined as usize)
        .sum();
    assert_eq!(
        clauses.len(),
        counted,
        "clause count differs between the counting and collecting passes"
    );
    info!(vars = num.max_var, clauses = clauses.len(), "solving");

    let mut solver = BasicSolver::new(SolverOpts::default(), callbacks::Basic::new());
    let vars: Vec<clause::Var> = (0..num.max_var).map(|_| solver.new_var_default()).collect();
    let mut lits: Vec<clause::Lit> = vec![];
    for clause in &clauses {
        lits.clear();
        for &l in clause {
            let v = vars[(l.unsigned_abs() - 1) as usize];
            lits.push(clause::Lit::new(v, l > 0));
        }
        solver.add_clause_reuse(&mut lits);
    }

    let ret = solver.solve_limited(&[]);
    if ret != lbool::TRUE {
        debug_assert_eq!(ret, lbool::FALSE);
        return SolveResult::Unsat;
    }

    // Pin the relevant input gates to their model values, default the rest
    // to false and evaluate the remaining gates bottom-up; the polarity
    // encoding does not fix internal gate variables in both directions, so
    // only the inputs are read back from the solver.
    let model = solver.get_model().to_vec();
    for g in 0..c.len() {
        let gate = c.gate(g);
        if gate.typ != GateType::Var || gate.determined {
            continue;
        }
        let dimacs_var = num.var_of(g);
        if dimacs_var > 0 {
            let v = vars[(dimacs_var - 1) as usize];
            let value = model[v.idx() as usize] == lbool::TRUE;
            let gate = c.gate_mut(g);
            gate.determined = true;
            gate.value = value;
        }
    }
    c.evaluate_all();
    assert!(
        c.check_consistency(),
        "solver model is inconsistent with the circuit"
    );
    SolveResult::Sat(named_assignment(c))
}

fn named_assignment(c: &Circuit) -> Vec<(String, bool)> {
    let mut out = Vec::new();
    for g in 0..c.len() {
        if c.gate(g).is_deleted() {
            continue;
        }
        debug_assert!(c.gate(g).determined);
        for h in &c.gate(g).handles {
            out.push((h.name().to_string(), c.gate(g).value));
        }
    }
    out
}
