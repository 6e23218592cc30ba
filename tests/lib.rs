//! End-to-end tests: circuit text in, DIMACS out.

use bc2cnf::circuit::{Circuit, GateType};
use bc2cnf::cnf::{self, Prepared, TranslateOpts};
use bc2cnf::parse::parse_circuit;

/// Run the full translation pipeline on a circuit file and return the
/// DIMACS output.
fn translate(text: &str, opts: &TranslateOpts) -> String {
    let mut circuit = parse_circuit(text).expect("parse failure");
    let mut out = Vec::new();
    if circuit.apply_assignments().is_err() {
        cnf::write_trivial_unsat(&mut out).unwrap();
        return String::from_utf8(out).unwrap();
    }
    circuit.remove_underscore_names();
    match cnf::prepare(&mut circuit, opts) {
        Err(_) => cnf::write_trivial_unsat(&mut out).unwrap(),
        Ok(Prepared::TriviallySat) => cnf::write_trivial_sat(&circuit, &mut out).unwrap(),
        Ok(Prepared::Cnf(num)) => cnf::write_dimacs(&circuit, &num, opts, &mut out).unwrap(),
    }
    String::from_utf8(out).unwrap()
}

/// A parsed DIMACS file: variable count, clauses, and the name map from the
/// comment block.
struct Dimacs {
    nvars: usize,
    clauses: Vec<Vec<i32>>,
    names: Vec<(String, i32)>,
}

fn parse_dimacs(text: &str) -> Dimacs {
    let mut nvars = 0;
    let mut nclauses = 0;
    let mut clauses = Vec::new();
    let mut names = Vec::new();
    let mut seen_header = false;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("c ") {
            let words: Vec<&str> = rest.split_whitespace().collect();
            if words.len() == 3 && words[1] == "<->" {
                if let Ok(lit) = words[2].parse::<i32>() {
                    names.push((words[0].to_string(), lit));
                }
            }
            continue;
        }
        if line.starts_with('c') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("p cnf ") {
            let mut it = rest.split_whitespace();
            nvars = it.next().unwrap().parse().unwrap();
            nclauses = it.next().unwrap().parse().unwrap();
            seen_header = true;
            continue;
        }
        assert!(seen_header, "clause before the p cnf header");
        let lits: Vec<i32> = line
            .split_whitespace()
            .map(|w| w.parse::<i32>().unwrap())
            .take_while(|&l| l != 0)
            .collect();
        for &l in &lits {
            assert!(l.unsigned_abs() as usize <= nvars, "literal out of range");
        }
        clauses.push(lits);
    }
    assert_eq!(clauses.len(), nclauses, "clause count in header is not exact");
    Dimacs {
        nvars,
        clauses,
        names,
    }
}

impl Dimacs {
    /// All satisfying assignments, found by exhaustive enumeration. Only
    /// usable for small variable counts.
    fn models(&self) -> Vec<Vec<bool>> {
        assert!(self.nvars <= 16, "formula too large to enumerate");
        let mut found = Vec::new();
        for mask in 0u32..1 << self.nvars {
            let mut model = vec![false; self.nvars + 1];
            for v in 1..=self.nvars {
                model[v] = mask >> (v - 1) & 1 == 1;
            }
            if cnf::eval_formula(&self.clauses, &model) {
                found.push(model);
            }
        }
        found
    }

    fn satisfiable(&self) -> bool {
        !self.models().is_empty()
    }

    fn lit_of(&self, name: &str) -> i32 {
        self.names
            .iter()
            .find(|(n, _)| n == name)
            .unwrap_or_else(|| panic!("no mapping for {}", name))
            .1
    }
}

/// Brute-force satisfiability of the circuit itself, by trying every input
/// assignment and checking that every constrained gate is consistent.
fn circuit_satisfiable(text: &str) -> bool {
    let mut base = parse_circuit(text).expect("parse failure");
    if base.apply_assignments().is_err() {
        return false;
    }
    let inputs: Vec<usize> = (0..base.len())
        .filter(|&g| base.gate(g).typ == GateType::Var && !base.gate(g).determined)
        .collect();
    assert!(inputs.len() <= 16, "circuit too large to enumerate");
    for mask in 0u32..1 << inputs.len() {
        let mut c: Circuit = base.clone();
        for (bit, &v) in inputs.iter().enumerate() {
            if mask >> bit & 1 == 1 {
                c.force_true(v).unwrap();
            } else {
                c.force_false(v).unwrap();
            }
        }
        c.evaluate_all();
        if c.check_consistency() {
            return true;
        }
    }
    false
}

#[test]
fn trivially_satisfiable_circuit_yields_the_canned_formula() {
    let out = translate("g1 := x;\nASSIGN g1;\n", &TranslateOpts::default());
    assert!(out.contains("c x <-> T"), "{}", out);
    assert!(out.contains("c g1 <-> T"), "{}", out);
    assert!(out.ends_with("p cnf 1 1\n1 0\n"), "{}", out);
}

#[test]
fn contradictory_assignments_yield_the_canned_unsat_formula() {
    let out = translate("g := x;\nASSIGN g;\nASSIGN ~g;\n", &TranslateOpts::default());
    assert!(out.ends_with("p cnf 1 2\n1 0\n-1 0\n"), "{}", out);
}

#[test]
fn binary_equiv_translates_to_five_clauses() {
    let opts = TranslateOpts {
        preserve_all: true,
        ..TranslateOpts::default()
    };
    let out = translate("r := EQUIV(x, y);\nASSIGN r;\n", &opts);
    let dimacs = parse_dimacs(&out);
    assert_eq!(dimacs.nvars, 3);
    assert_eq!(dimacs.clauses.len(), 5);
    // x = y in every model.
    let (x, y) = (dimacs.lit_of("x"), dimacs.lit_of("y"));
    for m in dimacs.models() {
        assert_eq!(m[x.unsigned_abs() as usize], m[y.unsigned_abs() as usize]);
    }
}

#[test]
fn ite_translates_to_four_clauses_plus_unit() {
    let out = translate(
        "r := ITE(a, b, c);\nASSIGN r;\n",
        &TranslateOpts::default(),
    );
    let dimacs = parse_dimacs(&out);
    assert_eq!(dimacs.nvars, 4);
    assert_eq!(dimacs.clauses.len(), 5);
}

#[test]
fn exactly_two_of_three_cardinality() {
    let out = translate(
        "r := [2,2](a, b, c);\nASSIGN r;\n",
        &TranslateOpts::default(),
    );
    let dimacs = parse_dimacs(&out);
    let projected: std::collections::BTreeSet<(bool, bool, bool)> = dimacs
        .models()
        .iter()
        .map(|m| {
            let v = |name: &str| {
                let lit = dimacs.lit_of(name);
                m[lit.unsigned_abs() as usize] == (lit > 0)
            };
            (v("a"), v("b"), v("c"))
        })
        .collect();
    let expected: std::collections::BTreeSet<(bool, bool, bool)> = [
        (false, true, true),
        (true, false, true),
        (true, true, false),
    ]
    .into_iter()
    .collect();
    assert_eq!(projected, expected);
}

#[test]
fn polarity_or_drops_the_reverse_clauses() {
    let text = "r := OR(a, b);\nASSIGN r;\n";
    let standard = parse_dimacs(&translate(text, &TranslateOpts::default()));
    // Forward implication, two reverse clauses, one unit.
    assert_eq!(standard.clauses.len(), 4);
    let polarity = parse_dimacs(&translate(
        text,
        &TranslateOpts {
            polarity: true,
            ..TranslateOpts::default()
        },
    ));
    // Forward implication and the unit only.
    assert_eq!(polarity.clauses.len(), 2);
    assert!(polarity.satisfiable());
}

#[test]
fn permuted_output_is_a_renaming() {
    let text = "r := AND(OR(a, b), OR(~a, c), ODD(b, c));\nASSIGN r;\n";
    let plain = parse_dimacs(&translate(text, &TranslateOpts::default()));
    let permuted = parse_dimacs(&translate(
        text,
        &TranslateOpts {
            permute_seed: Some(0xDEAD),
            ..TranslateOpts::default()
        },
    ));
    assert_eq!(plain.nvars, permuted.nvars);
    assert_eq!(plain.clauses.len(), permuted.clauses.len());
    // The permutation preserves the projected models of the named inputs.
    let project = |d: &Dimacs| -> std::collections::BTreeSet<Vec<bool>> {
        d.models()
            .iter()
            .map(|m| {
                ["a", "b", "c"]
                    .iter()
                    .map(|n| {
                        let lit = d.lit_of(n);
                        m[lit.unsigned_abs() as usize] == (lit > 0)
                    })
                    .collect()
            })
            .collect()
    };
    assert_eq!(project(&plain), project(&permuted));
}

#[test]
fn notful_mode_numbers_not_gates() {
    let text = "r := OR(a, ~b);\nASSIGN r;\n";
    let notless = parse_dimacs(&translate(text, &TranslateOpts::default()));
    let notful = parse_dimacs(&translate(
        text,
        &TranslateOpts {
            notless: false,
            ..TranslateOpts::default()
        },
    ));
    // The NOT gate gets its own variable and two defining clauses.
    assert_eq!(notful.nvars, notless.nvars + 1);
    assert!(notful.satisfiable() && notless.satisfiable());
}

#[test]
fn preserve_all_keeps_the_model_count_over_inputs() {
    // ODD(x,y) = T allows two models over (x,y); input rewriting would
    // collapse x to ~y and leave a single free variable.
    let text = "r := ODD(x, y);\nASSIGN r;\n";
    let opts = TranslateOpts {
        preserve_all: true,
        ..TranslateOpts::default()
    };
    let dimacs = parse_dimacs(&translate(text, &opts));
    let models = dimacs.models();
    assert_eq!(models.len(), 2);
}

#[test]
fn underscore_names_stay_out_of_the_comments() {
    let text = "_tmp := OR(a, b);\nr := AND(_tmp, c);\nASSIGN r;\n";
    let out = translate(text, &TranslateOpts::default());
    assert!(!out.contains("_tmp"), "{}", out);
    assert!(out.contains("c a <-> "), "{}", out);
}

#[test]
fn translation_preserves_satisfiability() {
    let circuits = [
        "r := ITE(a, ODD(b, c), EVEN(b, c));\nASSIGN r;\n",
        "r := EQUIV(a, b, c);\nASSIGN r;\n",
        "r := [1,2](a, b, c, d);\nASSIGN r;\n",
        "r := (>= 2)(a, b, c);\nASSIGN r, ~a;\n",
        "r := AND(OR(a, b), OR(~a, ~b), EQUIV(a, b));\nASSIGN r;\n",
        "sum := ODD(a, b, cin);\ncarry := (>= 2)(a, b, cin);\nASSIGN sum, ~carry;\n",
        "r := AND(a, NOT(a));\nASSIGN r;\n",
        "r := [3,3](a, a, b);\nASSIGN r;\n",
        "top := OR(sub, d);\nsub := AND(a, b, c);\nASSIGN top, ~sub;\n",
    ];
    for text in circuits {
        let expected = circuit_satisfiable(text);
        for simplify in [false, true] {
            for notless in [false, true] {
                for polarity in [false, true] {
                    for preserve_all in [false, true] {
                        let opts = TranslateOpts {
                            simplify,
                            notless,
                            polarity,
                            preserve_all,
                            ..TranslateOpts::default()
                        };
                        let out = translate(text, &opts);
                        let got = parse_dimacs(&out).satisfiable();
                        assert_eq!(
                            got, expected,
                            "satisfiability mismatch for {:?} with {:?}",
                            text, opts
                        );
                    }
                }
            }
        }
    }
}

#[test]
fn nocoi_includes_unconstrained_gates() {
    let text = "r := OR(a, b);\nunused := AND(a, c);\nASSIGN r;\n";
    let coi = parse_dimacs(&translate(text, &TranslateOpts::default()));
    let nocoi = parse_dimacs(&translate(
        text,
        &TranslateOpts {
            coi: false,
            ..TranslateOpts::default()
        },
    ));
    assert!(nocoi.nvars > coi.nvars);
    assert_eq!(coi.satisfiable(), nocoi.satisfiable());
}
