//! Parser for the textual circuit format.
//!
//! A circuit file is a sequence of `;`-terminated statements: `name := expr`
//! gate definitions and `ASSIGN name, ~name, ...` constraints. Expressions
//! are built from `T`, `F`, gate names, `~`, the operators
//! `OR/AND/NOT/EQUIV/ODD/EVEN/ITE`, cardinality gates `[l,u](...)` and
//! `(>= l)(...)`. A name that is referenced but never defined denotes an
//! input gate. `//` starts a comment and an optional `BC...` header line is
//! accepted and ignored.

use indexmap::IndexMap;
use rustc_hash::FxHashSet;
use thiserror::Error;
use tracing::debug;

use crate::circuit::{Circuit, GateType, Handle};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("line {line}: {msg}")]
    Syntax { line: usize, msg: String },
    #[error("the circuit contains a cycle through {}", names_or_unnamed(.0))]
    Cyclic(Vec<String>),
}

fn names_or_unnamed(names: &[String]) -> String {
    if names.is_empty() {
        "unnamed gates".to_string()
    } else {
        names.join(", ")
    }
}

type Result<T> = std::result::Result<T, ParseError>;

#[derive(Clone, Debug, PartialEq)]
enum Tok {
    Ident(String),
    Num(usize),
    Define,
    Comma,
    Semi,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Tilde,
    Ge,
}

impl std::fmt::Display for Tok {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tok::Ident(s) => write!(f, "`{}`", s),
            Tok::Num(n) => write!(f, "`{}`", n),
            Tok::Define => write!(f, "`:=`"),
            Tok::Comma => write!(f, "`,`"),
            Tok::Semi => write!(f, "`;`"),
            Tok::LParen => write!(f, "`(`"),
            Tok::RParen => write!(f, "`)`"),
            Tok::LBracket => write!(f, "`[`"),
            Tok::RBracket => write!(f, "`]`"),
            Tok::Tilde => write!(f, "`~`"),
            Tok::Ge => write!(f, "`>=`"),
        }
    }
}

fn is_name_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

fn is_name_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '\'')
}

fn lex(text: &str) -> Result<Vec<(Tok, usize)>> {
    let mut toks = Vec::new();
    let mut line = 1usize;
    let mut chars = text.chars().peekable();
    while let Some(&ch) = chars.peek() {
        match ch {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '/' => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    for c in chars.by_ref() {
                        if c == '\n' {
                            line += 1;
                            break;
                        }
                    }
                } else {
                    return Err(ParseError::Syntax {
                        line,
                        msg: "stray `/` (comments start with `//`)".to_string(),
                    });
                }
            }
            ':' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(ParseError::Syntax {
                        line,
                        msg: "expected `:=`".to_string(),
                    });
                }
                toks.push((Tok::Define, line));
            }
            '>' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(ParseError::Syntax {
                        line,
                        msg: "expected `>=`".to_string(),
                    });
                }
                toks.push((Tok::Ge, line));
            }
            ',' => {
                chars.next();
                toks.push((Tok::Comma, line));
            }
            ';' => {
                chars.next();
                toks.push((Tok::Semi, line));
            }
            '(' => {
                chars.next();
                toks.push((Tok::LParen, line));
            }
            ')' => {
                chars.next();
                toks.push((Tok::RParen, line));
            }
            '[' => {
                chars.next();
                toks.push((Tok::LBracket, line));
            }
            ']' => {
                chars.next();
                toks.push((Tok::RBracket, line));
            }
            '~' => {
                chars.next();
                toks.push((Tok::Tilde, line));
            }
            '"' => {
                chars.next();
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\n') | None => {
                            return Err(ParseError::Syntax {
                                line,
                                msg: "unterminated quoted name".to_string(),
                            })
                        }
                        Some(c) => name.push(c),
                    }
                }
                toks.push((Tok::Ident(name), line));
            }
            c if c.is_ascii_digit() => {
                let mut n = 0usize;
                while let Some(&d) = chars.peek() {
                    if let Some(digit) = d.to_digit(10) {
                        n = n
                            .checked_mul(10)
                            .and_then(|n| n.checked_add(digit as usize))
                            .ok_or_else(|| ParseError::Syntax {
                                line,
                                msg: "number out of range".to_string(),
                            })?;
                        chars.next();
                    } else {
                        break;
                    }
                }
                toks.push((Tok::Num(n), line));
            }
            c if is_name_start(c) => {
                let mut name = String::new();
                while let Some(&d) = chars.peek() {
                    if is_name_char(d) {
                        name.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                toks.push((Tok::Ident(name), line));
            }
            c => {
                return Err(ParseError::Syntax {
                    line,
                    msg: format!("unexpected character `{}`", c),
                })
            }
        }
    }
    Ok(toks)
}

struct Parser {
    toks: Vec<(Tok, usize)>,
    pos: usize,
    circuit: Circuit,
    names: IndexMap<String, usize>,
    defined: FxHashSet<String>,
    true_gate: Option<usize>,
    false_gate: Option<usize>,
}

impl Parser {
    fn line(&self) -> usize {
        self.toks
            .get(self.pos)
            .or_else(|| self.toks.last())
            .map_or(1, |&(_, l)| l)
    }

    fn err<T>(&self, msg: impl Into<String>) -> Result<T> {
        Err(ParseError::Syntax {
            line: self.line(),
            msg: msg.into(),
        })
    }

    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos).map(|(t, _)| t)
    }

    fn peek2(&self) -> Option<&Tok> {
        self.toks.get(self.pos + 1).map(|(t, _)| t)
    }

    fn next(&mut self) -> Result<Tok> {
        match self.toks.get(self.pos) {
            Some((t, _)) => {
                self.pos += 1;
                Ok(t.clone())
            }
            None => self.err("unexpected end of input"),
        }
    }

    fn expect(&mut self, want: Tok) -> Result<()> {
        let got = self.next()?;
        if got != want {
            self.pos -= 1;
            return self.err(format!("expected {}, found {}", want, got));
        }
        Ok(())
    }

    fn expect_num(&mut self) -> Result<usize> {
        match self.next()? {
            Tok::Num(n) => Ok(n),
            got => {
                self.pos -= 1;
                self.err(format!("expected a number, found {}", got))
            }
        }
    }

    /// Gate of a referenced name, creating a placeholder for names not seen
    /// before. Placeholders left undefined at end of file become inputs.
    fn lookup(&mut self, name: &str) -> usize {
        if let Some(&g) = self.names.get(name) {
            return g;
        }
        let g = self.circuit.install(GateType::Undef, vec![]);
        self.circuit
            .gate_mut(g)
            .handles
            .push(Handle::Name(name.to_string()));
        self.names.insert(name.to_string(), g);
        g
    }

    fn constant(&mut self, v: bool) -> usize {
        let slot = if v {
            &mut self.true_gate
        } else {
            &mut self.false_gate
        };
        if let Some(g) = *slot {
            return g;
        }
        let typ = if v { GateType::True } else { GateType::False };
        let g = self.circuit.install(typ, vec![]);
        *slot = Some(g);
        g
    }

    fn args(&mut self) -> Result<Vec<usize>> {
        self.expect(Tok::LParen)?;
        let mut out = vec![self.expr()?];
        loop {
            match self.next()? {
                Tok::Comma => out.push(self.expr()?),
                Tok::RParen => break,
                got => {
                    self.pos -= 1;
                    return self.err(format!("expected `,` or `)`, found {}", got));
                }
            }
        }
        Ok(out)
    }

    fn operator(&mut self, name: &str) -> Result<usize> {
        let args = self.args()?;
        let typ = match name {
            "OR" => GateType::Or,
            "AND" => GateType::And,
            "NOT" => GateType::Not,
            "EQUIV" => GateType::Equiv,
            "ODD" => GateType::Odd,
            "EVEN" => GateType::Even,
            "ITE" => GateType::Ite,
            _ => unreachable!("non-operator name {}", name),
        };
        match typ {
            GateType::Not if args.len() != 1 => {
                return self.err(format!("NOT takes 1 argument, got {}", args.len()))
            }
            GateType::Ite if args.len() != 3 => {
                return self.err(format!("ITE takes 3 arguments, got {}", args.len()))
            }
            _ => {}
        }
        Ok(self.circuit.install(typ, args))
    }

    fn expr(&mut self) -> Result<usize> {
        match self.next()? {
            Tok::Tilde => {
                let e = self.expr()?;
                Ok(self.circuit.install(GateType::Not, vec![e]))
            }
            Tok::LParen => {
                if self.peek() == Some(&Tok::Ge) {
                    // (>= l)(...)
                    self.next()?;
                    let l = self.expect_num()?;
                    self.expect(Tok::RParen)?;
                    let args = self.args()?;
                    Ok(self.circuit.install_atleast(l, args))
                } else {
                    let e = self.expr()?;
                    self.expect(Tok::RParen)?;
                    Ok(e)
                }
            }
            Tok::LBracket => {
                let l = self.expect_num()?;
                self.expect(Tok::Comma)?;
                let u = self.expect_num()?;
                self.expect(Tok::RBracket)?;
                let args = self.args()?;
                Ok(self.circuit.install_threshold(l, u, args))
            }
            Tok::Ident(name) => match name.as_str() {
                "T" => Ok(self.constant(true)),
                "F" => Ok(self.constant(false)),
                "OR" | "AND" | "NOT" | "EQUIV" | "ODD" | "EVEN" | "ITE"
                    if self.peek() == Some(&Tok::LParen) =>
                {
                    self.operator(&name)
                }
                _ => Ok(self.lookup(&name)),
            },
            got => {
                self.pos -= 1;
                self.err(format!("expected an expression, found {}", got))
            }
        }
    }

    fn define(&mut self, name: String) -> Result<()> {
        self.expect(Tok::Define)?;
        let root = self.expr()?;
        if self.defined.contains(&name) {
            return self.err(format!("gate `{}` is defined twice", name));
        }
        match self.names.get(&name) {
            Some(&placeholder) => {
                // The name was referenced before its definition; patch the
                // placeholder to an alias of the defined gate.
                debug_assert_eq!(self.circuit.gate(placeholder).typ, GateType::Undef);
                self.circuit.gate_mut(placeholder).typ = GateType::Ref;
                self.circuit.add_child(placeholder, root);
            }
            None => {
                self.circuit
                    .gate_mut(root)
                    .handles
                    .push(Handle::Name(name.clone()));
                self.names.insert(name.clone(), root);
            }
        }
        self.defined.insert(name);
        Ok(())
    }

    fn assign(&mut self) -> Result<()> {
        loop {
            let negated = if self.peek() == Some(&Tok::Tilde) {
                self.next()?;
                true
            } else {
                false
            };
            let name = match self.next()? {
                Tok::Ident(n) => n,
                got => {
                    self.pos -= 1;
                    return self.err(format!("expected a gate name, found {}", got));
                }
            };
            let g = self.lookup(&name);
            if negated {
                self.circuit.assigned_to_false.push_back(g);
            } else {
                self.circuit.assigned_to_true.push_back(g);
            }
            match self.next()? {
                Tok::Comma => continue,
                Tok::Semi => return Ok(()),
                got => {
                    self.pos -= 1;
                    return self.err(format!("expected `,` or `;`, found {}", got));
                }
            }
        }
    }

    fn statement(&mut self) -> Result<()> {
        let is_assign = matches!(self.peek(), Some(Tok::Ident(n)) if n == "ASSIGN")
            && self.peek2() != Some(&Tok::Define);
        if is_assign {
            self.next()?;
            return self.assign();
        }
        match self.next()? {
            Tok::Ident(name) => {
                self.define(name)?;
                self.expect(Tok::Semi)
            }
            got => {
                self.pos -= 1;
                self.err(format!("expected a statement, found {}", got))
            }
        }
    }
}

/// Parse a circuit file into a [`Circuit`] with its two constraint queues.
pub fn parse_circuit(text: &str) -> Result<Circuit> {
    let mut toks = lex(text)?;
    // Optional format header such as `BC1.0`.
    if let Some((Tok::Ident(first), _)) = toks.first() {
        if first.starts_with("BC") && toks.get(1).map(|(t, _)| t) != Some(&Tok::Define) {
            toks.remove(0);
        }
    }
    let mut p = Parser {
        toks,
        pos: 0,
        circuit: Circuit::new(),
        names: IndexMap::new(),
        defined: FxHashSet::default(),
        true_gate: None,
        false_gate: None,
    };
    while p.peek().is_some() {
        p.statement()?;
    }
    // Names that were only referenced are the input gates.
    for g in 0..p.circuit.len() {
        if p.circuit.gate(g).typ == GateType::Undef {
            p.circuit.gate_mut(g).typ = GateType::Var;
        }
    }
    p.circuit.check_acyclic().map_err(ParseError::Cyclic)?;
    debug!(
        gates = p.circuit.len(),
        names = p.names.len(),
        "circuit parsed"
    );
    Ok(p.circuit)
}
