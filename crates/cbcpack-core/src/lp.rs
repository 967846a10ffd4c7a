//! Sample linear program and CBC solution file parsing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::error::SolutionParseError;

/// Optimal objective of [`LpProblem::sample`].
pub const SAMPLE_OPTIMUM: f64 = 4.0;

/// Absolute tolerance when comparing objective values and constraints.
pub const TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Sense {
    Minimize,
    Maximize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Relation {
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "=")]
    Eq,
}

impl Relation {
    fn symbol(&self) -> &'static str {
        match self {
            Relation::Le => "<=",
            Relation::Ge => ">=",
            Relation::Eq => "=",
        }
    }
}

/// `coef * var`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Term {
    pub coef: f64,
    pub var: String,
}

impl Term {
    pub fn new(coef: f64, var: &str) -> Self {
        Self {
            coef,
            var: var.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Constraint {
    pub name: String,
    pub terms: Vec<Term>,
    pub relation: Relation,
    pub rhs: f64,
}

/// Variable bounds; `upper = None` is unbounded above.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bound {
    pub var: String,
    pub lower: f64,
    pub upper: Option<f64>,
}

/// A small linear program.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LpProblem {
    pub name: String,
    pub sense: Sense,
    pub objective: Vec<Term>,
    pub constraints: Vec<Constraint>,
    pub bounds: Vec<Bound>,
}

impl LpProblem {
    /// maximize x + y subject to x + y <= 4, x <= 2, y <= 3, x, y >= 0
    pub fn sample() -> Self {
        Self {
            name: "cbcpack_sample".to_string(),
            sense: Sense::Maximize,
            objective: vec![Term::new(1.0, "x"), Term::new(1.0, "y")],
            constraints: vec![
                Constraint {
                    name: "total".to_string(),
                    terms: vec![Term::new(1.0, "x"), Term::new(1.0, "y")],
                    relation: Relation::Le,
                    rhs: 4.0,
                },
                Constraint {
                    name: "cap_x".to_string(),
                    terms: vec![Term::new(1.0, "x")],
                    relation: Relation::Le,
                    rhs: 2.0,
                },
                Constraint {
                    name: "cap_y".to_string(),
                    terms: vec![Term::new(1.0, "y")],
                    relation: Relation::Le,
                    rhs: 3.0,
                },
            ],
            bounds: vec![
                Bound {
                    var: "x".to_string(),
                    lower: 0.0,
                    upper: None,
                },
                Bound {
                    var: "y".to_string(),
                    lower: 0.0,
                    upper: None,
                },
            ],
        }
    }

    /// Render in CPLEX LP format, as read by `cbc <file>.lp`.
    pub fn to_lp_string(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "\\ {}", self.name);
        out.push_str(match self.sense {
            Sense::Minimize => "Minimize\n",
            Sense::Maximize => "Maximize\n",
        });
        let _ = writeln!(out, " obj: {}", format_terms(&self.objective));
        out.push_str("Subject To\n");
        for c in &self.constraints {
            let _ = writeln!(
                out,
                " {}: {} {} {}",
                c.name,
                format_terms(&c.terms),
                c.relation.symbol(),
                format_number(c.rhs)
            );
        }
        out.push_str("Bounds\n");
        for b in &self.bounds {
            match b.upper {
                Some(upper) => {
                    let _ = writeln!(
                        out,
                        " {} <= {} <= {}",
                        format_number(b.lower),
                        b.var,
                        format_number(upper)
                    );
                }
                None => {
                    let _ = writeln!(out, " {} >= {}", b.var, format_number(b.lower));
                }
            }
        }
        out.push_str("End\n");
        out
    }

    /// Objective value of an assignment. Missing variables count as 0.
    pub fn evaluate(&self, values: &BTreeMap<String, f64>) -> f64 {
        dot(&self.objective, values)
    }

    /// Whether an assignment satisfies every constraint and bound.
    pub fn is_feasible(&self, values: &BTreeMap<String, f64>) -> bool {
        let constraints_ok = self.constraints.iter().all(|c| {
            let lhs = dot(&c.terms, values);
            match c.relation {
                Relation::Le => lhs <= c.rhs + TOLERANCE,
                Relation::Ge => lhs >= c.rhs - TOLERANCE,
                Relation::Eq => (lhs - c.rhs).abs() <= TOLERANCE,
            }
        });
        let bounds_ok = self.bounds.iter().all(|b| {
            let v = values.get(&b.var).copied().unwrap_or(0.0);
            v >= b.lower - TOLERANCE && b.upper.map_or(true, |u| v <= u + TOLERANCE)
        });
        constraints_ok && bounds_ok
    }
}

fn dot(terms: &[Term], values: &BTreeMap<String, f64>) -> f64 {
    terms
        .iter()
        .map(|t| t.coef * values.get(&t.var).copied().unwrap_or(0.0))
        .sum()
}

fn format_terms(terms: &[Term]) -> String {
    let mut out = String::new();
    for (i, term) in terms.iter().enumerate() {
        let magnitude = term.coef.abs();
        let sign = if term.coef < 0.0 { "-" } else { "+" };
        if i == 0 {
            if term.coef < 0.0 {
                out.push_str("- ");
            }
        } else {
            let _ = write!(out, " {sign} ");
        }
        if (magnitude - 1.0).abs() > f64::EPSILON {
            let _ = write!(out, "{} ", format_number(magnitude));
        }
        out.push_str(&term.var);
    }
    out
}

fn format_number(value: f64) -> String {
    format!("{value}")
}

/// Solver status from the solution header.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SolutionStatus {
    Optimal,
    Infeasible,
    Unbounded,
    Stopped,
    Other(String),
}

impl SolutionStatus {
    fn parse(text: &str) -> Self {
        let lower = text.trim().to_lowercase();
        if lower.starts_with("optimal") {
            SolutionStatus::Optimal
        } else if lower.contains("infeasible") {
            SolutionStatus::Infeasible
        } else if lower.contains("unbounded") {
            SolutionStatus::Unbounded
        } else if lower.starts_with("stopped") {
            SolutionStatus::Stopped
        } else {
            SolutionStatus::Other(text.trim().to_string())
        }
    }
}

/// Parsed CBC solution file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Solution {
    pub status: SolutionStatus,

    /// Objective as printed in the header.
    pub reported_objective: f64,

    pub values: BTreeMap<String, f64>,
}

const OBJECTIVE_MARKER: &str = "objective value";

/// Parse a CBC solution file written by `solu <file>`.
///
/// ```text
/// Optimal - objective value 4.00000000
///       0 x                      2                       0
///       1 y                      2                       0
/// ```
///
/// Rows may be prefixed with `**` when a value violates its bounds.
pub fn parse_solution(text: &str) -> Result<Solution, SolutionParseError> {
    let mut lines = text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());

    let (_, header) = lines.next().ok_or(SolutionParseError::Empty)?;
    let marker = header
        .find(OBJECTIVE_MARKER)
        .ok_or_else(|| SolutionParseError::MissingHeader(header.to_string()))?;
    let status_text = header[..marker].trim().trim_end_matches('-').trim();
    let objective_text = header[marker + OBJECTIVE_MARKER.len()..].trim();
    let reported_objective = objective_text
        .split_whitespace()
        .next()
        .and_then(|v| v.parse::<f64>().ok())
        .ok_or_else(|| SolutionParseError::InvalidObjective(objective_text.to_string()))?;

    let mut values = BTreeMap::new();
    for (index, line) in lines {
        let mut tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.first() == Some(&"**") {
            tokens.remove(0);
        }
        let malformed = || SolutionParseError::MalformedRow {
            line: index + 1,
            content: line.to_string(),
        };
        if tokens.len() < 3 || tokens[0].parse::<usize>().is_err() {
            return Err(malformed());
        }
        let value = tokens[2].parse::<f64>().map_err(|_| malformed())?;
        values.insert(tokens[1].to_string(), value);
    }

    Ok(Solution {
        status: SolutionStatus::parse(status_text),
        reported_objective,
        values,
    })
}
