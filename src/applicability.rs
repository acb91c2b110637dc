//! Applicability expressions: which run numbers a version is valid for.
//!
//! An expression is one or more comma-separated clauses, each an optional
//! comparator followed by a run-number literal. All clauses must hold.
//!
//! ```
//! use calib_store::AppliesTo;
//!
//! let expr: AppliesTo = ">=100, <200".parse().unwrap();
//! assert!(expr.applies_to_run(150));
//! assert!(!expr.applies_to_run(200));
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::IndexError;

/// Comparison applied between a candidate run number and a clause literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Comparator {
    /// Empty operator: exact equality.
    Eq,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl Comparator {
    fn from_symbol(symbol: &str) -> Option<Self> {
        Some(match symbol {
            "" => Self::Eq,
            "<" => Self::Lt,
            "<=" => Self::Le,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            _ => return None,
        })
    }

    /// The textual operator; empty for equality.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    /// Returns true if `run <op> literal`.
    #[must_use]
    pub const fn holds(self, run: u64, literal: u64) -> bool {
        match self {
            Self::Eq => run == literal,
            Self::Lt => run < literal,
            Self::Le => run <= literal,
            Self::Gt => run > literal,
            Self::Ge => run >= literal,
        }
    }
}

/// A single `<op><literal>` clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Clause {
    /// Operator applied to the run.
    pub comparator: Comparator,
    /// Run number the operator compares against.
    pub literal: u64,
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.comparator.symbol(), self.literal)
    }
}

/// A conjunction of applicability clauses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AppliesTo {
    clauses: Vec<Clause>,
}

fn clause_regex() -> &'static Regex {
    static CLAUSE: OnceLock<Regex> = OnceLock::new();
    CLAUSE.get_or_init(|| {
        Regex::new(r"^(?P<op><=|>=|<|>|)\s*(?P<lit>\d+)$").expect("clause pattern compiles")
    })
}

/// Parses a run number string as used in index entries and cache keys.
///
/// # Errors
/// Returns `IndexError::InvalidRunNumber` if the trimmed string is not a non-negative integer.
pub fn parse_run_number(run: &str) -> Result<u64, IndexError> {
    run.trim()
        .parse::<u64>()
        .map_err(|_| IndexError::InvalidRunNumber {
            value: run.to_string(),
        })
}

impl AppliesTo {
    /// Parses an expression such as `">=100"`, `"75"` or `">10, <=20"`.
    ///
    /// # Errors
    /// Returns `IndexError::InvalidAppliesTo` for an empty expression, an unknown
    /// operator or a non-numeric literal.
    pub fn parse(expression: &str) -> Result<Self, IndexError> {
        let invalid = |reason: String| IndexError::InvalidAppliesTo {
            expression: expression.to_string(),
            reason,
        };

        let mut clauses = Vec::new();
        for raw in expression.split(',') {
            let raw = raw.trim();
            if raw.is_empty() {
                return Err(invalid("empty clause".to_string()));
            }
            let caps = clause_regex()
                .captures(raw)
                .ok_or_else(|| invalid(format!("clause '{raw}' is not <op><run number>")))?;
            let comparator = Comparator::from_symbol(&caps["op"])
                .ok_or_else(|| invalid(format!("unknown operator in '{raw}'")))?;
            let literal = caps["lit"]
                .parse::<u64>()
                .map_err(|e| invalid(format!("literal in '{raw}': {e}")))?;
            clauses.push(Clause { comparator, literal });
        }

        Ok(Self { clauses })
    }

    /// `>=run`: the run itself and every later one.
    #[must_use]
    pub fn at_or_after(run: u64) -> Self {
        Self::single(Comparator::Ge, run)
    }

    /// Exactly one run.
    #[must_use]
    pub fn exactly(run: u64) -> Self {
        Self::single(Comparator::Eq, run)
    }

    /// An expression with one clause.
    #[must_use]
    pub fn single(comparator: Comparator, literal: u64) -> Self {
        Self {
            clauses: vec![Clause { comparator, literal }],
        }
    }

    /// The clauses, all of which must hold.
    #[must_use]
    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// Returns true if every clause holds for `run`.
    #[must_use]
    pub fn applies_to_run(&self, run: u64) -> bool {
        self.clauses.iter().all(|c| c.comparator.holds(run, c.literal))
    }

    /// Like [`applies_to_run`](Self::applies_to_run) for a run number string.
    ///
    /// # Errors
    /// Returns `IndexError::InvalidRunNumber` if `run` is not numeric.
    pub fn applies(&self, run: &str) -> Result<bool, IndexError> {
        Ok(self.applies_to_run(parse_run_number(run)?))
    }
}

impl FromStr for AppliesTo {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AppliesTo {
    type Error = IndexError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AppliesTo> for String {
    fn from(value: AppliesTo) -> Self {
        value.to_string()
    }
}

impl fmt::Display for AppliesTo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, clause) in self.clauses.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{clause}")?;
        }
        Ok(())
    }
}
