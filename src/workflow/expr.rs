//! Boolean dependency-condition expressions: atoms are
//! `success`, `failure`, `completion`, or `name=STATUS`, combined with
//! `AND`/`OR` and parenthesized grouping. A small recursive-descent
//! parser over a hand-tokenized stream — no parser-combinator crate is
//! warranted for a three-operator grammar this small.

use std::collections::BTreeMap;

use crate::errors::{JobletError, Result};
use crate::model::JobStatus;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// The edge's own upstream job completed with `JobStatus::Completed`.
    Success,
    /// The edge's own upstream job completed with `JobStatus::Failed`.
    Failure,
    /// The edge's own upstream job reached any terminal state.
    Completion,
    /// A named job (not necessarily the direct upstream) reached `status`.
    Named(String, JobStatus),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Evaluate against the direct upstream's status and a lookup table
    /// of every job's status by workflow-local name (for `name=STATUS`
    /// atoms, which may reference any job in the workflow, not just the
    /// direct predecessor).
    pub fn evaluate(&self, upstream_status: JobStatus, statuses: &BTreeMap<String, JobStatus>) -> bool {
        match self {
            Expr::Success => upstream_status == JobStatus::Completed,
            Expr::Failure => upstream_status == JobStatus::Failed,
            Expr::Completion => upstream_status.is_terminal(),
            Expr::Named(name, status) => statuses.get(name) == Some(status),
            Expr::And(a, b) => a.evaluate(upstream_status, statuses) && b.evaluate(upstream_status, statuses),
            Expr::Or(a, b) => a.evaluate(upstream_status, statuses) || b.evaluate(upstream_status, statuses),
        }
    }
}

pub fn parse(source: &str) -> Result<Expr> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(JobletError::validation(format!(
            "unexpected trailing tokens in condition '{source}'"
        )));
    }
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    And,
    Or,
    LParen,
    RParen,
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c == '(' || c == ')' || c.is_whitespace() {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                match word.to_ascii_uppercase().as_str() {
                    "AND" => tokens.push(Token::And),
                    "OR" => tokens.push(Token::Or),
                    _ if word.is_empty() => {
                        return Err(JobletError::validation(format!("empty token in '{source}'")))
                    }
                    _ => tokens.push(Token::Ident(word)),
                }
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_atom()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.pos += 1;
            let right = self.parse_atom()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_atom(&mut self) -> Result<Expr> {
        match self.tokens.get(self.pos).cloned() {
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.parse_or()?;
                match self.tokens.get(self.pos) {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err(JobletError::validation("unclosed '(' in condition")),
                }
            }
            Some(Token::Ident(word)) => {
                self.pos += 1;
                parse_ident_atom(&word)
            }
            other => Err(JobletError::validation(format!(
                "expected atom or '(', found {other:?}"
            ))),
        }
    }
}

fn parse_ident_atom(word: &str) -> Result<Expr> {
    match word.to_ascii_lowercase().as_str() {
        "success" => return Ok(Expr::Success),
        "failure" => return Ok(Expr::Failure),
        "completion" => return Ok(Expr::Completion),
        _ => {}
    }
    let (name, status_str) = word
        .split_once('=')
        .ok_or_else(|| JobletError::validation(format!("unrecognized condition atom '{word}'")))?;
    let status = parse_status(status_str)?;
    Ok(Expr::Named(name.to_string(), status))
}

fn parse_status(s: &str) -> Result<JobStatus> {
    match s.to_ascii_uppercase().as_str() {
        "INITIALIZING" => Ok(JobStatus::Initializing),
        "SCHEDULED" => Ok(JobStatus::Scheduled),
        "RUNNING" => Ok(JobStatus::Running),
        "COMPLETED" => Ok(JobStatus::Completed),
        "FAILED" => Ok(JobStatus::Failed),
        "STOPPED" => Ok(JobStatus::Stopped),
        other => Err(JobletError::validation(format!("unknown job status '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_atoms() {
        assert_eq!(parse("success").unwrap(), Expr::Success);
        assert_eq!(parse("failure").unwrap(), Expr::Failure);
        assert_eq!(parse("completion").unwrap(), Expr::Completion);
    }

    #[test]
    fn parses_named_atom() {
        assert_eq!(
            parse("build=COMPLETED").unwrap(),
            Expr::Named("build".to_string(), JobStatus::Completed)
        );
    }

    #[test]
    fn parses_and_or_with_parens() {
        let expr = parse("success AND (failure OR build=FAILED)").unwrap();
        let mut statuses = BTreeMap::new();
        statuses.insert("build".to_string(), JobStatus::Failed);
        assert!(expr.evaluate(JobStatus::Completed, &statuses));
        assert!(!expr.evaluate(JobStatus::Failed, &statuses));
    }

    #[test]
    fn rejects_unclosed_paren_and_trailing_garbage() {
        assert!(parse("(success").is_err());
        assert!(parse("success success").is_err());
    }
}
