//! Minimal `UPDATE` grammar for the raw-statement escape hatch.
//!
//! Accepted form:
//!
//! ```text
//! UPDATE <table> SET col = val [, col = val ...] WHERE col = val [AND col = val ...] [;]
//! ```
//!
//! Values are single-quoted strings (`''` escapes a quote), integers, `NULL`
//! and the `NOW()` marker. Everything else is rejected before any part of the
//! statement reaches a backend.

use std::fmt::{Display, Formatter};

use crate::parse_rfc3339_utc;
use crate::record::{LifecycleState, ScoreKey};

/// Table holding score records in every backend.
pub const LEDGER_TABLE: &str = "score_records";

const ASSIGNABLE_COLUMNS: [&str; 3] = ["lifecycle_state", "modified_at", "modified_by"];
const PREDICATE_COLUMNS: [&str; 6] = [
    "record_id",
    "subject_type",
    "subject_id",
    "judge_id",
    "tournament_id",
    "lifecycle_state",
];
const REJECTED_KEYWORDS: [&str; 16] = [
    "OR", "NOT", "IN", "LIKE", "BETWEEN", "IS", "JOIN", "FROM", "SELECT", "EXISTS", "UNION",
    "RETURNING", "LIMIT", "ORDER", "DELETE", "INSERT",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Text(String),
    Integer(i64),
    Null,
    Now,
}

impl Display for SqlValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(value) => write!(f, "'{}'", value.replace('\'', "''")),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Null => f.write_str("NULL"),
            Self::Now => f.write_str("NOW()"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateStatement {
    pub table: String,
    pub assignments: Vec<(String, SqlValue)>,
    pub predicates: Vec<(String, SqlValue)>,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StatementError {
    #[error("unexpected {found} at offset {offset}, expected {expected}")]
    Unexpected {
        offset: usize,
        found: String,
        expected: &'static str,
    },
    #[error("unsupported construct {0}")]
    Unsupported(String),
    #[error("statement ended early, expected {0}")]
    Incomplete(&'static str),
    #[error("statement rejected by ledger policy: {0}")]
    Policy(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Text(String),
    Integer(i64),
    Equals,
    Comma,
    LeftParen,
    RightParen,
    Semicolon,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Self::Word(word) => format!("word {word}"),
            Self::Text(text) => format!("string '{text}'"),
            Self::Integer(value) => format!("integer {value}"),
            Self::Equals => "'='".to_string(),
            Self::Comma => "','".to_string(),
            Self::LeftParen => "'('".to_string(),
            Self::RightParen => "')'".to_string(),
            Self::Semicolon => "';'".to_string(),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, StatementError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut index = 0;

    while index < chars.len() {
        let (offset, ch) = chars[index];
        match ch {
            c if c.is_whitespace() => index += 1,
            '=' => {
                tokens.push((offset, Token::Equals));
                index += 1;
            }
            ',' => {
                tokens.push((offset, Token::Comma));
                index += 1;
            }
            '(' => {
                tokens.push((offset, Token::LeftParen));
                index += 1;
            }
            ')' => {
                tokens.push((offset, Token::RightParen));
                index += 1;
            }
            ';' => {
                tokens.push((offset, Token::Semicolon));
                index += 1;
            }
            '\'' => {
                let mut text = String::new();
                index += 1;
                loop {
                    let Some(&(_, next)) = chars.get(index) else {
                        return Err(StatementError::Incomplete("closing quote"));
                    };
                    index += 1;
                    if next != '\'' {
                        text.push(next);
                        continue;
                    }
                    if matches!(chars.get(index), Some((_, '\''))) {
                        text.push('\'');
                        index += 1;
                        continue;
                    }
                    break;
                }
                tokens.push((offset, Token::Text(text)));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = index;
                index += 1;
                while matches!(chars.get(index), Some((_, d)) if d.is_ascii_digit()) {
                    index += 1;
                }
                let literal: String = chars[start..index].iter().map(|(_, c)| *c).collect();
                let value = literal.parse::<i64>().map_err(|_| StatementError::Unexpected {
                    offset,
                    found: format!("literal {literal}"),
                    expected: "integer",
                })?;
                tokens.push((offset, Token::Integer(value)));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = index;
                while chars
                    .get(index)
                    .is_some_and(|(_, w)| w.is_ascii_alphanumeric() || *w == '_')
                {
                    index += 1;
                }
                let word: String = chars[start..index].iter().map(|(_, c)| *c).collect();
                tokens.push((offset, Token::Word(word)));
            }
            other => {
                return Err(StatementError::Unsupported(format!(
                    "character {other:?} at offset {offset}"
                )));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position).map(|(_, token)| token)
    }

    fn advance(&mut self, expected: &'static str) -> Result<(usize, Token), StatementError> {
        let item = self
            .tokens
            .get(self.position)
            .cloned()
            .ok_or(StatementError::Incomplete(expected))?;
        self.position += 1;
        Ok(item)
    }

    fn keyword(&mut self, keyword: &'static str) -> Result<(), StatementError> {
        let (offset, token) = self.advance(keyword)?;
        match token {
            Token::Word(word) if word.eq_ignore_ascii_case(keyword) => Ok(()),
            other => Err(unexpected(offset, &other, keyword)),
        }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(word)) if word.eq_ignore_ascii_case(keyword))
    }

    fn identifier(&mut self) -> Result<String, StatementError> {
        let (offset, token) = self.advance("identifier")?;
        match token {
            Token::Word(word) if is_reserved(&word) => Err(StatementError::Unsupported(format!(
                "keyword {} at offset {offset}",
                word.to_ascii_uppercase()
            ))),
            Token::Word(word) => {
                if matches!(self.peek(), Some(Token::LeftParen)) {
                    return Err(StatementError::Unsupported(format!(
                        "function call {word}() at offset {offset}"
                    )));
                }
                Ok(word.to_ascii_lowercase())
            }
            other => Err(unexpected(offset, &other, "identifier")),
        }
    }

    fn equals(&mut self) -> Result<(), StatementError> {
        let (offset, token) = self.advance("'='")?;
        match token {
            Token::Equals => Ok(()),
            other => Err(unexpected(offset, &other, "'='")),
        }
    }

    fn value(&mut self) -> Result<SqlValue, StatementError> {
        let (offset, token) = self.advance("value")?;
        match token {
            Token::Text(text) => Ok(SqlValue::Text(text)),
            Token::Integer(value) => Ok(SqlValue::Integer(value)),
            Token::Word(word) if word.eq_ignore_ascii_case("NULL") => Ok(SqlValue::Null),
            Token::Word(word) if word.eq_ignore_ascii_case("NOW") => {
                let (offset, open) = self.advance("'('")?;
                if open != Token::LeftParen {
                    return Err(unexpected(offset, &open, "'('"));
                }
                let (offset, close) = self.advance("')'")?;
                if close != Token::RightParen {
                    return Err(StatementError::Unsupported(format!(
                        "arguments to NOW() at offset {offset}"
                    )));
                }
                Ok(SqlValue::Now)
            }
            Token::Word(word) if matches!(self.peek(), Some(Token::LeftParen)) => Err(
                StatementError::Unsupported(format!("function call {word}() at offset {offset}")),
            ),
            Token::LeftParen => Err(StatementError::Unsupported(format!(
                "parenthesized expression or subquery at offset {offset}"
            ))),
            other => Err(unexpected(offset, &other, "value")),
        }
    }

    fn pair(&mut self) -> Result<(String, SqlValue), StatementError> {
        let column = self.identifier()?;
        self.equals()?;
        let value = self.value()?;
        Ok((column, value))
    }
}

fn unexpected(offset: usize, token: &Token, expected: &'static str) -> StatementError {
    if let Token::Word(word) = token {
        if is_reserved(word) {
            return StatementError::Unsupported(format!(
                "keyword {} at offset {offset}",
                word.to_ascii_uppercase()
            ));
        }
    }
    StatementError::Unexpected {
        offset,
        found: token.describe(),
        expected,
    }
}

fn is_reserved(word: &str) -> bool {
    REJECTED_KEYWORDS
        .iter()
        .chain(["UPDATE", "SET", "WHERE", "AND", "NULL", "NOW"].iter())
        .any(|keyword| word.eq_ignore_ascii_case(keyword))
}

/// Parses one statement of the accepted grammar.
///
/// # Errors
/// Returns [`StatementError`] for any input outside the grammar. Nothing of a
/// rejected statement is returned, so nothing can be partially executed.
pub fn parse_update(input: &str) -> Result<UpdateStatement, StatementError> {
    let mut parser = Parser {
        tokens: tokenize(input)?,
        position: 0,
    };

    parser.keyword("UPDATE")?;
    let table = parser.identifier()?;
    parser.keyword("SET")?;

    let mut assignments = vec![parser.pair()?];
    while matches!(parser.peek(), Some(Token::Comma)) {
        parser.position += 1;
        let (column, value) = parser.pair()?;
        if assignments.iter().any(|(existing, _)| existing == &column) {
            return Err(StatementError::Policy(format!(
                "column {column} assigned twice"
            )));
        }
        assignments.push((column, value));
    }

    parser.keyword("WHERE")?;
    let mut predicates = vec![parser.pair()?];
    while parser.peek_keyword("AND") {
        parser.position += 1;
        predicates.push(parser.pair()?);
    }

    if matches!(parser.peek(), Some(Token::Semicolon)) {
        parser.position += 1;
    }

    if let Some((offset, token)) = parser.tokens.get(parser.position).cloned() {
        return Err(unexpected(offset, &token, "end of statement"));
    }

    Ok(UpdateStatement {
        table,
        assignments,
        predicates,
    })
}

impl UpdateStatement {
    /// Builds the archive update for every current row of `key`.
    #[must_use]
    pub fn archive_for_key(key: &ScoreKey, modified_by: &str) -> Self {
        Self {
            table: LEDGER_TABLE.to_string(),
            assignments: vec![
                (
                    "lifecycle_state".to_string(),
                    SqlValue::Text(LifecycleState::Historical.as_str().to_string()),
                ),
                ("modified_at".to_string(), SqlValue::Now),
                (
                    "modified_by".to_string(),
                    SqlValue::Text(modified_by.to_string()),
                ),
            ],
            predicates: vec![
                (
                    "subject_type".to_string(),
                    SqlValue::Text(key.subject_type.as_str().to_string()),
                ),
                (
                    "subject_id".to_string(),
                    SqlValue::Text(key.subject_id.to_string()),
                ),
                (
                    "judge_id".to_string(),
                    SqlValue::Text(key.judge_id.to_string()),
                ),
                (
                    "tournament_id".to_string(),
                    SqlValue::Text(key.tournament_id.to_string()),
                ),
                (
                    "lifecycle_state".to_string(),
                    SqlValue::Text(LifecycleState::Current.as_str().to_string()),
                ),
            ],
        }
    }

    /// Restricts a parsed statement to what the ledger allows: only the
    /// `current -> historical` transition, filtered to current rows.
    ///
    /// # Errors
    /// Returns [`StatementError::Policy`] naming the first violation.
    pub fn check_ledger_shape(&self) -> Result<(), StatementError> {
        if self.table != LEDGER_TABLE {
            return Err(StatementError::Policy(format!(
                "table {} is not {LEDGER_TABLE}",
                self.table
            )));
        }

        for (column, value) in &self.assignments {
            if !ASSIGNABLE_COLUMNS.contains(&column.as_str()) {
                return Err(StatementError::Policy(format!(
                    "column {column} is immutable"
                )));
            }
            match (column.as_str(), value) {
                ("lifecycle_state", SqlValue::Text(state))
                    if state == LifecycleState::Historical.as_str() => {}
                ("lifecycle_state", _) => {
                    return Err(StatementError::Policy(
                        "lifecycle_state may only be set to 'historical'".to_string(),
                    ));
                }
                ("modified_at", SqlValue::Now) => {}
                ("modified_at", SqlValue::Text(raw)) if parse_rfc3339_utc(raw).is_ok() => {}
                ("modified_at", _) => {
                    return Err(StatementError::Policy(
                        "modified_at must be NOW() or an RFC3339 UTC timestamp".to_string(),
                    ));
                }
                ("modified_by", SqlValue::Text(actor)) if !actor.trim().is_empty() => {}
                _ => {
                    return Err(StatementError::Policy(
                        "modified_by must be a non-empty string".to_string(),
                    ));
                }
            }
        }

        if !self
            .assignments
            .iter()
            .any(|(column, _)| column == "lifecycle_state")
        {
            return Err(StatementError::Policy(
                "statement must set lifecycle_state".to_string(),
            ));
        }

        for (column, value) in &self.predicates {
            if !PREDICATE_COLUMNS.contains(&column.as_str()) {
                return Err(StatementError::Policy(format!(
                    "column {column} cannot be filtered on"
                )));
            }
            if matches!(value, SqlValue::Null | SqlValue::Now) {
                return Err(StatementError::Policy(format!(
                    "predicate on {column} must compare against a literal"
                )));
            }
        }

        let filters_current = self.predicates.iter().any(|(column, value)| {
            column == "lifecycle_state"
                && *value == SqlValue::Text(LifecycleState::Current.as_str().to_string())
        });
        if !filters_current {
            return Err(StatementError::Policy(
                "statement must filter on lifecycle_state = 'current'".to_string(),
            ));
        }

        Ok(())
    }

    /// Value assigned to `column`, if any.
    #[must_use]
    pub fn assigned(&self, column: &str) -> Option<&SqlValue> {
        self.assignments
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }
}

impl Display for UpdateStatement {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let join = |pairs: &[(String, SqlValue)], separator: &str| {
            pairs
                .iter()
                .map(|(column, value)| format!("{column} = {value}"))
                .collect::<Vec<_>>()
                .join(separator)
        };
        write!(
            f,
            "UPDATE {} SET {} WHERE {}",
            self.table,
            join(&self.assignments, ", "),
            join(&self.predicates, " AND ")
        )
    }
}

/// Text form of the archive update for `key`, as fed to the raw fallback.
#[must_use]
pub fn render_archive_statement(key: &ScoreKey, modified_by: &str) -> String {
    UpdateStatement::archive_for_key(key, modified_by).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::{normalize_identifier, Identifier};
    use crate::record::SubjectType;

    fn fixture_key() -> ScoreKey {
        ScoreKey {
            subject_type: SubjectType::Individual,
            subject_id: normalize_identifier("5").id,
            judge_id: Identifier::Unresolved,
            tournament_id: normalize_identifier("1").id,
        }
    }

    fn must_parse(input: &str) -> UpdateStatement {
        match parse_update(input) {
            Ok(value) => value,
            Err(err) => panic!("expected {input:?} to parse: {err}"),
        }
    }

    #[test]
    fn rendered_archive_statement_parses_back_identically() {
        let text = render_archive_statement(&fixture_key(), "O'Brien");
        let parsed = must_parse(&text);
        assert_eq!(parsed, UpdateStatement::archive_for_key(&fixture_key(), "O'Brien"));
        assert_eq!(parsed.check_ledger_shape(), Ok(()));
    }

    #[test]
    fn keywords_are_case_insensitive_and_semicolon_optional() {
        let parsed = must_parse(
            "update score_records set lifecycle_state = 'historical' \
             where record_id = '01J0SQQP7M70P6Y3R4T8D8G8M2' and lifecycle_state = 'current';",
        );
        assert_eq!(parsed.table, "score_records");
        assert_eq!(parsed.predicates.len(), 2);
        assert_eq!(parsed.check_ledger_shape(), Ok(()));
    }

    #[test]
    fn constructs_outside_the_grammar_are_rejected() {
        for input in [
            "UPDATE score_records SET lifecycle_state = 'historical' WHERE judge_id = '1' OR judge_id = '2'",
            "UPDATE score_records SET lifecycle_state = 'historical' WHERE seq > 3",
            "UPDATE score_records SET lifecycle_state = 'historical' WHERE judge_id IN ('1', '2')",
            "UPDATE score_records SET lifecycle_state = 'historical' WHERE judge_id = (SELECT id FROM judges)",
            "UPDATE score_records SET lifecycle_state = lower('HISTORICAL') WHERE judge_id = '1'",
            "UPDATE score_records JOIN judges SET lifecycle_state = 'historical' WHERE judge_id = '1'",
            "UPDATE score_records SET lifecycle_state = 'historical'",
            "UPDATE score_records SET lifecycle_state = 'historical' WHERE judge_id = '1'; DELETE FROM score_records",
            "UPDATE score_records SET lifecycle_state = 'historical' WHERE judge_id LIKE '1%'",
            "UPDATE s.score_records SET lifecycle_state = 'historical' WHERE judge_id = '1'",
            "UPDATE score_records SET modified_at = NOW(1) WHERE judge_id = '1'",
            "UPDATE score_records SET lifecycle_state = 'historical' WHERE judge_id = 'unterminated",
        ] {
            assert!(parse_update(input).is_err(), "{input:?} should be rejected");
        }
    }

    #[test]
    fn policy_blocks_content_edits_and_revival() {
        for input in [
            "UPDATE score_records SET criteria_json = '{}' WHERE record_id = 'x' AND lifecycle_state = 'current'",
            "UPDATE score_records SET lifecycle_state = 'current' WHERE record_id = 'x' AND lifecycle_state = 'current'",
            "UPDATE judges SET lifecycle_state = 'historical' WHERE record_id = 'x' AND lifecycle_state = 'current'",
            "UPDATE score_records SET lifecycle_state = 'historical' WHERE record_id = 'x'",
            "UPDATE score_records SET lifecycle_state = 'historical' WHERE seq = 4 AND lifecycle_state = 'current'",
            "UPDATE score_records SET modified_by = 'x' WHERE record_id = 'x' AND lifecycle_state = 'current'",
        ] {
            let parsed = must_parse(input);
            assert!(
                matches!(parsed.check_ledger_shape(), Err(StatementError::Policy(_))),
                "{input:?} should violate ledger policy"
            );
        }
    }

    #[test]
    fn duplicate_assignment_is_rejected() {
        assert!(matches!(
            parse_update(
                "UPDATE score_records SET modified_by = 'a', modified_by = 'b' WHERE record_id = 'x'"
            ),
            Err(StatementError::Policy(_))
        ));
    }
}
