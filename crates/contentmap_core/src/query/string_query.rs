//! Queries written as condition strings.
//!
//! # Responsibility
//! - Parse `` `Type`.`attr` OP value [AND|OR ...] `` conditions and RQL.
//! - Turn qualifiers into joins from the root type and build the SELECT.
//!
//! # Invariants
//! - AND binds tighter than OR; parentheses group explicitly.
//! - Parse errors surface when the condition is set, resolution errors
//!   (`UnknownType`, `UnknownField`, `AmbiguousRelation`) when it is built.

use crate::error::{PersistenceError, PersistenceResult};
use crate::mapper::criteria::{CriteriaValue, Operator};
use crate::mapper::registry::MapperRegistry;
use crate::mapper::sql::SelectStatement;
use crate::model::schema::OrderTerm;
use crate::model::value::Value;
use crate::query::condition::{ConditionExpr, ConditionResolver};
use crate::query::execute_select;
use crate::query::paging::PagingInfo;
use crate::query::rql::parse_rql;
use crate::tx::{BuildDepth, ObjectHandle, Transaction};
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^\s*(?:`(?P<quoted>[^`]+)`|'(?P<single>(?:[^']|'')*)'|"(?P<double>[^"]*)"|(?P<number>-?\d+(?:\.\d+)?)|(?P<op><=|>=|!=|<>|=|<|>)|(?P<punct>[(),.])|(?P<word>[A-Za-z_][A-Za-z0-9_]*))"#,
    )
    .expect("valid condition token regex")
});

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word { text: String, quoted: bool },
    Literal(Value),
    Op(String),
    Punct(char),
}

impl Token {
    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Self::Word { text, quoted: false } if text.eq_ignore_ascii_case(keyword))
    }
}

fn tokenize(input: &str) -> PersistenceResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut pos = 0;
    while !input[pos..].trim().is_empty() {
        let captures = TOKEN_RE.captures(&input[pos..]).ok_or_else(|| {
            PersistenceError::InvalidQuery(format!(
                "unexpected input at position {pos} in `{input}`"
            ))
        })?;
        let token = if let Some(quoted) = captures.name("quoted") {
            Token::Word {
                text: quoted.as_str().to_string(),
                quoted: true,
            }
        } else if let Some(single) = captures.name("single") {
            Token::Literal(Value::Text(single.as_str().replace("''", "'")))
        } else if let Some(double) = captures.name("double") {
            Token::Literal(Value::Text(double.as_str().to_string()))
        } else if let Some(number) = captures.name("number") {
            Token::Literal(parse_number(number.as_str())?)
        } else if let Some(op) = captures.name("op") {
            Token::Op(op.as_str().to_string())
        } else if let Some(punct) = captures.name("punct") {
            Token::Punct(punct.as_str().chars().next().unwrap_or(','))
        } else if let Some(word) = captures.name("word") {
            Token::Word {
                text: word.as_str().to_string(),
                quoted: false,
            }
        } else {
            return Err(PersistenceError::InvalidQuery(format!(
                "unexpected input at position {pos} in `{input}`"
            )));
        };
        tokens.push(token);
        pos += captures.get(0).map_or(0, |whole| whole.end());
    }
    Ok(tokens)
}

fn parse_number(raw: &str) -> PersistenceResult<Value> {
    if let Ok(integer) = raw.parse::<i64>() {
        return Ok(Value::Integer(integer));
    }
    raw.parse::<f64>()
        .map(Value::Real)
        .map_err(|_| PersistenceError::InvalidQuery(format!("malformed number `{raw}`")))
}

/// Parses a SQL-like condition string into a condition tree.
pub fn parse_condition(input: &str) -> PersistenceResult<ConditionExpr> {
    let mut parser = ConditionParser {
        tokens: tokenize(input)?,
        pos: 0,
    };
    let expr = parser.parse_or()?;
    if let Some(token) = parser.peek() {
        return Err(PersistenceError::InvalidQuery(format!(
            "unexpected {token:?} after condition"
        )));
    }
    Ok(expr)
}

struct ConditionParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl ConditionParser {
    fn parse_or(&mut self) -> PersistenceResult<ConditionExpr> {
        let mut terms = vec![self.parse_and()?];
        while self.eat_keyword("OR") {
            terms.push(self.parse_and()?);
        }
        Ok(ConditionExpr::or(terms))
    }

    fn parse_and(&mut self) -> PersistenceResult<ConditionExpr> {
        let mut terms = vec![self.parse_unary()?];
        while self.eat_keyword("AND") {
            terms.push(self.parse_unary()?);
        }
        Ok(ConditionExpr::and(terms))
    }

    fn parse_unary(&mut self) -> PersistenceResult<ConditionExpr> {
        if self.eat_keyword("NOT") {
            return Ok(ConditionExpr::Not(Box::new(self.parse_unary()?)));
        }
        if self.eat_punct('(') {
            let expr = self.parse_or()?;
            self.expect_punct(')')?;
            return Ok(expr);
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> PersistenceResult<ConditionExpr> {
        let first = self.expect_name()?;
        let (qualifier, attribute) = if self.eat_punct('.') {
            (Some(first), self.expect_name()?)
        } else {
            (None, first)
        };
        let qualifier = qualifier.as_deref();

        if self.eat_keyword("IS") {
            let negated = self.eat_keyword("NOT");
            if !self.eat_keyword("NULL") {
                return Err(self.unexpected("NULL"));
            }
            let operator = if negated { Operator::Ne } else { Operator::Eq };
            return Ok(ConditionExpr::compare(qualifier, &attribute, operator, Value::Null));
        }

        let negated = self.eat_keyword("NOT");
        let expr = if self.eat_keyword("LIKE") {
            ConditionExpr::compare(qualifier, &attribute, Operator::Like, self.parse_literal()?)
        } else if self.eat_keyword("IN") {
            self.expect_punct('(')?;
            let mut values = vec![self.parse_literal()?];
            while self.eat_punct(',') {
                values.push(self.parse_literal()?);
            }
            self.expect_punct(')')?;
            ConditionExpr::compare(qualifier, &attribute, Operator::In, CriteriaValue::List(values))
        } else if negated {
            return Err(self.unexpected("LIKE or IN"));
        } else {
            let Some(Token::Op(op)) = self.next() else {
                return Err(self.unexpected("comparison operator"));
            };
            let operator = Operator::from_sql(&op)?;
            ConditionExpr::compare(qualifier, &attribute, operator, self.parse_literal()?)
        };

        Ok(if negated {
            ConditionExpr::Not(Box::new(expr))
        } else {
            expr
        })
    }

    fn parse_literal(&mut self) -> PersistenceResult<Value> {
        match self.next() {
            Some(Token::Literal(value)) => Ok(value),
            Some(token) if token.is_keyword("NULL") => Ok(Value::Null),
            _ => Err(self.unexpected("literal value")),
        }
    }

    fn expect_name(&mut self) -> PersistenceResult<String> {
        match self.next() {
            Some(Token::Word { text, .. }) => Ok(text),
            _ => Err(self.unexpected("name")),
        }
    }

    fn expect_punct(&mut self, expected: char) -> PersistenceResult<()> {
        if self.eat_punct(expected) {
            return Ok(());
        }
        Err(self.unexpected(&format!("`{expected}`")))
    }

    fn eat_punct(&mut self, expected: char) -> bool {
        if self.peek() == Some(&Token::Punct(expected)) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek().is_some_and(|token| token.is_keyword(keyword)) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn unexpected(&self, expected: &str) -> PersistenceError {
        PersistenceError::InvalidQuery(format!(
            "expected {expected} at token {}",
            self.pos.saturating_sub(1)
        ))
    }
}

/// Query over one root type filtered by a condition string.
#[derive(Debug, Clone)]
pub struct StringQuery {
    registry: MapperRegistry,
    root_type: String,
    condition: Option<ConditionExpr>,
}

impl StringQuery {
    pub fn new(registry: MapperRegistry, root_type: &str) -> PersistenceResult<Self> {
        registry.entity(root_type)?;
        Ok(Self {
            registry,
            root_type: root_type.to_string(),
            condition: None,
        })
    }

    pub fn root_type(&self) -> &str {
        &self.root_type
    }

    pub fn condition(&self) -> Option<&ConditionExpr> {
        self.condition.as_ref()
    }

    /// Sets a SQL-like condition; a blank string removes the condition.
    pub fn set_condition(&mut self, condition: &str) -> PersistenceResult<()> {
        self.condition = if condition.trim().is_empty() {
            None
        } else {
            Some(parse_condition(condition)?)
        };
        Ok(())
    }

    /// Sets an RQL condition; a blank string removes the condition.
    pub fn set_rql_condition(&mut self, rql: &str) -> PersistenceResult<()> {
        self.condition = if rql.trim().is_empty() {
            None
        } else {
            Some(parse_rql(rql)?)
        };
        Ok(())
    }

    pub fn set_condition_expr(&mut self, condition: ConditionExpr) {
        self.condition = Some(condition);
    }

    pub fn build(&self, order: Option<&[OrderTerm]>) -> PersistenceResult<SelectStatement> {
        let mapper = self.registry.mapper(&self.root_type)?;
        let mut select = mapper.select_sql(&[], None, None, order)?;
        if let Some(condition) = &self.condition {
            ConditionResolver::new(&self.registry, &self.root_type).apply(&mut select, condition)?;
        }
        debug!(
            "event=string_query_build module=query status=ok type={} joins={}",
            self.root_type,
            select.joins.len()
        );
        Ok(select)
    }

    /// Runs the query with the table mapping of `tx`, which may differ
    /// from the one the query was created with.
    pub fn execute(
        &self,
        tx: &mut Transaction<'_>,
        depth: BuildDepth,
        order: Option<&[OrderTerm]>,
        paging: Option<&mut PagingInfo>,
    ) -> PersistenceResult<Vec<ObjectHandle>> {
        let scoped = Self {
            registry: tx.registry().clone(),
            ..self.clone()
        };
        let select = scoped.build(order)?;
        execute_select(tx, &scoped.registry, &scoped.root_type, select, paging, depth)
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_condition, tokenize, Token};
    use crate::mapper::criteria::{CriteriaValue, Operator};
    use crate::model::value::Value;
    use crate::query::condition::ConditionExpr;

    #[test]
    fn tokenizer_handles_quotes_and_operators() {
        let tokens = tokenize("`Chapter`.`name` <> 'it''s' AND sortkey >= -2.5").unwrap();
        assert_eq!(
            tokens[0],
            Token::Word {
                text: "Chapter".to_string(),
                quoted: true
            }
        );
        assert_eq!(tokens[3], Token::Op("<>".to_string()));
        assert_eq!(tokens[4], Token::Literal(Value::from("it's")));
        assert_eq!(tokens[7], Token::Op(">=".to_string()));
        assert_eq!(tokens[8], Token::Literal(Value::Real(-2.5)));
    }

    #[test]
    fn qualified_comparison_parses() {
        let expr = parse_condition("`SubChapter`.`name` = 'Intro'").unwrap();
        assert_eq!(
            expr,
            ConditionExpr::compare(Some("SubChapter"), "name", Operator::Eq, "Intro")
        );
    }

    #[test]
    fn and_binds_tighter_than_or_unless_parenthesized() {
        let flat = parse_condition("a = 1 OR b = 2 AND c = 3").unwrap();
        assert!(matches!(&flat, ConditionExpr::Or(terms) if terms.len() == 2));

        let grouped = parse_condition("(a = 1 OR b = 2) AND c = 3").unwrap();
        assert!(matches!(&grouped, ConditionExpr::And(terms) if terms.len() == 2));
    }

    #[test]
    fn null_checks_and_negated_membership() {
        let expr = parse_condition("fk_book_id IS NOT NULL AND name NOT IN ('a', 'b')").unwrap();
        let ConditionExpr::And(terms) = expr else {
            panic!("expected conjunction");
        };
        assert_eq!(
            terms[0],
            ConditionExpr::compare(None, "fk_book_id", Operator::Ne, Value::Null)
        );
        assert_eq!(
            terms[1],
            ConditionExpr::Not(Box::new(ConditionExpr::compare(
                None,
                "name",
                Operator::In,
                CriteriaValue::List(vec![Value::from("a"), Value::from("b")])
            )))
        );
    }

    #[test]
    fn malformed_conditions_are_rejected() {
        assert!(parse_condition("name =").is_err());
        assert!(parse_condition("name ~ 'x'").is_err());
        assert!(parse_condition("(name = 'x'").is_err());
        assert!(parse_condition("name IS 3").is_err());
    }
}
