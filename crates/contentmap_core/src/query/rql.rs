//! RQL condition grammar.
//!
//! ```text
//! or         := and ('|' and)*
//! and        := term ('&' term)*
//! term       := '(' or ')' | comparison
//! comparison := field '=' [operator '='] value
//! field      := name ['.' name]
//! value      := '(' scalar (',' scalar)* ')' | scalar
//! ```
//!
//! `field=value` means equality. Unquoted scalars are typed: `null`,
//! integers and reals convert, everything else is text. `*` in a `like`
//! pattern matches any run of characters.

use crate::error::{PersistenceError, PersistenceResult};
use crate::mapper::criteria::{CriteriaValue, Operator};
use crate::model::value::Value;
use crate::query::condition::ConditionExpr;

/// Parses an RQL string into a condition tree.
pub fn parse_rql(input: &str) -> PersistenceResult<ConditionExpr> {
    let mut parser = RqlParser {
        chars: input.chars().collect(),
        pos: 0,
    };
    let expr = parser.parse_or()?;
    parser.skip_whitespace();
    if let Some(ch) = parser.peek() {
        return Err(parser.error(&format!("unexpected `{ch}`")));
    }
    Ok(expr)
}

struct RqlParser {
    chars: Vec<char>,
    pos: usize,
}

impl RqlParser {
    fn parse_or(&mut self) -> PersistenceResult<ConditionExpr> {
        let mut terms = vec![self.parse_and()?];
        while self.eat('|') {
            terms.push(self.parse_and()?);
        }
        Ok(ConditionExpr::or(terms))
    }

    fn parse_and(&mut self) -> PersistenceResult<ConditionExpr> {
        let mut terms = vec![self.parse_term()?];
        while self.eat('&') {
            terms.push(self.parse_term()?);
        }
        Ok(ConditionExpr::and(terms))
    }

    fn parse_term(&mut self) -> PersistenceResult<ConditionExpr> {
        if self.eat('(') {
            let expr = self.parse_or()?;
            if !self.eat(')') {
                return Err(self.error("missing `)`"));
            }
            return Ok(expr);
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> PersistenceResult<ConditionExpr> {
        self.skip_whitespace();
        let field = self.take_while(|ch| ch.is_alphanumeric() || ch == '_' || ch == '.');
        if field.is_empty() {
            return Err(self.error("expected a field name"));
        }
        let (qualifier, attribute) = match field.split_once('.') {
            Some((qualifier, attribute)) if !qualifier.is_empty() && !attribute.is_empty() => {
                (Some(qualifier.to_string()), attribute.to_string())
            }
            Some(_) => return Err(self.error(&format!("malformed field `{field}`"))),
            None => (None, field),
        };
        if !self.eat('=') {
            return Err(self.error(&format!("expected `=` after `{attribute}`")));
        }

        let operator = self.parse_operator()?;
        let value = match (operator, self.parse_value()?) {
            (Operator::In, CriteriaValue::Single(single)) => CriteriaValue::List(vec![single]),
            (Operator::In, list) => list,
            (_, CriteriaValue::List(_)) => {
                return Err(self.error(&format!(
                    "only `in` accepts a value list, found it on `{attribute}`"
                )));
            }
            (Operator::Like, CriteriaValue::Single(Value::Text(pattern))) => {
                CriteriaValue::Single(Value::Text(pattern.replace('*', "%")))
            }
            (_, single) => single,
        };

        Ok(ConditionExpr::Compare {
            qualifier,
            attribute,
            operator,
            value,
        })
    }

    /// Reads `name=` when present; plain `field=value` is equality.
    fn parse_operator(&mut self) -> PersistenceResult<Operator> {
        let start = self.pos;
        let name = self.take_while(|ch| ch.is_ascii_alphabetic());
        if !name.is_empty() && self.eat('=') {
            return Operator::from_rql(&name);
        }
        self.pos = start;
        Ok(Operator::Eq)
    }

    fn parse_value(&mut self) -> PersistenceResult<CriteriaValue> {
        if self.eat('(') {
            let mut values = vec![self.parse_scalar(true)?];
            while self.eat(',') {
                values.push(self.parse_scalar(true)?);
            }
            if !self.eat(')') {
                return Err(self.error("missing `)` after value list"));
            }
            return Ok(CriteriaValue::List(values));
        }
        Ok(CriteriaValue::Single(self.parse_scalar(false)?))
    }

    fn parse_scalar(&mut self, in_list: bool) -> PersistenceResult<Value> {
        self.skip_whitespace();
        if let Some(quote @ ('"' | '\'')) = self.peek() {
            self.pos += 1;
            let text = self.take_while(|ch| ch != quote);
            if !self.eat_exact(quote) {
                return Err(self.error("unterminated quoted value"));
            }
            return Ok(Value::Text(text));
        }

        let raw = self.take_while(|ch| !matches!(ch, '&' | '|' | ')') && !(in_list && ch == ','));
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(self.error("expected a value"));
        }
        Ok(typed_scalar(raw))
    }

    fn take_while(&mut self, accept: impl Fn(char) -> bool) -> String {
        let start = self.pos;
        while self.pos < self.chars.len() && accept(self.chars[self.pos]) {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn eat(&mut self, expected: char) -> bool {
        self.skip_whitespace();
        self.eat_exact(expected)
    }

    fn eat_exact(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn error(&self, message: &str) -> PersistenceError {
        PersistenceError::InvalidQuery(format!("rql at position {}: {message}", self.pos))
    }
}

fn typed_scalar(raw: &str) -> Value {
    if raw.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(integer) = raw.parse::<i64>() {
        return Value::Integer(integer);
    }
    if let Ok(real) = raw.parse::<f64>() {
        if real.is_finite() {
            return Value::Real(real);
        }
    }
    Value::Text(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::parse_rql;
    use crate::mapper::criteria::{CriteriaValue, Operator};
    use crate::model::value::Value;
    use crate::query::condition::ConditionExpr;

    #[test]
    fn plain_equality_and_typed_values() {
        let expr = parse_rql("sortkey=3").unwrap();
        assert_eq!(
            expr,
            ConditionExpr::compare(None, "sortkey", Operator::Eq, Value::Integer(3))
        );
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let expr = parse_rql("a=1|b=2&c=3").unwrap();
        let ConditionExpr::Or(terms) = expr else {
            panic!("expected disjunction");
        };
        assert_eq!(terms.len(), 2);
        assert!(matches!(&terms[1], ConditionExpr::And(inner) if inner.len() == 2));
    }

    #[test]
    fn qualified_in_list_and_like_wildcards() {
        let expr = parse_rql("(SubChapter.name=in=(a,b))&name=like=intro*").unwrap();
        let ConditionExpr::And(terms) = expr else {
            panic!("expected conjunction");
        };
        assert_eq!(
            terms[0],
            ConditionExpr::Compare {
                qualifier: Some("SubChapter".to_string()),
                attribute: "name".to_string(),
                operator: Operator::In,
                value: CriteriaValue::List(vec![Value::from("a"), Value::from("b")]),
            }
        );
        assert_eq!(
            terms[1],
            ConditionExpr::compare(None, "name", Operator::Like, "intro%")
        );
    }

    #[test]
    fn operator_aliases_and_null() {
        let expr = parse_rql("sortkey=gte=2&fk_book_id=null").unwrap();
        let ConditionExpr::And(terms) = expr else {
            panic!("expected conjunction");
        };
        assert!(matches!(
            &terms[0],
            ConditionExpr::Compare { operator: Operator::Ge, .. }
        ));
        assert!(matches!(
            &terms[1],
            ConditionExpr::Compare { value: CriteriaValue::Single(Value::Null), .. }
        ));
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(parse_rql("=3").is_err());
        assert!(parse_rql("a=between=3").is_err());
        assert!(parse_rql("(a=1").is_err());
        assert!(parse_rql("a=(1,2)").is_err());
    }
}
