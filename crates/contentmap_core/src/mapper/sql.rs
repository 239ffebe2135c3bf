//! SQL statement model.
//!
//! # Responsibility
//! - Quote identifiers and render SELECT statements from structured parts.
//! - Keep every literal value in the bind list, never in SQL text.
//!
//! # Invariants
//! - Identifiers are backtick-quoted with embedded backticks doubled.
//! - Joins are unique per alias; adding an alias twice keeps the first join.

use rusqlite::types::Value as SqlValue;

/// Quotes an identifier with backticks.
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Renders `` `table`.`column` ``.
pub fn qualify(table_or_alias: &str, column: &str) -> String {
    format!("{}.{}", quote_ident(table_or_alias), quote_ident(column))
}

/// Renders `` column IN (?, ?) `` or a false predicate for an empty list.
pub fn in_clause(column_sql: &str, count: usize) -> String {
    if count == 0 {
        return "1 = 0".to_string();
    }
    format!("{column_sql} IN ({})", placeholders(count))
}

pub fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// SQL text plus positional bind values.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl SqlStatement {
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub table: String,
    pub alias: String,
    /// Rendered ON predicate.
    pub on: String,
}

impl Join {
    fn render(&self) -> String {
        let keyword = match self.kind {
            JoinKind::Inner => "INNER JOIN",
            JoinKind::Left => "LEFT JOIN",
        };
        if self.table == self.alias {
            format!("{keyword} {} ON {}", quote_ident(&self.table), self.on)
        } else {
            format!(
                "{keyword} {} AS {} ON {}",
                quote_ident(&self.table),
                quote_ident(&self.alias),
                self.on
            )
        }
    }
}

/// Structured SELECT that query builders extend before rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub table: String,
    pub alias: Option<String>,
    pub distinct: bool,
    pub columns: Vec<String>,
    pub joins: Vec<Join>,
    pub condition: Option<String>,
    pub params: Vec<SqlValue>,
    pub order_by: Vec<String>,
    pub limit: Option<u64>,
    pub offset: u64,
}

impl SelectStatement {
    pub fn new(table: &str, alias: Option<&str>) -> Self {
        Self {
            table: table.to_string(),
            alias: alias.map(str::to_string),
            distinct: false,
            columns: Vec::new(),
            joins: Vec::new(),
            condition: None,
            params: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: 0,
        }
    }

    /// Name used to qualify columns of the primary table.
    pub fn table_alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.table)
    }

    pub fn has_join(&self, alias: &str) -> bool {
        self.joins.iter().any(|join| join.alias == alias)
    }

    pub fn add_join(&mut self, join: Join) {
        if !self.has_join(&join.alias) {
            self.joins.push(join);
        }
    }

    /// AND-appends a predicate, parenthesizing both sides when needed.
    pub fn and_where(&mut self, predicate: String, params: Vec<SqlValue>) {
        if predicate.is_empty() {
            return;
        }
        self.condition = Some(match self.condition.take() {
            Some(existing) => format!("({existing}) AND ({predicate})"),
            None => predicate,
        });
        self.params.extend(params);
    }

    pub fn to_statement(&self) -> SqlStatement {
        let mut sql = self.render_body();
        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order_by.join(", "));
        }
        match (self.limit, self.offset) {
            (Some(limit), 0) => sql.push_str(&format!(" LIMIT {limit}")),
            (Some(limit), offset) => sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
            (None, 0) => {}
            (None, offset) => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
        }
        SqlStatement::new(sql, self.params.clone())
    }

    /// Counts the rows the statement selects, ignoring order and paging.
    pub fn count_statement(&self) -> SqlStatement {
        SqlStatement::new(
            format!(
                "SELECT COUNT(*) FROM ({}) AS count_query",
                self.render_body()
            ),
            self.params.clone(),
        )
    }

    fn render_body(&self) -> String {
        let mut sql = String::from("SELECT ");
        if self.distinct {
            sql.push_str("DISTINCT ");
        }
        sql.push_str(&self.columns.join(", "));
        sql.push_str(" FROM ");
        sql.push_str(&quote_ident(&self.table));
        if let Some(alias) = &self.alias {
            if alias != &self.table {
                sql.push_str(" AS ");
                sql.push_str(&quote_ident(alias));
            }
        }
        for join in &self.joins {
            sql.push(' ');
            sql.push_str(&join.render());
        }
        if let Some(condition) = &self.condition {
            sql.push_str(" WHERE ");
            sql.push_str(condition);
        }
        sql
    }
}

#[cfg(test)]
mod tests {
    use super::{in_clause, quote_ident, Join, JoinKind, SelectStatement};
    use rusqlite::types::Value as SqlValue;

    #[test]
    fn quote_ident_escapes_backticks() {
        assert_eq!(quote_ident("we`ird"), "`we``ird`");
    }

    #[test]
    fn empty_in_clause_matches_nothing() {
        assert_eq!(in_clause("`id`", 0), "1 = 0");
        assert_eq!(in_clause("`id`", 2), "`id` IN (?, ?)");
    }

    #[test]
    fn renders_joins_conditions_and_paging() {
        let mut select = SelectStatement::new("Chapter", Some("c"));
        select.columns.push("`c`.`id` AS `id`".to_string());
        let join = Join {
            kind: JoinKind::Left,
            table: "Author".to_string(),
            alias: "AuthorRef".to_string(),
            on: "`AuthorRef`.`id` = `c`.`fk_author_id`".to_string(),
        };
        select.add_join(join.clone());
        select.add_join(join);
        select.and_where("`c`.`name` = ?".to_string(), vec![SqlValue::Text("a".into())]);
        select.and_where("`c`.`id` > ?".to_string(), vec![SqlValue::Integer(1)]);
        select.order_by.push("`c`.`id` ASC".to_string());
        select.limit = Some(5);
        select.offset = 10;

        let statement = select.to_statement();
        assert_eq!(
            statement.sql,
            "SELECT `c`.`id` AS `id` FROM `Chapter` AS `c` \
             LEFT JOIN `Author` AS `AuthorRef` ON `AuthorRef`.`id` = `c`.`fk_author_id` \
             WHERE (`c`.`name` = ?) AND (`c`.`id` > ?) ORDER BY `c`.`id` ASC LIMIT 5 OFFSET 10"
        );
        assert_eq!(statement.params.len(), 2);

        let count = select.count_statement();
        assert!(count.sql.starts_with("SELECT COUNT(*) FROM (SELECT "));
        assert!(!count.sql.contains("LIMIT"));
    }
}
