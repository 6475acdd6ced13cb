//! Hard post-generation validator for model-written SQL. Works on the parsed
//! statement, not on substrings, so a write keyword inside a string literal
//! does not trip it and a real write clause cannot hide from it.

use std::collections::HashSet;

use sqlparser::ast::{
    Expr, FunctionArg, FunctionArgExpr, GroupByExpr, Join, JoinConstraint, JoinOperator, Query,
    Select, SelectItem, SetExpr, Statement, TableFactor, Value,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use tracing::warn;

use crate::error::PipelineError;
use crate::pipeline::types::StructuredQuery;

/// What a generated statement may touch, plus the row cap appended to every
/// statement. Immutable once built.
#[derive(Debug, Clone)]
pub struct GuardPolicy {
    pub allowed_tables: Vec<String>,
    pub allowed_columns: Vec<String>,
    pub row_cap: u64,
}

impl GuardPolicy {
    /// Policy for the product catalog schema.
    pub fn catalog(row_cap: u64) -> Self {
        Self {
            allowed_tables: vec!["products".to_string()],
            allowed_columns: [
                "item_id",
                "title",
                "description",
                "price",
                "rating",
                "rating_count",
                "category",
            ]
            .iter()
            .map(|s| (*s).to_string())
            .collect(),
            row_cap,
        }
    }
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self::catalog(50)
    }
}

fn reject(reason: impl Into<String>) -> PipelineError {
    PipelineError::UnsafeQuery {
        reason: reason.into(),
    }
}

/// Validate a raw model statement and return it with the row cap enforced.
/// A statement that fails here is never executed.
pub fn guard(raw_sql: &str, policy: &GuardPolicy) -> Result<StructuredQuery, PipelineError> {
    match validate(raw_sql, policy) {
        Ok(query) => Ok(query),
        Err(error) => {
            if let PipelineError::UnsafeQuery { ref reason } = error {
                warn!(sql = raw_sql.trim(), reason, "guard rejected generated statement");
            }
            Err(error)
        }
    }
}

fn validate(raw_sql: &str, policy: &GuardPolicy) -> Result<StructuredQuery, PipelineError> {
    let dialect = GenericDialect {};
    let mut statements = Parser::parse_sql(&dialect, raw_sql)
        .map_err(|e| reject(format!("statement does not parse: {e}")))?;

    if statements.len() != 1 {
        return Err(reject(format!(
            "expected exactly one statement, found {}",
            statements.len()
        )));
    }

    let Statement::Query(mut query) = statements.remove(0) else {
        return Err(reject("only SELECT statements are allowed"));
    };

    let mut aliases = HashSet::new();
    validate_query(&query, policy, &mut aliases)?;
    enforce_row_cap(&mut query, policy.row_cap)?;

    Ok(StructuredQuery {
        sql: query.to_string(),
        params: Vec::new(),
    })
}

fn validate_query(
    query: &Query,
    policy: &GuardPolicy,
    aliases: &mut HashSet<String>,
) -> Result<(), PipelineError> {
    if query.with.is_some() {
        return Err(reject("WITH clauses are not allowed"));
    }
    if query.offset.is_some() || query.fetch.is_some() {
        return Err(reject("OFFSET and FETCH clauses are not allowed"));
    }
    if !query.limit_by.is_empty() {
        return Err(reject("LIMIT BY clauses are not allowed"));
    }
    if !query.locks.is_empty() {
        return Err(reject("locking clauses are not allowed"));
    }
    validate_set_expr(&query.body, policy, aliases)?;
    for order in &query.order_by {
        validate_expr(&order.expr, policy, aliases)?;
    }
    if let Some(limit) = &query.limit {
        if !matches!(limit, Expr::Value(Value::Number(_, _))) {
            return Err(reject("LIMIT must be a numeric literal"));
        }
    }
    Ok(())
}

fn validate_set_expr(
    body: &SetExpr,
    policy: &GuardPolicy,
    aliases: &mut HashSet<String>,
) -> Result<(), PipelineError> {
    match body {
        SetExpr::Select(select) => validate_select(select, policy, aliases),
        SetExpr::Query(query) => validate_query(query, policy, aliases),
        SetExpr::SetOperation { left, right, .. } => {
            validate_set_expr(left, policy, aliases)?;
            validate_set_expr(right, policy, aliases)
        }
        _ => Err(reject("unsupported query body")),
    }
}

fn validate_select(
    select: &Select,
    policy: &GuardPolicy,
    aliases: &mut HashSet<String>,
) -> Result<(), PipelineError> {
    if select.into.is_some() {
        return Err(reject("SELECT INTO is not allowed"));
    }

    for table in &select.from {
        validate_table_factor(&table.relation, policy, aliases)?;
        for join in &table.joins {
            validate_join(join, policy, aliases)?;
        }
    }

    for item in &select.projection {
        match item {
            SelectItem::UnnamedExpr(expr) => validate_expr(expr, policy, aliases)?,
            SelectItem::ExprWithAlias { expr, alias } => {
                validate_expr(expr, policy, aliases)?;
                aliases.insert(alias.value.to_lowercase());
            }
            SelectItem::Wildcard(_) => {}
            SelectItem::QualifiedWildcard(name, _) => {
                for part in &name.0 {
                    check_qualifier(&part.value, policy, aliases)?;
                }
            }
        }
    }

    if let Some(selection) = &select.selection {
        validate_expr(selection, policy, aliases)?;
    }
    if let GroupByExpr::Expressions(exprs) = &select.group_by {
        for expr in exprs {
            validate_expr(expr, policy, aliases)?;
        }
    }
    for expr in &select.sort_by {
        validate_expr(expr, policy, aliases)?;
    }
    if let Some(having) = &select.having {
        validate_expr(having, policy, aliases)?;
    }
    Ok(())
}

fn validate_join(
    join: &Join,
    policy: &GuardPolicy,
    aliases: &mut HashSet<String>,
) -> Result<(), PipelineError> {
    validate_table_factor(&join.relation, policy, aliases)?;
    let constraint = match &join.join_operator {
        JoinOperator::Inner(c)
        | JoinOperator::LeftOuter(c)
        | JoinOperator::RightOuter(c)
        | JoinOperator::FullOuter(c) => Some(c),
        JoinOperator::CrossJoin => None,
        _ => return Err(reject("unsupported join type")),
    };
    if let Some(JoinConstraint::On(expr)) = constraint {
        validate_expr(expr, policy, aliases)?;
    }
    Ok(())
}

fn validate_table_factor(
    factor: &TableFactor,
    policy: &GuardPolicy,
    aliases: &mut HashSet<String>,
) -> Result<(), PipelineError> {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            let table = name
                .0
                .last()
                .map(|ident| ident.value.to_lowercase())
                .unwrap_or_default();
            if !policy.allowed_tables.iter().any(|t| *t == table) {
                return Err(reject(format!("table '{table}' is not on the allow-list")));
            }
            if let Some(alias) = alias {
                aliases.insert(alias.name.value.to_lowercase());
            }
            Ok(())
        }
        TableFactor::Derived {
            subquery, alias, ..
        } => {
            validate_query(subquery, policy, aliases)?;
            if let Some(alias) = alias {
                aliases.insert(alias.name.value.to_lowercase());
            }
            Ok(())
        }
        _ => Err(reject("unsupported table expression")),
    }
}

fn check_column(
    name: &str,
    policy: &GuardPolicy,
    aliases: &HashSet<String>,
) -> Result<(), PipelineError> {
    let name = name.to_lowercase();
    if policy.allowed_columns.iter().any(|c| *c == name) || aliases.contains(&name) {
        Ok(())
    } else {
        Err(reject(format!("column '{name}' is not on the allow-list")))
    }
}

fn check_qualifier(
    name: &str,
    policy: &GuardPolicy,
    aliases: &HashSet<String>,
) -> Result<(), PipelineError> {
    let name = name.to_lowercase();
    if policy.allowed_tables.iter().any(|t| *t == name) || aliases.contains(&name) {
        Ok(())
    } else {
        Err(reject(format!(
            "table qualifier '{name}' is not on the allow-list"
        )))
    }
}

fn validate_expr(
    expr: &Expr,
    policy: &GuardPolicy,
    aliases: &HashSet<String>,
) -> Result<(), PipelineError> {
    match expr {
        Expr::Identifier(ident) => check_column(&ident.value, policy, aliases),
        Expr::CompoundIdentifier(parts) => {
            let (column, qualifiers) = parts.split_last().ok_or_else(|| reject("empty identifier"))?;
            for qualifier in qualifiers {
                check_qualifier(&qualifier.value, policy, aliases)?;
            }
            check_column(&column.value, policy, aliases)
        }
        Expr::Value(_) => Ok(()),
        Expr::BinaryOp { left, right, .. } => {
            validate_expr(left, policy, aliases)?;
            validate_expr(right, policy, aliases)
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => validate_expr(expr, policy, aliases),
        Expr::IsNull(expr)
        | Expr::IsNotNull(expr)
        | Expr::IsTrue(expr)
        | Expr::IsNotTrue(expr)
        | Expr::IsFalse(expr)
        | Expr::IsNotFalse(expr) => validate_expr(expr, policy, aliases),
        Expr::Between {
            expr, low, high, ..
        } => {
            validate_expr(expr, policy, aliases)?;
            validate_expr(low, policy, aliases)?;
            validate_expr(high, policy, aliases)
        }
        Expr::InList { expr, list, .. } => {
            validate_expr(expr, policy, aliases)?;
            for item in list {
                validate_expr(item, policy, aliases)?;
            }
            Ok(())
        }
        Expr::InSubquery { expr, subquery, .. } => {
            validate_expr(expr, policy, aliases)?;
            let mut nested = aliases.clone();
            validate_query(subquery, policy, &mut nested)
        }
        Expr::Exists { subquery, .. } => {
            let mut nested = aliases.clone();
            validate_query(subquery, policy, &mut nested)
        }
        Expr::Like {
            expr, pattern, ..
        }
        | Expr::ILike {
            expr, pattern, ..
        } => {
            validate_expr(expr, policy, aliases)?;
            validate_expr(pattern, policy, aliases)
        }
        Expr::Cast { expr, .. } => validate_expr(expr, policy, aliases),
        Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            if let Some(operand) = operand {
                validate_expr(operand, policy, aliases)?;
            }
            for expr in conditions.iter().chain(results.iter()) {
                validate_expr(expr, policy, aliases)?;
            }
            if let Some(else_result) = else_result {
                validate_expr(else_result, policy, aliases)?;
            }
            Ok(())
        }
        Expr::Function(function) => {
            for arg in &function.args {
                let arg_expr = match arg {
                    FunctionArg::Named { arg, .. } | FunctionArg::Unnamed(arg) => arg,
                };
                match arg_expr {
                    FunctionArgExpr::Expr(expr) => validate_expr(expr, policy, aliases)?,
                    FunctionArgExpr::Wildcard => {}
                    FunctionArgExpr::QualifiedWildcard(name) => {
                        for part in &name.0 {
                            check_qualifier(&part.value, policy, aliases)?;
                        }
                    }
                }
            }
            Ok(())
        }
        _ => Err(reject("unsupported expression")),
    }
}

fn enforce_row_cap(query: &mut Query, cap: u64) -> Result<(), PipelineError> {
    let capped = Expr::Value(Value::Number(cap.to_string(), false));
    match &query.limit {
        None => query.limit = Some(capped),
        Some(Expr::Value(Value::Number(n, _))) => {
            let requested: u64 = n
                .parse()
                .map_err(|_| reject("LIMIT must be a numeric literal"))?;
            if requested > cap {
                query.limit = Some(capped);
            }
        }
        Some(_) => return Err(reject("LIMIT must be a numeric literal")),
    }
    Ok(())
}
