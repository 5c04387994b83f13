//! `when` condition evaluation.
//!
//! The grammar is the subset step conditions actually use: `==` / `!=`
//! comparisons over bare or quoted operands, joined by `&&` / `||`, with `!`
//! negation and parenthesized groups. Evaluation happens after parameter
//! substitution, so operands are plain text.

use crate::error::OperateError;

/// Evaluates a substituted condition expression.
pub fn eval_when(expression: &str) -> Result<bool, OperateError> {
    let trimmed = expression.trim();
    if trimmed.is_empty() {
        return Ok(true);
    }
    eval_node(trimmed)
}

fn eval_node(expression: &str) -> Result<bool, OperateError> {
    if let Some(parts) = split_top_level(expression, "||") {
        for part in parts {
            if eval_node(part)? {
                return Ok(true);
            }
        }
        return Ok(false);
    }
    if let Some(parts) = split_top_level(expression, "&&") {
        for part in parts {
            if !eval_node(part)? {
                return Ok(false);
            }
        }
        return Ok(true);
    }

    let (negations, inner) = strip_negations(expression);
    let inner = inner.trim();
    if inner.is_empty() {
        return Err(invalid(expression, "dangling negation"));
    }

    let value = if inner.starts_with('(') && inner.ends_with(')') {
        eval_node(&inner[1..inner.len() - 1])?
    } else if let Some(index) = find_operator(inner, "!=") {
        let left = unquote(inner[..index].trim());
        let right = unquote(inner[index + 2..].trim());
        left != right
    } else if let Some(index) = find_operator(inner, "==") {
        let left = unquote(inner[..index].trim());
        let right = unquote(inner[index + 2..].trim());
        left == right
    } else {
        match unquote(inner).to_ascii_lowercase().as_str() {
            "true" => true,
            "false" => false,
            _ => return Err(invalid(expression, "expected a comparison or boolean")),
        }
    };

    Ok(if negations % 2 == 1 { !value } else { value })
}

fn invalid(expression: &str, reason: &str) -> OperateError {
    OperateError::Validation(format!("invalid condition {expression:?}: {reason}"))
}

fn strip_negations(expression: &str) -> (usize, &str) {
    let mut rest = expression.trim();
    let mut count = 0;
    while let Some(stripped) = rest.strip_prefix('!') {
        // `!=` belongs to the comparison, not to negation
        if stripped.starts_with('=') {
            break;
        }
        count += 1;
        rest = stripped.trim_start();
    }
    (count, rest)
}

/// Splits on an operator at paren-and-quote depth zero; None when absent.
fn split_top_level<'a>(expression: &'a str, operator: &str) -> Option<Vec<&'a str>> {
    let bytes = expression.as_bytes();
    let op = operator.as_bytes();
    let mut depth = 0usize;
    let mut in_quote: Option<u8> = None;
    let mut parts = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        let b = bytes[i];
        match in_quote {
            Some(quote) => {
                if b == quote {
                    in_quote = None;
                }
            }
            None => match b {
                b'\'' | b'"' => in_quote = Some(b),
                b'(' => depth += 1,
                b')' => depth = depth.saturating_sub(1),
                _ if depth == 0 && bytes[i..].starts_with(op) => {
                    parts.push(&expression[start..i]);
                    i += op.len();
                    start = i;
                    continue;
                }
                _ => {}
            },
        }
        i += 1;
    }
    if parts.is_empty() {
        return None;
    }
    parts.push(&expression[start..]);
    Some(parts)
}

fn find_operator(expression: &str, operator: &str) -> Option<usize> {
    let bytes = expression.as_bytes();
    let op = operator.as_bytes();
    let mut depth = 0usize;
    let mut in_quote: Option<u8> = None;
    let mut i = 0usize;
    while i < bytes.len() {
        let b = bytes[i];
        match in_quote {
            Some(quote) => {
                if b == quote {
                    in_quote = None;
                }
            }
            None => match b {
                b'\'' | b'"' => in_quote = Some(b),
                b'(' => depth += 1,
                b')' => depth = depth.saturating_sub(1),
                _ if depth == 0 && bytes[i..].starts_with(op) => return Some(i),
                _ => {}
            },
        }
        i += 1;
    }
    None
}

fn unquote(operand: &str) -> &str {
    let trimmed = operand.trim();
    for quote in ['\'', '"'] {
        if trimmed.len() >= 2 && trimmed.starts_with(quote) && trimmed.ends_with(quote) {
            return &trimmed[1..trimmed.len() - 1];
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_over_bare_and_quoted_operands() {
        assert!(eval_when("yes == yes").expect("eval"));
        assert!(eval_when("'a b' == \"a b\"").expect("eval"));
        assert!(!eval_when("yes == no").expect("eval"));
        assert!(eval_when("yes != no").expect("eval"));
    }

    #[test]
    fn conjunction_disjunction_and_negation() {
        assert!(eval_when("a == a && b == b").expect("eval"));
        assert!(!eval_when("a == a && b == c").expect("eval"));
        assert!(eval_when("a == b || b == b").expect("eval"));
        assert!(eval_when("!(a == b)").expect("eval"));
        assert!(eval_when("!false").expect("eval"));
    }

    #[test]
    fn quoted_operators_are_not_split_points() {
        assert!(eval_when("'x && y' == 'x && y'").expect("eval"));
        assert!(eval_when("'a == b' != 'a'").expect("eval"));
    }

    #[test]
    fn empty_condition_is_true_and_garbage_errors() {
        assert!(eval_when("  ").expect("eval"));
        assert!(eval_when("definitely not boolean").is_err());
    }
}
