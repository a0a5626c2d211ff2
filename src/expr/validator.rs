//! Expression validator: a two-stage safety check over string
//! expressions not authored by the overloaded operators, using small,
//! closed `thiserror` enums for user-input validation in the same style
//! as the rest of the crate's error types.

use thiserror::Error;

pub const ALLOWED_METHODS: &[&str] = &[
    "sum", "prod", "min", "max", "std", "mean", "var", "any", "all", "where",
];

const ALLOWED_ATTRS: &[&str] = &["real", "imag"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid character {0:?} in expression")]
    InvalidCharacter(char),
    #[error("method {0:?} is not in the allow-list")]
    InvalidMethod(String),
    #[error("forbidden syntax: {0}")]
    ForbiddenSyntax(String),
    #[error("unknown operand {0:?}")]
    UnknownOperand(String),
}

fn is_allowed_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || " +-*/%().,=<>!&|~^_".contains(c)
}

/// Stage 1: reject control punctuation, dunder names, and
/// attribute-access patterns outside the allow-list, without building a
/// parse tree.
pub fn validate_stage1(expr: &str) -> Result<(), ValidationError> {
    for c in expr.chars() {
        if matches!(c, ';' | ':' | '[' | ']') {
            return Err(ValidationError::ForbiddenSyntax(format!(
                "disallowed punctuation {c:?}"
            )));
        }
        if !is_allowed_char(c) {
            return Err(ValidationError::InvalidCharacter(c));
        }
    }

    if expr.contains("__") {
        // allow dunder-free numeric literal contexts (e.g. none — "__"
        // never appears in a valid operand/number/function token).
        return Err(ValidationError::ForbiddenSyntax(
            "dunder-style names are forbidden".to_string(),
        ));
    }

    // Attribute access `.name(` or bare `.name` must be in the allow-list,
    // or a numeric-literal-style suffix (`.1e+10`, `.3j`) or `.real`/`.imag`.
    let bytes = expr.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'.' {
            let rest = &expr[i + 1..];
            if rest.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
                // numeric literal continuation, e.g. `.5`
                i += 1;
                continue;
            }
            let name_len = rest
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .count();
            let name = &rest[..name_len];
            if !ALLOWED_METHODS.contains(&name) && !ALLOWED_ATTRS.contains(&name) {
                return Err(ValidationError::InvalidMethod(name.to_string()));
            }
            i += 1 + name_len;
            continue;
        }
        i += 1;
    }

    Ok(())
}

/// Stage 2: parse the expression and collect every identifier used
/// as a *name* (not a function-call target), checking each against the
/// operand map.
pub fn validate_stage2(
    ast: &super::ast::Expr,
    operand_names: &std::collections::HashSet<String>,
) -> Result<(), ValidationError> {
    use super::ast::Expr;
    match ast {
        Expr::Num(_) => Ok(()),
        Expr::Var(name) => {
            if operand_names.contains(name) || name == "_where_x" || name == "_where_y" {
                Ok(())
            } else {
                Err(ValidationError::UnknownOperand(name.clone()))
            }
        }
        Expr::Unary(_, inner) => validate_stage2(inner, operand_names),
        Expr::Binary(_, l, r) => {
            validate_stage2(l, operand_names)?;
            validate_stage2(r, operand_names)
        }
        Expr::Call(name, args) => {
            if !super::eval::KERNEL_FUNCTIONS.contains(name) {
                return Err(ValidationError::InvalidMethod(name.clone()));
            }
            for a in args {
                validate_stage2(a, operand_names)?;
            }
            Ok(())
        }
        Expr::MethodCall(recv, name, args) => {
            if !ALLOWED_METHODS.contains(&name.as_str()) {
                return Err(ValidationError::InvalidMethod(name.clone()));
            }
            validate_stage2(recv, operand_names)?;
            for a in args {
                validate_stage2(a, operand_names)?;
            }
            Ok(())
        }
    }
}

/// Full validation entry point: run both stages over `expr`, returning the
/// parsed AST on success.
pub fn validate(
    expr: &str,
    operand_names: &std::collections::HashSet<String>,
) -> Result<super::ast::Expr, ValidationError> {
    validate_stage1(expr)?;
    let ast = super::ast::parse(expr)
        .map_err(|e| ValidationError::ForbiddenSyntax(e.to_string()))?;
    validate_stage2(&ast, operand_names)?;
    Ok(ast)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_brackets() {
        assert!(matches!(
            validate_stage1("o0[0]"),
            Err(ValidationError::ForbiddenSyntax(_)) | Err(ValidationError::InvalidCharacter(_))
        ));
    }

    #[test]
    fn rejects_dunder() {
        assert!(validate_stage1("o0.__class__").is_err());
    }

    #[test]
    fn allows_allow_listed_methods() {
        assert!(validate_stage1("o0.sum(axis=0)").is_ok());
        assert!(validate_stage1("o0.where(o1,o2)").is_ok());
    }

    #[test]
    fn rejects_non_allow_listed_methods() {
        assert!(validate_stage1("o0.tolist()").is_err());
    }

    #[test]
    fn allows_real_imag_attrs() {
        assert!(validate_stage1("o0.real + o1.imag").is_ok());
    }
}
