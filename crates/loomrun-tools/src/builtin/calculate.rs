use async_trait::async_trait;
use serde_json::Value;

use loomrun_types::EngineError;

use crate::tool::{Tool, ToolCall, ToolOutcome};

/// Evaluates a simple arithmetic expression (`+ - * /` and parentheses over
/// `f64` operands). Used throughout the test suite as the minimal
/// non-yielding tool.
pub struct CalculateTool;

#[async_trait]
impl Tool for CalculateTool {
    fn name(&self) -> &str {
        "calculate"
    }

    fn description(&self) -> &str {
        "Evaluate an arithmetic expression and return the numeric result."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "expression": { "type": "string" }
            },
            "required": ["expression"]
        })
    }

    async fn execute(&self, call: &ToolCall) -> Result<ToolOutcome, EngineError> {
        let expr = call
            .args
            .get("expression")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::ToolFatal {
                message: "missing required field `expression`".into(),
                invocation_id: None,
                call_id: call.id.clone(),
            })?;
        let result = eval(expr).map_err(|message| EngineError::ToolFatal {
            message,
            invocation_id: None,
            call_id: call.id.clone(),
        })?;
        Ok(ToolOutcome::Value(serde_json::json!(result)))
    }
}

/// A small recursive-descent evaluator. No external crate pulls in this
/// exact grammar, so it's hand-rolled rather than pretending a dependency
/// covers it.
fn eval(expr: &str) -> Result<f64, String> {
    let tokens = tokenize(expr)?;
    let mut pos = 0;
    let value = parse_expr(&tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(format!("unexpected trailing input in `{expr}`"));
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(expr: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let slice: String = chars[start..i].iter().collect();
                let n = slice
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number `{slice}`"))?;
                tokens.push(Token::Num(n));
            }
            other => return Err(format!("unexpected character `{other}` in expression")),
        }
    }
    Ok(tokens)
}

fn parse_expr(tokens: &[Token], pos: &mut usize) -> Result<f64, String> {
    let mut value = parse_term(tokens, pos)?;
    loop {
        match tokens.get(*pos) {
            Some(Token::Plus) => {
                *pos += 1;
                value += parse_term(tokens, pos)?;
            }
            Some(Token::Minus) => {
                *pos += 1;
                value -= parse_term(tokens, pos)?;
            }
            _ => break,
        }
    }
    Ok(value)
}

fn parse_term(tokens: &[Token], pos: &mut usize) -> Result<f64, String> {
    let mut value = parse_factor(tokens, pos)?;
    loop {
        match tokens.get(*pos) {
            Some(Token::Star) => {
                *pos += 1;
                value *= parse_factor(tokens, pos)?;
            }
            Some(Token::Slash) => {
                *pos += 1;
                let rhs = parse_factor(tokens, pos)?;
                if rhs == 0.0 {
                    return Err("division by zero".into());
                }
                value /= rhs;
            }
            _ => break,
        }
    }
    Ok(value)
}

fn parse_factor(tokens: &[Token], pos: &mut usize) -> Result<f64, String> {
    match tokens.get(*pos) {
        Some(Token::Num(n)) => {
            *pos += 1;
            Ok(*n)
        }
        Some(Token::Minus) => {
            *pos += 1;
            Ok(-parse_factor(tokens, pos)?)
        }
        Some(Token::LParen) => {
            *pos += 1;
            let value = parse_expr(tokens, pos)?;
            match tokens.get(*pos) {
                Some(Token::RParen) => {
                    *pos += 1;
                    Ok(value)
                }
                _ => Err("expected closing parenthesis".into()),
            }
        }
        _ => Err("expected a number".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluates_division() {
        assert_eq!(eval("134/4").unwrap(), 33.5);
    }

    #[test]
    fn evaluates_precedence() {
        assert_eq!(eval("2 + 3 * 4").unwrap(), 14.0);
    }

    #[test]
    fn evaluates_parentheses() {
        assert_eq!(eval("(2 + 3) * 4").unwrap(), 20.0);
    }

    #[test]
    fn rejects_division_by_zero() {
        assert!(eval("1/0").is_err());
    }

    #[tokio::test]
    async fn execute_returns_numeric_result() {
        let call = ToolCall {
            id: "c1".into(),
            name: "calculate".into(),
            args: serde_json::json!({"expression": "134/4"}),
        };
        let result = CalculateTool.execute(&call).await.unwrap();
        assert!(matches!(result, ToolOutcome::Value(v) if v == serde_json::json!(33.5)));
    }

    #[tokio::test]
    async fn execute_rejects_missing_expression() {
        let call = ToolCall {
            id: "c1".into(),
            name: "calculate".into(),
            args: serde_json::json!({}),
        };
        assert!(CalculateTool.execute(&call).await.is_err());
    }
}
