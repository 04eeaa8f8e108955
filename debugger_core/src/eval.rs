//! Arithmetic over literals and registers, for address arguments
//!
//! Supports hex (0x-prefixed) and decimal literals, register names, and
//! `+` / `-` / `*` with the usual precedence. No parentheses.

use crate::error::{DebugError, Result};
use crate::registers::RegisterContext;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(u64),
    Plus,
    Minus,
    Star,
}

fn lex(text: &str, ctx: &RegisterContext) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            c if c.is_ascii_alphanumeric() => {
                let mut end = start;
                while let Some(&(i, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() {
                        end = i + c.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let word = &text[start..end];
                tokens.push(Token::Number(parse_word(word, ctx)?));
            }
            _ => return Err(DebugError::Parse(format!("unexpected character {:?}", c))),
        }
    }

    Ok(tokens)
}

fn parse_word(word: &str, ctx: &RegisterContext) -> Result<u64> {
    if let Some(hex) = word.strip_prefix("0x").or_else(|| word.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16)
            .map_err(|_| DebugError::Parse(format!("bad hex literal {}", word)));
    }
    if word.chars().all(|c| c.is_ascii_digit()) {
        return word
            .parse::<u64>()
            .map_err(|_| DebugError::Parse(format!("bad literal {}", word)));
    }
    ctx.by_name(word)
        .ok_or_else(|| DebugError::Parse(format!("unknown register {}", word)))
}

/// Parse a bare integer literal, hex with `0x` prefix or decimal
pub fn parse_int(text: &str) -> Result<u64> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16)
            .map_err(|_| DebugError::Parse(format!("bad literal {}", text)));
    }
    text.parse::<u64>()
        .map_err(|_| DebugError::Parse(format!("bad literal {}", text)))
}

/// Evaluate `text` against the current register context
pub fn eval(text: &str, ctx: &RegisterContext) -> Result<u64> {
    let tokens = lex(text, ctx)?;
    if tokens.is_empty() {
        return Err(DebugError::Parse("empty expression".to_string()));
    }
    let mut pos = 0;
    let value = parse_sum(&tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(DebugError::Parse(format!("trailing input in {:?}", text)));
    }
    Ok(value)
}

fn parse_sum(tokens: &[Token], pos: &mut usize) -> Result<u64> {
    let mut acc = parse_product(tokens, pos)?;
    while let Some(op) = tokens.get(*pos) {
        match op {
            Token::Plus => {
                *pos += 1;
                acc = acc.wrapping_add(parse_product(tokens, pos)?);
            }
            Token::Minus => {
                *pos += 1;
                acc = acc.wrapping_sub(parse_product(tokens, pos)?);
            }
            _ => break,
        }
    }
    Ok(acc)
}

fn parse_product(tokens: &[Token], pos: &mut usize) -> Result<u64> {
    let mut acc = parse_atom(tokens, pos)?;
    while let Some(Token::Star) = tokens.get(*pos) {
        *pos += 1;
        acc = acc.wrapping_mul(parse_atom(tokens, pos)?);
    }
    Ok(acc)
}

fn parse_atom(tokens: &[Token], pos: &mut usize) -> Result<u64> {
    match tokens.get(*pos) {
        Some(Token::Number(n)) => {
            *pos += 1;
            Ok(*n)
        }
        _ => Err(DebugError::Parse("expected a value".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::eval;
    use crate::registers::RegisterContext;

    fn context() -> RegisterContext {
        let mut ctx = RegisterContext::default();
        ctx.regs.regs[0] = 0x1000;
        ctx.regs.regs[8] = 8;
        ctx.regs.pc = 0x70000000;
        ctx
    }

    #[test]
    pub fn when_eval_literals_then_value_matches() {
        let ctx = context();
        assert_eq!(eval("0x1234", &ctx).unwrap(), 0x1234);
        assert_eq!(eval("1234", &ctx).unwrap(), 1234);
    }

    #[test]
    pub fn when_eval_register_expression_then_value_matches() {
        let ctx = context();
        assert_eq!(eval("x0", &ctx).unwrap(), 0x1000);
        assert_eq!(eval("x0+0x10", &ctx).unwrap(), 0x1010);
        assert_eq!(eval("pc - 4", &ctx).unwrap(), 0x6ffffffc);
    }

    #[test]
    pub fn when_eval_products_then_precedence_is_respected() {
        let ctx = context();
        assert_eq!(eval("x8*8+4", &ctx).unwrap(), 68);
        assert_eq!(eval("4+x8*8", &ctx).unwrap(), 68);
    }

    #[test]
    pub fn when_eval_bad_input_then_parse_error() {
        let ctx = context();
        assert!(eval("", &ctx).is_err());
        assert!(eval("0x", &ctx).is_err());
        assert!(eval("libfoo.so", &ctx).is_err());
        assert!(eval("x99", &ctx).is_err());
        assert!(eval("1 +", &ctx).is_err());
    }
}
