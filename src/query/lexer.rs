//! Tokenizer for one logical line of query source (§4.D). Indentation is
//! handled by the caller (`parser::split_lines`); this module only turns a
//! line's text into a flat token stream.

use crate::errors::{Error, Result};
use crate::value::Val;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Number(Val),
    Str(String),
    Symbol(String),
}

pub fn tokenize(line: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = line.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '#' {
            break; // line comment
        }
        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            let mut is_float = false;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                if chars[i] == '.' {
                    is_float = true;
                }
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            if is_float {
                let v: f64 = text
                    .parse()
                    .map_err(|_| Error::QueryCompile(format!("bad number literal {text}")))?;
                tokens.push(Token::Number(Val::Double(v.into())));
            } else {
                let v: i64 = text
                    .parse()
                    .map_err(|_| Error::QueryCompile(format!("bad number literal {text}")))?;
                tokens.push(Token::Number(Val::Int(v)));
            }
            continue;
        }
        if c == '"' {
            let start = i;
            i += 1;
            while i < chars.len() && chars[i] != '"' {
                i += 1;
            }
            if i >= chars.len() {
                return Err(Error::QueryCompile("unterminated string literal".into()));
            }
            let text: String = chars[start + 1..i].iter().collect();
            i += 1;
            tokens.push(Token::Str(text));
            continue;
        }
        // two-character operators
        if i + 1 < chars.len() {
            let two: String = chars[i..i + 2].iter().collect();
            if ["==", "!=", "<=", ">="].contains(&two.as_str()) {
                tokens.push(Token::Symbol(two));
                i += 2;
                continue;
            }
        }
        if "()=,:<>+-*/".contains(c) {
            tokens.push(Token::Symbol(c.to_string()));
            i += 1;
            continue;
        }
        return Err(Error::QueryCompile(format!("unexpected character {c:?}")));
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_comparison() {
        let tokens = tokenize("country == \"us\"").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("country".into()),
                Token::Symbol("==".into()),
                Token::Str("us".into()),
            ]
        );
    }

    #[test]
    fn ignores_comments_and_trailing_colon() {
        let tokens = tokenize("if x > 1:  # comment").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("if".into()),
                Token::Ident("x".into()),
                Token::Symbol(">".into()),
                Token::Number(Val::Int(1)),
                Token::Symbol(":".into()),
            ]
        );
    }
}
