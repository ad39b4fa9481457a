//! Splits template text into literal text and tokenized actions

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// `.Name` (one link of a field chain)
    Field(String),
    /// `.` on its own
    Dot,
    /// `$name`, or `$` for the root data
    Variable(String),
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    LParen,
    RParen,
    Pipe,
    Declare,
    Assign,
    Comma,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    /// Whitespace separated this token from the previous one
    pub space_before: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Text(String),
    Action(Vec<Spanned>),
}

const LEFT: &str = "{{";
const RIGHT: &str = "}}";

/// Splits the template into text and actions, honoring `{{-`/`-}}` trim markers and comments
pub fn lex(text: &str) -> Result<Vec<Item>, String> {
    let mut items = Vec::new();
    let mut rest = text;
    let mut trim_next = false;

    while let Some(open) = rest.find(LEFT) {
        let mut literal = &rest[..open];
        if trim_next {
            literal = literal.trim_start();
        }
        let after = &rest[open + LEFT.len()..];
        let (trim_left, body_start) = match after.strip_prefix('-') {
            Some(stripped) if stripped.starts_with(char::is_whitespace) => (true, stripped),
            _ => (false, after),
        };
        if trim_left {
            literal = literal.trim_end();
        }
        if !literal.is_empty() {
            items.push(Item::Text(literal.to_string()));
        }

        let close = find_action_end(body_start).ok_or_else(|| "unclosed action".to_string())?;
        let mut body = &body_start[..close];
        trim_next = false;
        if let Some(stripped) = body.strip_suffix('-') {
            if stripped.ends_with(char::is_whitespace) {
                body = stripped;
                trim_next = true;
            }
        }

        let trimmed = body.trim();
        if trimmed.starts_with("/*") {
            if !trimmed.ends_with("*/") {
                return Err("unclosed comment".to_string());
            }
        } else {
            items.push(Item::Action(tokenize(body)?));
        }
        rest = &body_start[close + RIGHT.len()..];
    }

    let literal = if trim_next { rest.trim_start() } else { rest };
    if !literal.is_empty() {
        items.push(Item::Text(literal.to_string()));
    }
    Ok(items)
}

/// Position of the closing delimiter, skipping quoted text
fn find_action_end(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut i = 0;
    let mut in_comment = false;
    while i < bytes.len() {
        if in_comment {
            if bytes[i..].starts_with(b"*/") {
                in_comment = false;
                i += 2;
            } else {
                i += 1;
            }
            continue;
        }
        match bytes[i] {
            b'/' if bytes[i..].starts_with(b"/*") => {
                in_comment = true;
                i += 2;
            }
            b'"' | b'\'' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'`' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'`' {
                    i += 1;
                }
                i += 1;
            }
            b'}' if bytes[i..].starts_with(RIGHT.as_bytes()) => return Some(i),
            _ => i += 1,
        }
    }
    None
}

fn tokenize(body: &str) -> Result<Vec<Spanned>, String> {
    let chars: Vec<char> = body.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let mut space_before = false;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            space_before = true;
            i += 1;
            continue;
        }

        let token = match c {
            '(' => {
                i += 1;
                Token::LParen
            }
            ')' => {
                i += 1;
                Token::RParen
            }
            '|' => {
                i += 1;
                Token::Pipe
            }
            ',' => {
                i += 1;
                Token::Comma
            }
            ':' if chars.get(i + 1) == Some(&'=') => {
                i += 2;
                Token::Declare
            }
            '=' => {
                i += 1;
                Token::Assign
            }
            '"' => Token::Str(quoted(&chars, &mut i)?),
            '`' => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&c| c == '`')
                    .ok_or_else(|| "unterminated raw quoted string".to_string())?;
                i = start + end + 1;
                Token::Str(chars[start..start + end].iter().collect())
            }
            '\'' => {
                let ch = *chars.get(i + 1).ok_or_else(|| "unterminated character constant".to_string())?;
                if chars.get(i + 2) != Some(&'\'') {
                    return Err("unterminated character constant".to_string());
                }
                i += 3;
                Token::Int(i64::from(u32::from(ch)))
            }
            '$' => {
                i += 1;
                Token::Variable(identifier(&chars, &mut i))
            }
            '.' if chars.get(i + 1).is_some_and(char::is_ascii_digit) => number(&chars, &mut i)?,
            '.' => {
                i += 1;
                let name = identifier(&chars, &mut i);
                if name.is_empty() {
                    Token::Dot
                } else {
                    Token::Field(name)
                }
            }
            '-' | '+' | '0'..='9' => number(&chars, &mut i)?,
            c if c.is_alphabetic() || c == '_' => Token::Ident(identifier(&chars, &mut i)),
            c => return Err(format!("unexpected {c:?} in command")),
        };
        tokens.push(Spanned {
            token,
            space_before,
        });
        space_before = false;
    }
    Ok(tokens)
}

fn identifier(chars: &[char], i: &mut usize) -> String {
    let start = *i;
    while *i < chars.len() && (chars[*i].is_alphanumeric() || chars[*i] == '_') {
        *i += 1;
    }
    chars[start..*i].iter().collect()
}

fn quoted(chars: &[char], i: &mut usize) -> Result<String, String> {
    let mut out = String::new();
    *i += 1;
    while let Some(&c) = chars.get(*i) {
        *i += 1;
        match c {
            '"' => return Ok(out),
            '\\' => {
                let escaped = chars
                    .get(*i)
                    .ok_or_else(|| "unterminated quoted string".to_string())?;
                *i += 1;
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    '0' => '\0',
                    other => *other,
                });
            }
            c => out.push(c),
        }
    }
    Err("unterminated quoted string".to_string())
}

fn number(chars: &[char], i: &mut usize) -> Result<Token, String> {
    let start = *i;
    if matches!(chars[*i], '-' | '+') {
        *i += 1;
    }
    while *i < chars.len()
        && (chars[*i].is_ascii_alphanumeric()
            || chars[*i] == '.'
            || chars[*i] == '_'
            || (matches!(chars[*i], '-' | '+') && matches!(chars[*i - 1], 'e' | 'E')))
    {
        *i += 1;
    }
    let text: String = chars[start..*i].iter().filter(|&&c| c != '_').collect();
    let unsigned = text.trim_start_matches(['-', '+']);
    let negative = text.starts_with('-');

    if let Some(hex) = unsigned.strip_prefix("0x").or_else(|| unsigned.strip_prefix("0X")) {
        let v = i64::from_str_radix(hex, 16).map_err(|_| format!("bad number syntax: {text:?}"))?;
        return Ok(Token::Int(if negative { -v } else { v }));
    }
    if let Ok(v) = text.parse::<i64>() {
        return Ok(Token::Int(v));
    }
    text.parse::<f64>()
        .map(Token::Float)
        .map_err(|_| format!("bad number syntax: {text:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(body: &str) -> Vec<Token> {
        tokenize(body).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn test_lex_text_and_actions() {
        let items = lex("a {{ .X }} b").unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0], Item::Text("a ".into()));
        assert_eq!(items[2], Item::Text(" b".into()));
    }

    #[test]
    fn test_trim_markers() {
        let items = lex("a  {{- .X -}}  b").unwrap();
        assert_eq!(items[0], Item::Text("a".into()));
        assert_eq!(items[2], Item::Text("b".into()));
    }

    #[test]
    fn test_comments_are_dropped() {
        let items = lex("a{{/* hidden }} */}}b").unwrap();
        assert_eq!(items, vec![Item::Text("a".into()), Item::Text("b".into())]);
    }

    #[test]
    fn test_tokens() {
        assert_eq!(
            tokens(r#"$x := percent .Values.cpu 80 | quote "a\"b""#),
            vec![
                Token::Variable("x".into()),
                Token::Declare,
                Token::Ident("percent".into()),
                Token::Field("Values".into()),
                Token::Field("cpu".into()),
                Token::Int(80),
                Token::Pipe,
                Token::Ident("quote".into()),
                Token::Str("a\"b".into()),
            ]
        );
        assert_eq!(tokens("-1.5 0x10 1e3"), vec![Token::Float(-1.5), Token::Int(16), Token::Float(1000.0)]);
    }

    #[test]
    fn test_braces_inside_strings() {
        let items = lex(r#"{{ "}}" }}"#).unwrap();
        assert_eq!(items, vec![Item::Action(vec![Spanned { token: Token::Str("}}".into()), space_before: true }])]);
    }

    #[test]
    fn test_unclosed_action() {
        assert!(lex("{{ .X").is_err());
    }
}
