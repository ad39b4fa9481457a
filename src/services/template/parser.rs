//! Builds the template tree from lexed items

use super::lexer::{lex, Item, Spanned, Token};
use super::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Text(String),
    Action(Pipeline),
    If {
        branches: Vec<(Pipeline, Vec<Node>)>,
        otherwise: Vec<Node>,
    },
    Range {
        pipe: Pipeline,
        body: Vec<Node>,
        otherwise: Vec<Node>,
    },
    With {
        pipe: Pipeline,
        body: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pipeline {
    /// Variables declared (or assigned) by the pipeline
    pub decl: Vec<String>,
    /// `=` rather than `:=`
    pub assign: bool,
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub args: Vec<Arg>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Dot,
    Field(Vec<String>),
    Variable(String, Vec<String>),
    Function(String),
    Literal(Value),
    Sub(Box<Pipeline>, Vec<String>),
}

enum Terminator {
    End,
    Else(Vec<Spanned>),
    Eof,
}

/// Parses template text, rejecting calls to functions `is_defined` does not know
pub fn parse(text: &str, is_defined: &dyn Fn(&str) -> bool) -> Result<Vec<Node>, String> {
    let mut parser = Parser {
        items: lex(text)?,
        pos: 0,
        is_defined,
    };
    let (nodes, terminator) = parser.parse_list()?;
    match terminator {
        Terminator::Eof => Ok(nodes),
        Terminator::End => Err("unexpected {{end}}".to_string()),
        Terminator::Else(_) => Err("unexpected {{else}}".to_string()),
    }
}

struct Parser<'a> {
    items: Vec<Item>,
    pos: usize,
    is_defined: &'a dyn Fn(&str) -> bool,
}

impl Parser<'_> {
    fn parse_list(&mut self) -> Result<(Vec<Node>, Terminator), String> {
        let mut nodes = Vec::new();
        while self.pos < self.items.len() {
            let item = self.items[self.pos].clone();
            self.pos += 1;
            let tokens = match item {
                Item::Text(text) => {
                    nodes.push(Node::Text(text));
                    continue;
                }
                Item::Action(tokens) => tokens,
            };

            let keyword = match tokens.first().map(|t| &t.token) {
                Some(Token::Ident(word)) => word.as_str(),
                None => return Err("missing value for command".to_string()),
                _ => "",
            };
            match keyword {
                "end" => {
                    if tokens.len() > 1 {
                        return Err("unexpected tokens after end".to_string());
                    }
                    return Ok((nodes, Terminator::End));
                }
                "else" => return Ok((nodes, Terminator::Else(tokens[1..].to_vec()))),
                "if" => nodes.push(self.parse_if(&tokens[1..])?),
                "with" => nodes.push(self.parse_with(&tokens[1..])?),
                "range" => nodes.push(self.parse_range(&tokens[1..])?),
                "define" | "template" | "block" | "break" | "continue" => {
                    return Err(format!("{keyword} is not supported"));
                }
                _ => nodes.push(Node::Action(self.parse_pipeline(&tokens)?)),
            }
        }
        Ok((nodes, Terminator::Eof))
    }

    fn parse_if(&mut self, tokens: &[Spanned]) -> Result<Node, String> {
        let pipe = self.parse_pipeline(tokens)?;
        let (body, terminator) = self.parse_list()?;
        let otherwise = self.parse_else("if", terminator, |p, rest| p.parse_if(rest))?;
        Ok(Node::If {
            branches: vec![(pipe, body)],
            otherwise,
        })
    }

    fn parse_with(&mut self, tokens: &[Spanned]) -> Result<Node, String> {
        let pipe = self.parse_pipeline(tokens)?;
        let (body, terminator) = self.parse_list()?;
        let otherwise = self.parse_else("with", terminator, |p, rest| p.parse_with(rest))?;
        Ok(Node::With {
            pipe,
            body,
            otherwise,
        })
    }

    fn parse_range(&mut self, tokens: &[Spanned]) -> Result<Node, String> {
        let pipe = self.parse_pipeline(tokens)?;
        if pipe.decl.len() > 2 {
            return Err("too many declarations in range".to_string());
        }
        let (body, terminator) = self.parse_list()?;
        let otherwise = match terminator {
            Terminator::End => Vec::new(),
            Terminator::Else(rest) if rest.is_empty() => self.expect_end()?,
            Terminator::Else(_) => return Err("unexpected tokens after else in range".to_string()),
            Terminator::Eof => return Err("unexpected EOF in range".to_string()),
        };
        Ok(Node::Range {
            pipe,
            body,
            otherwise,
        })
    }

    /// Handles `{{else}}` and the chained `{{else if ...}}` / `{{else with ...}}` forms
    fn parse_else(
        &mut self,
        keyword: &str,
        terminator: Terminator,
        chained: impl FnOnce(&mut Self, &[Spanned]) -> Result<Node, String>,
    ) -> Result<Vec<Node>, String> {
        match terminator {
            Terminator::End => Ok(Vec::new()),
            Terminator::Eof => Err(format!("unexpected EOF in {keyword}")),
            Terminator::Else(rest) if rest.is_empty() => self.expect_end(),
            Terminator::Else(rest) => match rest.first().map(|t| &t.token) {
                Some(Token::Ident(word)) if word == keyword => Ok(vec![chained(self, &rest[1..])?]),
                _ => Err(format!("unexpected tokens after else in {keyword}")),
            },
        }
    }

    fn expect_end(&mut self) -> Result<Vec<Node>, String> {
        let (nodes, terminator) = self.parse_list()?;
        match terminator {
            Terminator::End => Ok(nodes),
            Terminator::Else(_) => Err("expected end; found else".to_string()),
            Terminator::Eof => Err("unexpected EOF".to_string()),
        }
    }

    fn parse_pipeline(&self, tokens: &[Spanned]) -> Result<Pipeline, String> {
        let mut pipe = Pipeline::default();
        let mut rest = tokens;

        let declaration = match tokens {
            [Spanned { token: Token::Variable(a), .. }, Spanned { token: Token::Comma, .. }, Spanned { token: Token::Variable(b), .. }, Spanned { token: Token::Declare, .. }, ..] => {
                Some((vec![a.clone(), b.clone()], false, 4))
            }
            [Spanned { token: Token::Variable(a), .. }, Spanned { token: Token::Declare, .. }, ..] => {
                Some((vec![a.clone()], false, 2))
            }
            [Spanned { token: Token::Variable(a), .. }, Spanned { token: Token::Assign, .. }, ..] => {
                Some((vec![a.clone()], true, 2))
            }
            _ => None,
        };
        if let Some((decl, assign, consumed)) = declaration {
            pipe.decl = decl;
            pipe.assign = assign;
            rest = &tokens[consumed..];
        }

        for segment in split_commands(rest)? {
            pipe.commands.push(Command {
                args: self.parse_args(segment)?,
            });
        }
        if pipe.commands.is_empty() {
            return Err("missing value for command".to_string());
        }
        Ok(pipe)
    }

    fn parse_args(&self, tokens: &[Spanned]) -> Result<Vec<Arg>, String> {
        let mut args = Vec::new();
        let mut i = 0;
        while i < tokens.len() {
            let arg = match &tokens[i].token {
                Token::Dot => Arg::Dot,
                Token::Field(name) => {
                    let mut chain = vec![name.clone()];
                    i = take_chain(tokens, i + 1, &mut chain) - 1;
                    Arg::Field(chain)
                }
                Token::Variable(name) => {
                    let mut chain = Vec::new();
                    i = take_chain(tokens, i + 1, &mut chain) - 1;
                    Arg::Variable(name.clone(), chain)
                }
                Token::Ident(word) => match word.as_str() {
                    "true" => Arg::Literal(Value::Bool(true)),
                    "false" => Arg::Literal(Value::Bool(false)),
                    "nil" => Arg::Literal(Value::Nil),
                    name if (self.is_defined)(name) => Arg::Function(name.to_string()),
                    name => return Err(format!("function {name:?} not defined")),
                },
                Token::Str(s) => Arg::Literal(Value::Str(s.clone())),
                Token::Int(v) => Arg::Literal(Value::Int(*v)),
                Token::Float(v) => Arg::Literal(Value::Float(*v)),
                Token::LParen => {
                    let close = matching_paren(tokens, i)?;
                    let inner = self.parse_pipeline(&tokens[i + 1..close])?;
                    let mut chain = Vec::new();
                    i = take_chain(tokens, close + 1, &mut chain) - 1;
                    Arg::Sub(Box::new(inner), chain)
                }
                Token::RParen => return Err("unexpected right paren".to_string()),
                Token::Pipe => return Err("missing command".to_string()),
                Token::Comma | Token::Declare | Token::Assign => {
                    return Err("unexpected declaration in command".to_string());
                }
            };
            args.push(arg);
            i += 1;
        }
        Ok(args)
    }
}

/// Appends adjacent `.Field` tokens, returning the index after the chain
fn take_chain(tokens: &[Spanned], mut i: usize, chain: &mut Vec<String>) -> usize {
    while let Some(Spanned {
        token: Token::Field(name),
        space_before: false,
    }) = tokens.get(i)
    {
        chain.push(name.clone());
        i += 1;
    }
    i
}

fn matching_paren(tokens: &[Spanned], open: usize) -> Result<usize, String> {
    let mut depth = 0usize;
    for (offset, t) in tokens[open..].iter().enumerate() {
        match t.token {
            Token::LParen => depth += 1,
            Token::RParen => {
                depth -= 1;
                if depth == 0 {
                    return Ok(open + offset);
                }
            }
            _ => {}
        }
    }
    Err("unclosed left paren".to_string())
}

/// Splits a pipeline on `|` outside of parentheses
fn split_commands(tokens: &[Spanned]) -> Result<Vec<&[Spanned]>, String> {
    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, t) in tokens.iter().enumerate() {
        match t.token {
            Token::LParen => depth += 1,
            Token::RParen => depth = depth.saturating_sub(1),
            Token::Pipe if depth == 0 => {
                if i == start {
                    return Err("missing command".to_string());
                }
                segments.push(&tokens[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < tokens.len() {
        segments.push(&tokens[start..]);
    } else if !tokens.is_empty() {
        return Err("missing command".to_string());
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defined(name: &str) -> bool {
        matches!(name, "percent" | "quote" | "eq")
    }

    #[test]
    fn test_parse_field_chain_and_pipe() {
        let nodes = parse("{{ percent .Values.cpu 80 | quote }}", &defined).unwrap();
        let Node::Action(pipe) = &nodes[0] else {
            panic!("expected action");
        };
        assert_eq!(pipe.commands.len(), 2);
        assert_eq!(
            pipe.commands[0].args,
            vec![
                Arg::Function("percent".into()),
                Arg::Field(vec!["Values".into(), "cpu".into()]),
                Arg::Literal(Value::Int(80)),
            ]
        );
    }

    #[test]
    fn test_parse_else_if_chain() {
        let nodes = parse("{{if .A}}a{{else if .B}}b{{else}}c{{end}}", &defined).unwrap();
        let Node::If { otherwise, .. } = &nodes[0] else {
            panic!("expected if");
        };
        assert!(matches!(otherwise[0], Node::If { .. }));
    }

    #[test]
    fn test_undefined_function_is_parse_error() {
        let err = parse("{{ env \"HOME\" }}", &defined).unwrap_err();
        assert_eq!(err, "function \"env\" not defined");
    }

    #[test]
    fn test_unbalanced_control() {
        assert!(parse("{{if .A}}x", &defined).is_err());
        assert!(parse("x{{end}}", &defined).is_err());
    }

    #[test]
    fn test_range_declarations() {
        let nodes = parse("{{range $i, $v := .L}}{{$v}}{{end}}", &defined).unwrap();
        let Node::Range { pipe, .. } = &nodes[0] else {
            panic!("expected range");
        };
        assert_eq!(pipe.decl, vec!["i".to_string(), "v".to_string()]);
    }
}
