//! Query DSL lexer and parser
//!
//! Grammar:
//!
//! ```text
//! expression := term ( ("and" | "or" | "xor") expression )?
//! term       := query | "(" expression ")" | "[" expression "]"
//! query      := IDENT IDENT IDENT?
//! ```
//!
//! Identifiers match `[A-Za-z][A-Za-z0-9:/._@-]*`, so a PURL such as
//! `pkg:github/actions/checkout@v3` is one token.

use std::sync::OnceLock;

use regex_lite::Regex;

use crate::error::MinefieldError;
use crate::query::types::*;

/// Parse error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    pub position: usize,
}

impl ParseError {
    fn new(message: &str, position: usize) -> Self {
        ParseError {
            message: message.to_string(),
            position,
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Parse error at {}: {}", self.position, self.message)
    }
}

impl std::error::Error for ParseError {}

impl From<ParseError> for MinefieldError {
    fn from(e: ParseError) -> Self {
        MinefieldError::InvalidQuery(e.to_string())
    }
}

fn ident_pattern() -> Result<&'static Regex, ParseError> {
    static IDENT: OnceLock<Result<Regex, regex_lite::Error>> = OnceLock::new();
    IDENT
        .get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9:/._@-]*$"))
        .as_ref()
        .map_err(|e| ParseError::new(&format!("identifier pattern: {}", e), 0))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Op(Operator),
    Open(Bracket),
    Close(Bracket),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(s) => format!("'{}'", s),
            Token::Op(op) => format!("'{}'", op.keyword()),
            Token::Open(Bracket::Round) => "'('".to_string(),
            Token::Open(Bracket::Square) => "'['".to_string(),
            Token::Close(Bracket::Round) => "')'".to_string(),
            Token::Close(Bracket::Square) => "']'".to_string(),
        }
    }
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | ')' | '[' | ']')
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, ParseError> {
    let ident = ident_pattern()?;
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let bracket = match c {
            '(' => Some(Token::Open(Bracket::Round)),
            ')' => Some(Token::Close(Bracket::Round)),
            '[' => Some(Token::Open(Bracket::Square)),
            ']' => Some(Token::Close(Bracket::Square)),
            _ => None,
        };
        if let Some(token) = bracket {
            chars.next();
            tokens.push((token, pos));
            continue;
        }

        let mut end = pos;
        while let Some(&(i, c)) = chars.peek() {
            if is_delimiter(c) {
                break;
            }
            end = i + c.len_utf8();
            chars.next();
        }

        let word = &input[pos..end];
        let token = match Operator::from_keyword(word) {
            Some(op) => Token::Op(op),
            None if ident.is_match(word) => Token::Ident(word.to_string()),
            None => {
                return Err(ParseError::new(&format!("invalid identifier '{}'", word), pos));
            }
        };
        tokens.push((token, pos));
    }

    Ok(tokens)
}

/// Parser state
struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn new(input: &str) -> Result<Self, ParseError> {
        Ok(Parser {
            tokens: tokenize(input)?,
            pos: 0,
            end: input.len(),
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    /// Byte offset of the current token, or end of input
    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(_, p)| *p).unwrap_or(self.end)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect_ident(&mut self, what: &str) -> Result<String, ParseError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Ident(s)) => Ok(s),
            Some(other) => Err(ParseError::new(
                &format!("expected {}, found {}", what, other.describe()),
                offset,
            )),
            None => Err(ParseError::new(&format!("expected {}", what), offset)),
        }
    }

    fn parse_query(&mut self) -> Result<Query, ParseError> {
        let offset = self.offset();
        let keyword = self.expect_ident("query type")?;
        let query_type = QueryType::from_keyword(&keyword).ok_or_else(|| {
            ParseError::new(
                &format!("unknown query type '{}', expected 'dependencies' or 'dependents'", keyword),
                offset,
            )
        })?;

        let node_type = self.expect_ident("node type")?;

        let node_name = match self.peek() {
            Some(Token::Ident(_)) => Some(self.expect_ident("node name")?),
            _ => None,
        };

        Ok(Query::new(query_type, &node_type, node_name.as_deref()))
    }

    fn parse_term(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            Some(Token::Open(bracket)) => {
                let bracket = *bracket;
                self.next();
                let inner = self.parse_expression()?;

                let offset = self.offset();
                match self.next() {
                    Some(Token::Close(close)) if close == bracket => {
                        Ok(Expr::Group(bracket, Box::new(inner)))
                    }
                    Some(other) => Err(ParseError::new(
                        &format!("unbalanced group, found {}", other.describe()),
                        offset,
                    )),
                    None => Err(ParseError::new("unclosed group", offset)),
                }
            }
            _ => Ok(Expr::Query(self.parse_query()?)),
        }
    }

    fn parse_expression(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.parse_term()?;

        if let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            self.next();
            let rhs = self.parse_expression()?;
            return Ok(Expr::binary(op, lhs, rhs));
        }

        Ok(lhs)
    }

    fn parse_script(&mut self) -> Result<Expr, ParseError> {
        if self.tokens.is_empty() {
            return Err(ParseError::new("empty script", 0));
        }

        let expr = self.parse_expression()?;

        if let Some(token) = self.peek() {
            return Err(ParseError::new(
                &format!("unexpected {}", token.describe()),
                self.offset(),
            ));
        }

        Ok(expr)
    }
}

// ============================================================================
// Public API
// ============================================================================

/// Parse a complete script
pub fn parse_script(input: &str) -> Result<Expr, ParseError> {
    Parser::new(input)?.parse_script()
}

/// Parse a single leaf query
pub fn parse_query(input: &str) -> Result<Query, ParseError> {
    let mut parser = Parser::new(input)?;
    let query = parser.parse_query()?;
    if let Some(token) = parser.peek() {
        return Err(ParseError::new(
            &format!("unexpected {}", token.describe()),
            parser.offset(),
        ));
    }
    Ok(query)
}
