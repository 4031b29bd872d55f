//! Search-query parser turning free text such as
//! `level=error service_name:api* -"health check" (user=bob OR user=alice)`
//! into a [`FilterNode`] tree.

use crate::{
    error::{Result, ServiceError},
    filter::{Comparison, FilterNode, Filters, Operator, SearchParser},
    models::TableConfig,
};
use std::iter::Peekable;
use std::vec::IntoIter;

const MAX_QUERY_LEN: usize = 4096;
const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSearchParser;

impl SearchParser for DefaultSearchParser {
    fn parse(&self, query: &str, config: &TableConfig) -> Result<Filters> {
        parse(query, config)
    }
}

pub fn parse(query: &str, config: &TableConfig) -> Result<Filters> {
    if query.len() > MAX_QUERY_LEN {
        return Err(ServiceError::invalid("search query is too long"));
    }
    let tokens = tokenize(query)?;
    if tokens.is_empty() {
        return Ok(Vec::new());
    }

    let mut parser = TreeParser {
        tokens: tokens.into_iter().peekable(),
        config,
        depth: 0,
    };
    let root = parser.parse_or()?;
    if let Some(token) = parser.tokens.next() {
        return Err(ServiceError::invalid(format!(
            "unexpected {} in search query",
            token.describe()
        )));
    }

    Ok(match root {
        FilterNode::And(children) => children,
        other => vec![other],
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Open,
    Close,
    And,
    Or,
    Not,
    Term { text: String, quoted: bool },
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Open => "'('".to_string(),
            Token::Close => "')'".to_string(),
            Token::And => "AND".to_string(),
            Token::Or => "OR".to_string(),
            Token::Not => "NOT".to_string(),
            Token::Term { text, .. } => format!("'{text}'"),
        }
    }
}

struct TreeParser<'a> {
    tokens: Peekable<IntoIter<Token>>,
    config: &'a TableConfig,
    depth: usize,
}

impl TreeParser<'_> {
    fn parse_or(&mut self) -> Result<FilterNode> {
        let mut branches = vec![self.parse_and()?];
        while self.tokens.peek() == Some(&Token::Or) {
            self.tokens.next();
            branches.push(self.parse_and()?);
        }
        Ok(collapse(branches, FilterNode::Or))
    }

    fn parse_and(&mut self) -> Result<FilterNode> {
        let mut terms = vec![self.parse_unary()?];
        loop {
            match self.tokens.peek() {
                None | Some(Token::Or) | Some(Token::Close) => break,
                Some(Token::And) => {
                    self.tokens.next();
                }
                Some(_) => {}
            }
            terms.push(self.parse_unary()?);
        }
        Ok(collapse(terms, FilterNode::And))
    }

    fn parse_unary(&mut self) -> Result<FilterNode> {
        match self.tokens.next() {
            Some(Token::Not) => Ok(FilterNode::negate(self.parse_unary()?)),
            Some(Token::Open) => {
                self.depth += 1;
                if self.depth > MAX_DEPTH {
                    return Err(ServiceError::invalid("search query is nested too deeply"));
                }
                let inner = self.parse_or()?;
                self.depth -= 1;
                match self.tokens.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(ServiceError::invalid("unbalanced parentheses in search query")),
                }
            }
            Some(Token::Term { text, quoted }) => self.term(&text, quoted),
            Some(other) => Err(ServiceError::invalid(format!(
                "unexpected {} in search query",
                other.describe()
            ))),
            None => Err(ServiceError::invalid("incomplete search query")),
        }
    }

    fn term(&self, text: &str, quoted: bool) -> Result<FilterNode> {
        if quoted {
            return self.body_term(text.to_string());
        }

        let Some((key, operator, raw_value)) = split_comparison(text) else {
            return self.body_term(text.replace('*', "%"));
        };
        if key.is_empty() {
            return Err(ServiceError::invalid(format!("missing key in '{text}'")));
        }

        let (operator, value) = parse_value(operator, raw_value);
        if value.is_empty() {
            return Err(ServiceError::invalid(format!("missing value for '{key}'")));
        }
        Comparison::new(key, operator, vec![value]).map(FilterNode::Compare)
    }

    fn body_term(&self, value: String) -> Result<FilterNode> {
        let body = self.config.body_column.as_deref().ok_or_else(|| {
            ServiceError::invalid(format!(
                "free text search is not supported for {}",
                self.config.resource.as_str()
            ))
        })?;
        Comparison::new(body, Operator::Equal, vec![value]).map(FilterNode::Compare)
    }
}

fn collapse(mut nodes: Vec<FilterNode>, wrap: fn(Vec<FilterNode>) -> FilterNode) -> FilterNode {
    if nodes.len() == 1 {
        nodes.remove(0)
    } else {
        wrap(nodes)
    }
}

/// Splits `key<op>value` on the first `!=`, `=` or `:` outside quotes.
fn split_comparison(text: &str) -> Option<(&str, Operator, &str)> {
    let mut quote = None;
    for (index, ch) in text.char_indices() {
        if let Some(q) = quote {
            if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => quote = Some(ch),
            '!' if text[index + 1..].starts_with('=') => {
                return Some((&text[..index], Operator::NotEqual, &text[index + 2..]));
            }
            '=' | ':' => return Some((&text[..index], Operator::Equal, &text[index + 1..])),
            _ => {}
        }
    }
    None
}

fn parse_value(operator: Operator, raw: &str) -> (Operator, String) {
    let raw = raw.trim();
    if raw.len() >= 2 && raw.starts_with('/') && raw.ends_with('/') {
        // `\/` is the delimiter escape; other escapes belong to the regex
        let pattern = raw[1..raw.len() - 1].replace("\\/", "/");
        let operator = match operator {
            Operator::NotEqual => Operator::NotRegex,
            _ => Operator::Regex,
        };
        return (operator, pattern);
    }
    for quote in ['"', '\''] {
        if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
            return (operator, raw[1..raw.len() - 1].to_string());
        }
    }
    (operator, raw.replace('*', "%"))
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote = None;
    let mut escape = false;
    let mut whole_quoted = false;

    let flush = |current: &mut String, whole_quoted: &mut bool, tokens: &mut Vec<Token>| {
        if current.is_empty() {
            return;
        }
        let text = std::mem::take(current);
        let quoted = std::mem::take(whole_quoted);
        tokens.push(classify(text, quoted));
    };

    for ch in input.chars() {
        if escape {
            current.push(ch);
            escape = false;
            continue;
        }

        if let Some(q) = quote {
            if ch == '\\' {
                escape = true;
                continue;
            }
            if ch == q {
                quote = None;
                if !whole_quoted {
                    current.push(ch);
                }
            } else {
                current.push(ch);
            }
            continue;
        }

        match ch {
            '"' | '\'' => {
                quote = Some(ch);
                if current.is_empty() || current == "-" {
                    whole_quoted = true;
                } else {
                    current.push(ch);
                }
            }
            '(' | ')' => {
                flush(&mut current, &mut whole_quoted, &mut tokens);
                tokens.push(if ch == '(' { Token::Open } else { Token::Close });
            }
            c if c.is_whitespace() => flush(&mut current, &mut whole_quoted, &mut tokens),
            _ => current.push(ch),
        }
    }

    if quote.is_some() {
        return Err(ServiceError::invalid("unterminated quote in search query"));
    }
    flush(&mut current, &mut whole_quoted, &mut tokens);
    Ok(expand_negations(tokens))
}

fn classify(text: String, quoted: bool) -> Token {
    if quoted {
        return Token::Term { text, quoted };
    }
    match text.as_str() {
        "AND" => Token::And,
        "OR" => Token::Or,
        "NOT" => Token::Not,
        _ => Token::Term { text, quoted },
    }
}

/// Rewrites a leading `-` on a term into a NOT token.
fn expand_negations(tokens: Vec<Token>) -> Vec<Token> {
    let mut expanded = Vec::with_capacity(tokens.len());
    for token in tokens {
        match token {
            Token::Term { text, quoted } if text.len() > 1 && text.starts_with('-') => {
                expanded.push(Token::Not);
                expanded.push(Token::Term {
                    text: text[1..].to_string(),
                    quoted,
                });
            }
            other => expanded.push(other),
        }
    }
    expanded
}
