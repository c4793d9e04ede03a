//! Parser for the textual filter and sort surface
//!
//! Grammar (keywords are case-insensitive):
//!
//! ```text
//! expr       := and (("or" | "||") and)*
//! and        := unary (("and" | "&&") unary)*
//! unary      := ("not" | "!") unary | "(" expr ")" | "true" | "false" | comparison
//! comparison := operand (cmp literal | "in" "(" literal ("," literal)* ")")
//! operand    := field | "String" "(" field ")"
//! field      := "it" "[" string "]" | ident ("." ident)*
//! literal    := string | ["-"] number | "null" | "true" | "false"
//! ```
//!
//! String literals escape embedded quotes by doubling them.

use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, digit0, digit1, one_of, satisfy},
    combinator::{map, opt, recognize, value},
    multi::many0,
    sequence::{delimited, pair, tuple},
};

use crate::error::{EngineError, Result};

use super::expr::{CompareOp, Expr, Field, Literal, Projection};
use super::sort::{SortDirection, SortSpec};

/// Deepest nesting of parentheses and negations a filter may use
pub const MAX_NESTING_DEPTH: usize = 256;

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(String),
    Op(CompareOp),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Minus,
    Bang,
    AndAnd,
    OrOr,
}

/// Split the input into tokens tagged with their byte offset
fn tokenize(input: &str) -> Result<Vec<(usize, Token)>> {
    let mut tokens = Vec::new();
    let mut rest = input.trim_start();
    while !rest.is_empty() {
        let position = input.len() - rest.len();
        let (remaining, token) = token(rest).map_err(|_| error(position, lex_error(rest)))?;
        tokens.push((position, token));
        rest = remaining.trim_start();
    }
    Ok(tokens)
}

fn lex_error(rest: &str) -> String {
    match rest.chars().next() {
        Some('"') => "unterminated string literal".to_string(),
        Some('&') => "expected '&&'".to_string(),
        Some('|') => "expected '||'".to_string(),
        Some(other) => format!("unexpected character '{}'", other),
        None => "unexpected end of input".to_string(),
    }
}

fn token(input: &str) -> IResult<&str, Token> {
    alt((
        map(string_literal, Token::Str),
        map(number, |n: &str| Token::Number(n.to_string())),
        map(identifier, |i: &str| Token::Ident(i.to_string())),
        operator,
        punctuation,
    ))(input)
}

/// `"..."` with embedded quotes doubled
fn string_literal(input: &str) -> IResult<&str, String> {
    delimited(
        char('"'),
        map(
            many0(alt((
                take_while1(|c: char| c != '"'),
                value("\"", tag("\"\"")),
            ))),
            |parts| parts.concat(),
        ),
        char('"'),
    )(input)
}

fn number(input: &str) -> IResult<&str, &str> {
    recognize(tuple((
        digit1,
        opt(pair(char('.'), digit0)),
        opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
    )))(input)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c| c.is_alphabetic() || c == '_'),
        take_while(|c: char| c.is_alphanumeric() || c == '_'),
    ))(input)
}

fn operator(input: &str) -> IResult<&str, Token> {
    alt((
        value(Token::Op(CompareOp::Eq), alt((tag("=="), tag("=")))),
        value(Token::Op(CompareOp::Ne), alt((tag("!="), tag("<>")))),
        value(Token::Op(CompareOp::Le), tag("<=")),
        value(Token::Op(CompareOp::Ge), tag(">=")),
        value(Token::Op(CompareOp::Lt), tag("<")),
        value(Token::Op(CompareOp::Gt), tag(">")),
        value(Token::AndAnd, tag("&&")),
        value(Token::OrOr, tag("||")),
        value(Token::Bang, tag("!")),
    ))(input)
}

fn punctuation(input: &str) -> IResult<&str, Token> {
    alt((
        value(Token::LParen, char('(')),
        value(Token::RParen, char(')')),
        value(Token::LBracket, char('[')),
        value(Token::RBracket, char(']')),
        value(Token::Comma, char(',')),
        value(Token::Dot, char('.')),
        value(Token::Minus, char('-')),
    ))(input)
}

fn error(position: usize, message: impl Into<String>) -> EngineError {
    EngineError::InvalidQueryExpression {
        position,
        message: message.into(),
    }
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    index: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn new(input: &str) -> Result<Self> {
        Ok(Self {
            tokens: tokenize(input)?,
            index: 0,
            end: input.len(),
            depth: 0,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.index).map(|(_, t)| t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.index).map_or(self.end, |(p, _)| *p)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.index).map(|(_, t)| t.clone());
        self.index += 1;
        token
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s.eq_ignore_ascii_case(keyword))
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<()> {
        let position = self.position();
        match self.next() {
            Some(token) if token == expected => Ok(()),
            _ => Err(error(position, format!("expected {}", what))),
        }
    }

    fn finish(&self) -> Result<()> {
        if self.index < self.tokens.len() {
            return Err(error(self.position(), "unexpected trailing input"));
        }
        Ok(())
    }

    fn or(&mut self) -> Result<Expr> {
        let mut parts = vec![self.and()?];
        while self.at_keyword("or") || self.peek() == Some(&Token::OrOr) {
            self.index += 1;
            parts.push(self.and()?);
        }
        Ok(if parts.len() == 1 { parts.remove(0) } else { Expr::Or(parts) })
    }

    fn and(&mut self) -> Result<Expr> {
        let mut parts = vec![self.unary()?];
        while self.at_keyword("and") || self.peek() == Some(&Token::AndAnd) {
            self.index += 1;
            parts.push(self.unary()?);
        }
        Ok(if parts.len() == 1 { parts.remove(0) } else { Expr::And(parts) })
    }

    /// Run `parse` one nesting level deeper
    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(error(self.position(), "expression nested too deeply"));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.at_keyword("not") || self.peek() == Some(&Token::Bang) {
            return self.nested(|p| {
                p.index += 1;
                Ok(Expr::Not(Box::new(p.unary()?)))
            });
        }
        if self.peek() == Some(&Token::LParen) {
            return self.nested(|p| {
                p.index += 1;
                let inner = p.or()?;
                p.expect(Token::RParen, "')'")?;
                Ok(inner)
            });
        }
        for (keyword, value) in [("true", true), ("false", false)] {
            if self.at_keyword(keyword) {
                self.index += 1;
                return Ok(Expr::Const(value));
            }
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr> {
        let field = self.operand()?;

        if self.at_keyword("in") {
            self.index += 1;
            self.expect(Token::LParen, "'(' after 'in'")?;
            let mut values = vec![self.literal()?];
            while self.peek() == Some(&Token::Comma) {
                self.index += 1;
                values.push(self.literal()?);
            }
            self.expect(Token::RParen, "')'")?;
            return Ok(Expr::In { field, values });
        }

        let position = self.position();
        match self.next() {
            Some(Token::Op(op)) => Ok(Expr::Compare {
                field,
                op,
                value: self.literal()?,
            }),
            _ => Err(error(position, "expected comparison operator or 'in'")),
        }
    }

    fn operand(&mut self) -> Result<Field> {
        // `String(x)` is accepted as a no-op cast around a field
        if self.at_keyword("string")
            && self.tokens.get(self.index + 1).map(|(_, t)| t) == Some(&Token::LParen)
        {
            self.index += 2;
            let field = self.field()?;
            self.expect(Token::RParen, "')'")?;
            return Ok(field);
        }
        self.field()
    }

    fn field(&mut self) -> Result<Field> {
        let position = self.position();
        let Some(Token::Ident(first)) = self.next() else {
            return Err(error(position, "expected field"));
        };

        if first.eq_ignore_ascii_case("it") && self.peek() == Some(&Token::LBracket) {
            self.index += 1;
            let key_position = self.position();
            let Some(Token::Str(key)) = self.next() else {
                return Err(error(key_position, "expected property name string"));
            };
            self.expect(Token::RBracket, "']'")?;
            let (projection, name) = Projection::split_key(&key);
            return Ok(Field::property(name, projection));
        }

        let mut path = vec![first];
        while self.peek() == Some(&Token::Dot) {
            self.index += 1;
            let position = self.position();
            match self.next() {
                Some(Token::Ident(part)) => path.push(part),
                _ => return Err(error(position, "expected identifier after '.'")),
            }
        }

        // `it.X` and `LogEvent.X` address the same fields as `X`
        let name = path
            .iter()
            .skip_while(|p| p.eq_ignore_ascii_case("it") || p.eq_ignore_ascii_case("logevent"))
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(".");

        named_field(&name).ok_or_else(|| error(position, format!("unknown field '{}'", name)))
    }

    fn literal(&mut self) -> Result<Literal> {
        let position = self.position();
        let negative = self.peek() == Some(&Token::Minus);
        if negative {
            self.index += 1;
        }

        match self.next() {
            Some(Token::Number(text)) => parse_number(&text, negative)
                .ok_or_else(|| error(position, format!("invalid number '{}'", text))),
            Some(Token::Str(s)) if !negative => Ok(Literal::String(s)),
            Some(Token::Ident(word)) if !negative => match word.to_ascii_lowercase().as_str() {
                "null" => Ok(Literal::Null),
                "true" => Ok(Literal::Bool(true)),
                "false" => Ok(Literal::Bool(false)),
                _ => Err(error(position, format!("expected literal, found '{}'", word))),
            },
            _ => Err(error(position, "expected literal")),
        }
    }
}

fn named_field(name: &str) -> Option<Field> {
    let field = match name.to_ascii_lowercase().as_str() {
        "id" => Field::Id,
        "fileid" => Field::FileId,
        "timestamp" => Field::Timestamp,
        "level" => Field::Level,
        "message" | "renderedmessage" => Field::Message,
        "messagetemplate" => Field::MessageTemplate,
        "exception" | "exceptiontext" => Field::Exception,
        "isbookmarked" => Field::IsBookmarked,
        _ => return None,
    };
    Some(field)
}

fn parse_number(text: &str, negative: bool) -> Option<Literal> {
    let is_float = text.contains(['.', 'e', 'E']);
    if is_float {
        let value: f64 = text.parse().ok()?;
        return Some(Literal::Float(if negative { -value } else { value }));
    }
    if negative {
        return format!("-{}", text).parse().ok().map(Literal::Int);
    }
    match text.parse::<i64>() {
        Ok(n) => Some(Literal::Int(n)),
        Err(_) => text.parse::<u64>().ok().map(Literal::UInt),
    }
}

/// Parse a filter expression; an empty or blank string means "match all" (`None`)
pub fn parse_filter(input: &str) -> Result<Option<Expr>> {
    if input.trim().is_empty() {
        return Ok(None);
    }
    let mut parser = Parser::new(input)?;
    let expr = parser.or()?;
    parser.finish()?;
    Ok(Some(expr))
}

/// Parse a sort expression like `Timestamp desc` or `it["i:Count"] asc`
///
/// An empty string means the default order (`None`).
pub fn parse_sort(input: &str) -> Result<Option<SortSpec>> {
    if input.trim().is_empty() {
        return Ok(None);
    }
    let mut parser = Parser::new(input)?;
    let field = parser.operand()?;

    let direction = if parser.at_keyword("desc") || parser.at_keyword("descending") {
        parser.index += 1;
        SortDirection::Descending
    } else {
        if parser.at_keyword("asc") || parser.at_keyword("ascending") {
            parser.index += 1;
        }
        SortDirection::Ascending
    };
    parser.finish()?;

    Ok(Some(SortSpec::new(field, direction)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use logscope_types::LogLevel;

    fn parse(input: &str) -> Expr {
        parse_filter(input).unwrap().unwrap()
    }

    #[test]
    fn test_empty_is_match_all() {
        assert_eq!(parse_filter("").unwrap(), None);
        assert_eq!(parse_filter("   ").unwrap(), None);
    }

    #[test]
    fn test_property_access() {
        assert_eq!(parse(r#"it["s:App"] == "A""#), Expr::property_equals("App", Some("A")));
        assert_eq!(
            parse(r#"String(it["s:App"])==null"#),
            Expr::property_equals("App", None)
        );
        assert_eq!(
            parse(r#"it["Count"] = "3""#),
            Expr::compare(
                Field::property("Count", Projection::Untyped),
                CompareOp::Eq,
                Literal::string("3")
            )
        );
    }

    #[test]
    fn test_precedence_and_grouping() {
        let expr = parse(r#"Level in (4, 5) or it["s:A"] == "x" and not IsBookmarked == true"#);
        let Expr::Or(parts) = expr else {
            panic!("expected or");
        };
        assert_eq!(parts[0], Expr::level_in([LogLevel::Error, LogLevel::Fatal]));
        assert!(matches!(&parts[1], Expr::And(inner) if inner.len() == 2));

        let grouped = parse(r#"(LogEvent.Level == 1 || Id > 3) && Timestamp >= "2024-01-01T00:00:00Z""#);
        assert!(matches!(grouped, Expr::And(ref inner) if matches!(inner[0], Expr::Or(_))));
    }

    #[test]
    fn test_literals() {
        assert_eq!(
            parse(r#"it["s:Q"] == "say ""hi""""#),
            Expr::property_equals("Q", Some("say \"hi\""))
        );
        assert_eq!(
            parse(r#"it["f:X"] < -1.5e2"#),
            Expr::compare(Field::property("X", Projection::Float), CompareOp::Lt, Literal::Float(-150.0))
        );
        assert_eq!(
            parse(r#"it["u:X"] <> 18446744073709551615"#),
            Expr::compare(Field::property("X", Projection::Unsigned), CompareOp::Ne, Literal::UInt(u64::MAX))
        );
    }

    #[test]
    fn test_display_round_trip() {
        let input = r#"(it["s:App"] == "A" and Level in (0, 1, 2)) or it["s:App"] == null"#;
        let expr = parse(input);
        assert_eq!(expr.to_string(), input);
        assert_eq!(parse(&expr.to_string()), expr);
    }

    #[test]
    fn test_syntax_errors() {
        for bad in [
            "Level ==",
            "Level in 1, 2",
            "Bogus == 1",
            r#"it["s:A"] == "open"#,
            "Level == 1 junk",
            "(Level == 1",
            "Level & 1",
            "Level == #",
        ] {
            assert!(
                matches!(parse_filter(bad), Err(EngineError::InvalidQueryExpression { .. })),
                "expected error for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_nesting_limit() {
        let nested = |depth: usize| {
            format!("{}Level = \"Error\"{}", "(".repeat(depth), ")".repeat(depth))
        };
        assert!(parse_filter(&nested(MAX_NESTING_DEPTH)).is_ok());

        let err = parse_filter(&nested(20_000)).unwrap_err();
        let EngineError::InvalidQueryExpression { position, message } = err else {
            panic!("expected invalid expression, got {:?}", err);
        };
        assert_eq!(position, MAX_NESTING_DEPTH);
        assert_eq!(message, "expression nested too deeply");

        let negations = format!("{}true", "not ".repeat(MAX_NESTING_DEPTH + 1));
        assert!(matches!(
            parse_filter(&negations),
            Err(EngineError::InvalidQueryExpression { .. })
        ));
    }

    #[test]
    fn test_lexer_errors() {
        let message = |input: &str| match parse_filter(input) {
            Err(EngineError::InvalidQueryExpression { message, .. }) => message,
            other => panic!("expected error for {:?}, got {:?}", input, other),
        };
        assert_eq!(message(r#"it["s:A"] == "open"#), "unterminated string literal");
        assert_eq!(message("Level == 1 & Id == 2"), "expected '&&'");
        assert_eq!(message("Level == #"), "unexpected character '#'");
    }

    #[test]
    fn test_parse_sort() {
        assert_eq!(parse_sort("").unwrap(), None);
        assert_eq!(
            parse_sort("Timestamp desc").unwrap(),
            Some(SortSpec::new(Field::Timestamp, SortDirection::Descending))
        );
        assert_eq!(
            parse_sort(r#"it["i:Count"]"#).unwrap(),
            Some(SortSpec::new(
                Field::property("Count", Projection::Integer),
                SortDirection::Ascending
            ))
        );
        assert!(parse_sort("Level sideways").is_err());
    }
}
