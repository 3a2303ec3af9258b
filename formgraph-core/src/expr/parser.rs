//! Nom Parser for Field Expressions
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! or          := and ( "||" and )*
//! and         := equality ( "&&" equality )*
//! equality    := comparison ( ("===" | "!==" | "==" | "!=") comparison )*
//! comparison  := additive ( ("<=" | ">=" | "<" | ">") additive )*
//! additive    := term ( ("+" | "-") term )*
//! term        := unary ( ("*" | "/" | "%") unary )*
//! unary       := ("!" | "-") unary | primary
//! primary     := "(" or ")" | string | number | pointer | array | word
//! word        := true | false | null | undefined | builtin "(" args ")"
//! ```
//!
//! Pointers start with `#` or `.` and run until whitespace or an operator
//! character that cannot appear in a pointer.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{char, digit1, multispace0, satisfy},
    combinator::{all_consuming, cut, map, map_res, opt, recognize, value},
    error::{Error, ErrorKind},
    multi::separated_list0,
    sequence::{delimited, pair, preceded, terminated},
    IResult,
};
use serde_json::Value;

use super::eval::number;
use super::{BinaryOp, Builtin, Expr, UnaryOp};

type ExprParser = fn(&str) -> IResult<&str, Expr>;
type OpParser = fn(&str) -> IResult<&str, BinaryOp>;

/// Longest slice of remaining input quoted in an error message.
const ERROR_CONTEXT: usize = 24;

/// Parse a complete expression.
pub fn parse(input: &str) -> Result<Expr, String> {
    if input.trim().is_empty() {
        return Err("empty expression".to_string());
    }
    match all_consuming(terminated(or_expr, multispace0))(input) {
        Ok((_, expr)) => Ok(expr),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            let context: String = e.input.chars().take(ERROR_CONTEXT).collect();
            if context.is_empty() {
                Err("unexpected end of expression".to_string())
            } else {
                Err(format!("unexpected input at `{context}`"))
            }
        }
        Err(nom::Err::Incomplete(_)) => Err("incomplete expression".to_string()),
    }
}

/// Parse `operand (operator operand)*`, folding to the left.
fn binary_level<'a>(
    input: &'a str,
    operand: ExprParser,
    operator: OpParser,
) -> IResult<&'a str, Expr> {
    let (mut input, mut lhs) = operand(input)?;
    loop {
        let (rest, _) = multispace0(input)?;
        match operator(rest) {
            Ok((rest, op)) => {
                let (rest, rhs) = cut(operand)(rest)?;
                lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
                input = rest;
            }
            Err(nom::Err::Error(_)) => return Ok((input, lhs)),
            Err(err) => return Err(err),
        }
    }
}

fn or_expr(input: &str) -> IResult<&str, Expr> {
    binary_level(input, and_expr, or_op)
}

fn and_expr(input: &str) -> IResult<&str, Expr> {
    binary_level(input, equality, and_op)
}

fn equality(input: &str) -> IResult<&str, Expr> {
    binary_level(input, comparison, equality_op)
}

fn comparison(input: &str) -> IResult<&str, Expr> {
    binary_level(input, additive, comparison_op)
}

fn additive(input: &str) -> IResult<&str, Expr> {
    binary_level(input, term, additive_op)
}

fn term(input: &str) -> IResult<&str, Expr> {
    binary_level(input, unary, term_op)
}

fn or_op(input: &str) -> IResult<&str, BinaryOp> {
    value(BinaryOp::Or, tag("||"))(input)
}

fn and_op(input: &str) -> IResult<&str, BinaryOp> {
    value(BinaryOp::And, tag("&&"))(input)
}

fn equality_op(input: &str) -> IResult<&str, BinaryOp> {
    alt((
        value(BinaryOp::Eq, tag("===")),
        value(BinaryOp::Ne, tag("!==")),
        value(BinaryOp::Eq, tag("==")),
        value(BinaryOp::Ne, tag("!=")),
    ))(input)
}

fn comparison_op(input: &str) -> IResult<&str, BinaryOp> {
    alt((
        value(BinaryOp::Le, tag("<=")),
        value(BinaryOp::Ge, tag(">=")),
        value(BinaryOp::Lt, char('<')),
        value(BinaryOp::Gt, char('>')),
    ))(input)
}

fn additive_op(input: &str) -> IResult<&str, BinaryOp> {
    alt((
        value(BinaryOp::Add, char('+')),
        value(BinaryOp::Sub, char('-')),
    ))(input)
}

fn term_op(input: &str) -> IResult<&str, BinaryOp> {
    alt((
        value(BinaryOp::Mul, char('*')),
        value(BinaryOp::Div, char('/')),
        value(BinaryOp::Mod, char('%')),
    ))(input)
}

fn unary(input: &str) -> IResult<&str, Expr> {
    let (input, _) = multispace0(input)?;
    let op: IResult<&str, UnaryOp> = alt((
        value(UnaryOp::Not, char('!')),
        value(UnaryOp::Neg, char('-')),
    ))(input);
    match op {
        Ok((rest, op)) => {
            let (rest, operand) = cut(unary)(rest)?;
            Ok((rest, Expr::Unary(op, Box::new(operand))))
        }
        Err(nom::Err::Error(_)) => primary(input),
        Err(err) => Err(err),
    }
}

fn primary(input: &str) -> IResult<&str, Expr> {
    alt((
        parenthesized,
        string_literal,
        number_literal,
        pointer,
        array_literal,
        word,
    ))(input)
}

fn parenthesized(input: &str) -> IResult<&str, Expr> {
    delimited(char('('), or_expr, preceded(multispace0, cut(char(')'))))(input)
}

/// Parse a quoted string: "some text" or 'some text'
fn string_literal(input: &str) -> IResult<&str, Expr> {
    map(
        alt((
            delimited(char('"'), take_while(|c: char| c != '"'), char('"')),
            delimited(char('\''), take_while(|c: char| c != '\''), char('\'')),
        )),
        |s: &str| Expr::Literal(Value::String(s.to_string())),
    )(input)
}

fn number_literal(input: &str) -> IResult<&str, Expr> {
    map_res(
        recognize(pair(digit1, opt(pair(char('.'), digit1)))),
        |s: &str| s.parse::<f64>().map(|n| Expr::Literal(number(n))),
    )(input)
}

fn is_pointer_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '$' | '*' | '.' | '/' | '~' | '@')
}

fn pointer(input: &str) -> IResult<&str, Expr> {
    map(
        recognize(pair(
            alt((char('#'), char('.'))),
            take_while(is_pointer_char),
        )),
        |s: &str| Expr::Pointer(s.to_string()),
    )(input)
}

fn array_literal(input: &str) -> IResult<&str, Expr> {
    map(
        delimited(
            char('['),
            separated_list0(preceded(multispace0, char(',')), or_expr),
            preceded(multispace0, cut(char(']'))),
        ),
        Expr::Array,
    )(input)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))(input)
}

fn arguments(input: &str) -> IResult<&str, Vec<Expr>> {
    delimited(
        preceded(multispace0, char('(')),
        separated_list0(preceded(multispace0, char(',')), or_expr),
        preceded(multispace0, cut(char(')'))),
    )(input)
}

/// Keywords and builtin calls. Bare names are rejected: fields are reached
/// through pointers.
fn word(input: &str) -> IResult<&str, Expr> {
    let (rest, name) = identifier(input)?;
    match arguments(rest) {
        Ok((after, args)) => match Builtin::from_name(name) {
            Some(builtin) => Ok((after, Expr::Call(builtin, args))),
            None => Err(nom::Err::Failure(Error::new(input, ErrorKind::Verify))),
        },
        Err(nom::Err::Error(_)) => match name {
            "true" => Ok((rest, Expr::Literal(Value::Bool(true)))),
            "false" => Ok((rest, Expr::Literal(Value::Bool(false)))),
            "null" | "undefined" => Ok((rest, Expr::Literal(Value::Null))),
            _ => Err(nom::Err::Failure(Error::new(input, ErrorKind::Tag))),
        },
        Err(err) => Err(err),
    }
}
