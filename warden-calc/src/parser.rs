//! Infix expression grammar.
//!
//! Produces an [`Expr`] tree which `lib.rs` flattens into the postfix
//! program actually stored with a rule.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, space0},
    combinator::{map, opt},
    multi::{many0, separated_list1},
    number::complete::double,
    sequence::{delimited, pair, preceded},
};

use crate::nom::{parse_error, IResult};
use crate::{BinOp, Func, UnOp, MAX_ARGS};

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(f64),
    Arg(u8),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
}

fn lex<'a, O>(
    parser: impl FnMut(&'a str) -> IResult<&'a str, O>,
) -> impl FnMut(&'a str) -> IResult<&'a str, O> {
    delimited(space0, parser, space0)
}

fn parse_literal(i: &str) -> IResult<&str, Expr> {
    map(double, Expr::Literal)(i)
}

/// A single letter `A`..`L` names an input argument; anything longer has to
/// be a function call.
fn parse_name(i: &str) -> IResult<&str, Expr> {
    let (rest, name) = take_while1(|c: char| c.is_ascii_alphabetic())(i)?;

    if name.len() == 1 {
        let index = (name.as_bytes()[0].to_ascii_uppercase() - b'A') as usize;
        if index < MAX_ARGS {
            return Ok((rest, Expr::Arg(index as u8)));
        }
        return Err(parse_error(i, "argument out of range (A..L)"));
    }

    let func = match name.to_ascii_uppercase().as_str() {
        "ABS" => Func::Abs,
        "NOT" => Func::Not,
        "MIN" => Func::Min,
        "MAX" => Func::Max,
        _ => return Err(parse_error(i, "unknown function")),
    };

    let (rest, args) = delimited(
        lex(char('(')),
        separated_list1(lex(char(',')), parse_ternary),
        lex(char(')')),
    )(rest)?;

    match func {
        Func::Abs | Func::Not if args.len() != 1 => {
            Err(parse_error(i, "function takes exactly one argument"))
        }
        _ => Ok((rest, Expr::Call(func, args))),
    }
}

fn parse_atom(i: &str) -> IResult<&str, Expr> {
    lex(alt((
        parse_literal,
        parse_name,
        delimited(char('('), parse_ternary, char(')')),
    )))(i)
}

fn parse_unary(i: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(lex(char('!')), parse_unary), |e| {
            Expr::Unary(UnOp::Not, Box::new(e))
        }),
        map(preceded(lex(char('-')), parse_unary), |e| {
            Expr::Unary(UnOp::Neg, Box::new(e))
        }),
        preceded(lex(char('+')), parse_unary),
        parse_atom,
    ))(i)
}

fn parse_power(i: &str) -> IResult<&str, Expr> {
    let (i, base) = parse_unary(i)?;
    // right associative
    let (i, exp) = opt(preceded(lex(tag("**")), parse_power))(i)?;
    Ok(match exp {
        Some(exp) => (i, Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exp))),
        None => (i, base),
    })
}

fn fold_binary(first: Expr, rest: Vec<(BinOp, Expr)>) -> Expr {
    rest.into_iter().fold(first, |acc, (op, rhs)| {
        Expr::Binary(op, Box::new(acc), Box::new(rhs))
    })
}

fn parse_product(i: &str) -> IResult<&str, Expr> {
    let mul_op = alt((
        map(char('*'), |_| BinOp::Mul),
        map(char('/'), |_| BinOp::Div),
        map(char('%'), |_| BinOp::Mod),
    ));
    map(
        pair(parse_power, many0(pair(lex(mul_op), parse_power))),
        |(first, rest)| fold_binary(first, rest),
    )(i)
}

fn parse_sum(i: &str) -> IResult<&str, Expr> {
    let add_op = alt((
        map(char('+'), |_| BinOp::Add),
        map(char('-'), |_| BinOp::Sub),
    ));
    map(
        pair(parse_product, many0(pair(lex(add_op), parse_product))),
        |(first, rest)| fold_binary(first, rest),
    )(i)
}

fn parse_compare(i: &str) -> IResult<&str, Expr> {
    // multi-char operators first so that `<=` is not lexed as `<`
    let cmp_op = alt((
        map(tag("<="), |_| BinOp::Le),
        map(tag(">="), |_| BinOp::Ge),
        map(tag("=="), |_| BinOp::Eq),
        map(tag("!="), |_| BinOp::Ne),
        map(char('<'), |_| BinOp::Lt),
        map(char('>'), |_| BinOp::Gt),
        map(char('='), |_| BinOp::Eq),
        map(char('#'), |_| BinOp::Ne),
    ));
    map(
        pair(parse_sum, many0(pair(lex(cmp_op), parse_sum))),
        |(first, rest)| fold_binary(first, rest),
    )(i)
}

fn parse_and(i: &str) -> IResult<&str, Expr> {
    map(
        pair(
            parse_compare,
            many0(preceded(lex(tag("&&")), parse_compare)),
        ),
        |(first, rest)| {
            rest.into_iter().fold(first, |acc, rhs| {
                Expr::Binary(BinOp::And, Box::new(acc), Box::new(rhs))
            })
        },
    )(i)
}

fn parse_or(i: &str) -> IResult<&str, Expr> {
    map(pair(parse_and, many0(preceded(lex(tag("||")), parse_and))), |(first, rest)| {
        rest.into_iter().fold(first, |acc, rhs| {
            Expr::Binary(BinOp::Or, Box::new(acc), Box::new(rhs))
        })
    })(i)
}

pub fn parse_ternary(i: &str) -> IResult<&str, Expr> {
    let (i, cond) = parse_or(i)?;
    let (i, branches) = opt(pair(
        preceded(lex(char('?')), parse_ternary),
        preceded(lex(char(':')), parse_ternary),
    ))(i)?;
    Ok(match branches {
        Some((then, other)) => (
            i,
            Expr::Ternary(Box::new(cond), Box::new(then), Box::new(other)),
        ),
        None => (i, cond),
    })
}
