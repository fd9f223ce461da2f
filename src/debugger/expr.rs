//! Source expression language: identifiers, integer literals, unary `*`/`-`,
//! binary `+ - * /`, member access `.`/`->`, indexing and parentheses.

use crate::debugger::debugee::dwarf::r#type::{self, TypeKind};
use crate::debugger::debugee::Debugee;
use crate::debugger::error::Error;
use crate::debugger::variable::{self, FrameContext, VariableView};
use chumsky::error::Rich;
use chumsky::prelude::{choice, end, just, recursive};
use chumsky::{extra, text, IterParser, Parser};
use itertools::Itertools;

type PErr<'a> = extra::Err<Rich<'a, char>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Deref,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Ident(String),
    Int(i64),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Field(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
}

/// Integer division behavior; the driver picks what matches its language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DivisionSemantics {
    #[default]
    Truncating,
    Floor,
    Float,
}

fn parser<'a>() -> impl Parser<'a, &'a str, Expr, PErr<'a>> {
    recursive(|expr| {
        let hex = just("0x")
            .or(just("0X"))
            .ignore_then(
                text::digits(16)
                    .at_least(1)
                    .to_slice()
                    .map(|s: &str| i64::from_str_radix(s, 16).unwrap_or(i64::MAX)),
            )
            .map(Expr::Int);
        let int = text::int(10)
            .to_slice()
            .map(|s: &str| Expr::Int(s.parse().unwrap_or(i64::MAX)));
        let ident = text::ascii::ident().map(|s: &str| Expr::Ident(s.to_string()));

        let atom = choice((
            hex,
            int,
            ident,
            expr.clone()
                .delimited_by(just('(').padded(), just(')').padded()),
        ))
        .padded();

        #[derive(Clone)]
        enum Postfix {
            Field(String),
            Index(Expr),
        }

        let postfix_op = choice((
            just("->")
                .ignore_then(text::ascii::ident().padded())
                .map(|s: &str| Postfix::Field(s.to_string())),
            just('.')
                .ignore_then(text::ascii::ident().padded())
                .map(|s: &str| Postfix::Field(s.to_string())),
            expr.clone()
                .delimited_by(just('[').padded(), just(']').padded())
                .map(Postfix::Index),
        ));

        let postfixed = atom.foldl(postfix_op.repeated(), |acc, op| match op {
            Postfix::Field(name) => Expr::Field(Box::new(acc), name),
            Postfix::Index(idx) => Expr::Index(Box::new(acc), Box::new(idx)),
        });

        let unary_op = choice((
            just('*').padded().to(UnaryOp::Deref),
            just('-').padded().to(UnaryOp::Neg),
        ));
        let unary = unary_op
            .repeated()
            .foldr(postfixed, |op, rhs| Expr::Unary(op, Box::new(rhs)));

        let product_op = choice((
            just('*').padded().to(BinOp::Mul),
            just('/').padded().to(BinOp::Div),
        ));
        let product = unary.clone().foldl(
            product_op.then(unary).repeated(),
            |lhs, (op, rhs)| Expr::Binary(op, Box::new(lhs), Box::new(rhs)),
        );

        let sum_op = choice((
            just('+').padded().to(BinOp::Add),
            just('-').padded().to(BinOp::Sub),
        ));
        product.clone().foldl(
            sum_op.then(product).repeated(),
            |lhs, (op, rhs)| Expr::Binary(op, Box::new(lhs), Box::new(rhs)),
        )
    })
}

pub fn parse(input: &str) -> Result<Expr, Error> {
    parser()
        .then_ignore(end())
        .parse(input)
        .into_result()
        .map_err(|errors| {
            Error::ExpressionParse(errors.into_iter().map(|e| e.to_string()).join("; "))
        })
}

/// Evaluation result: either a plain number or a materialized variable.
#[derive(Debug, Clone)]
pub enum ExprValue {
    Int(i64),
    Float(f64),
    Var(VariableView),
}

impl ExprValue {
    pub fn render(&self) -> String {
        match self {
            ExprValue::Int(v) => v.to_string(),
            ExprValue::Float(v) => v.to_string(),
            ExprValue::Var(view) => view.value.clone(),
        }
    }

    pub fn type_name(&self) -> String {
        match self {
            ExprValue::Int(_) => "int".to_string(),
            ExprValue::Float(_) => "float".to_string(),
            ExprValue::Var(view) => view.type_name.clone(),
        }
    }

    fn as_number(&self, debugee: Option<&Debugee>) -> Result<Number, Error> {
        match self {
            ExprValue::Int(v) => Ok(Number::Int(*v)),
            ExprValue::Float(v) => Ok(Number::Float(*v)),
            ExprValue::Var(view) => {
                let raw = view.raw.as_ref().ok_or(Error::NotAddressable)?;
                let type_view = debugee.and_then(|d| view.type_view(d));
                let is_float = matches!(
                    type_view.as_ref().map(|v| &v.kind),
                    Some(TypeKind::Scalar(e)) if *e == gimli::DW_ATE_float
                );
                if is_float {
                    let v = match raw.len() {
                        4 => {
                            f32::from_ne_bytes(raw[..4].try_into().expect("checked len")) as f64
                        }
                        _ => {
                            let mut buf = [0u8; 8];
                            let n = raw.len().min(8);
                            buf[..n].copy_from_slice(&raw[..n]);
                            f64::from_ne_bytes(buf)
                        }
                    };
                    return Ok(Number::Float(v));
                }

                let signed = matches!(
                    type_view.as_ref().map(|v| &v.kind),
                    Some(TypeKind::Scalar(e))
                        if *e == gimli::DW_ATE_signed || *e == gimli::DW_ATE_signed_char
                );
                let mut buf = [0u8; 8];
                let n = raw.len().min(8);
                buf[..n].copy_from_slice(&raw[..n]);
                let raw_u64 = u64::from_ne_bytes(buf);
                let v = if signed && n < 8 {
                    let shift = 64 - n * 8;
                    ((raw_u64 << shift) as i64) >> shift
                } else {
                    raw_u64 as i64
                };
                Ok(Number::Int(v))
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Number {
    Int(i64),
    Float(f64),
}

/// Evaluate an expression against a frame.
pub fn evaluate(
    ctx: &FrameContext,
    expr: &Expr,
    semantics: DivisionSemantics,
) -> Result<ExprValue, Error> {
    match expr {
        Expr::Int(v) => Ok(ExprValue::Int(*v)),
        Expr::Ident(name) => Ok(ExprValue::Var(variable::read_variable(ctx, name)?)),
        Expr::Unary(UnaryOp::Neg, inner) => {
            let value = evaluate(ctx, inner, semantics)?;
            match value.as_number(Some(ctx.debugee))? {
                Number::Int(v) => Ok(ExprValue::Int(-v)),
                Number::Float(v) => Ok(ExprValue::Float(-v)),
            }
        }
        Expr::Unary(UnaryOp::Deref, inner) => {
            let value = evaluate(ctx, inner, semantics)?;
            let ExprValue::Var(view) = value else {
                return Err(Error::TypeMismatch("dereference of a non-pointer value"));
            };
            let children = variable::children(ctx.debugee, ctx.pid, &view)?;
            let is_pointer = view
                .type_view(ctx.debugee)
                .map(|v| v.is_pointer())
                .unwrap_or(false);
            if !is_pointer {
                return Err(Error::TypeMismatch("dereference of a non-pointer value"));
            }
            children
                .into_iter()
                .next()
                .ok_or(Error::TypeMismatch("dereference of a null pointer"))
                .map(ExprValue::Var)
        }
        Expr::Field(base, field) => {
            let value = evaluate(ctx, base, semantics)?;
            let ExprValue::Var(view) = value else {
                return Err(Error::TypeMismatch("field access on a non-composite value"));
            };
            // `->` and `.` are interchangeable: auto-deref one pointer level
            let target = if view
                .type_view(ctx.debugee)
                .map(|v| v.is_pointer())
                .unwrap_or(false)
            {
                variable::children(ctx.debugee, ctx.pid, &view)?
                    .into_iter()
                    .next()
                    .ok_or(Error::TypeMismatch("field access through a null pointer"))?
            } else {
                view
            };

            variable::children(ctx.debugee, ctx.pid, &target)?
                .into_iter()
                .find(|child| child.name == *field)
                .map(ExprValue::Var)
                .ok_or_else(|| Error::UnboundIdentifier(field.clone()))
        }
        Expr::Index(base, index) => {
            let idx = match evaluate(ctx, index, semantics)?.as_number(Some(ctx.debugee))? {
                Number::Int(v) if v >= 0 => v as usize,
                _ => return Err(Error::TypeMismatch("index must be a non-negative integer")),
            };
            let value = evaluate(ctx, base, semantics)?;
            let ExprValue::Var(view) = value else {
                return Err(Error::TypeMismatch("indexing a non-array value"));
            };

            let type_view = view
                .type_view(ctx.debugee)
                .ok_or(Error::TypeNotFound)?;
            match type_view.kind {
                TypeKind::Array { element, .. } => {
                    let parent_addr = view.address.ok_or(Error::NotAddressable)?;
                    let elem_size = element
                        .map(|e| {
                            r#type::type_view(
                                ctx.debugee.debug_info().dwarf(),
                                ctx.debugee.debug_info().unit(view.unit_idx),
                                e,
                            )
                        })
                        .transpose()?
                        .and_then(|v| v.byte_size)
                        .unwrap_or(8) as usize;
                    variable::read_at_address(
                        ctx.debugee,
                        ctx.pid,
                        format!("{}[{idx}]", view.name),
                        view.unit_idx,
                        element,
                        parent_addr + idx * elem_size,
                    )
                    .map(ExprValue::Var)
                }
                TypeKind::Pointer { pointee } => {
                    let raw = view.raw.as_ref().ok_or(Error::NotAddressable)?;
                    let mut buf = [0u8; 8];
                    let n = raw.len().min(8);
                    buf[..n].copy_from_slice(&raw[..n]);
                    let base_addr = u64::from_ne_bytes(buf) as usize;
                    let elem_size = pointee
                        .map(|e| {
                            r#type::type_view(
                                ctx.debugee.debug_info().dwarf(),
                                ctx.debugee.debug_info().unit(view.unit_idx),
                                e,
                            )
                        })
                        .transpose()?
                        .and_then(|v| v.byte_size)
                        .unwrap_or(8) as usize;
                    variable::read_at_address(
                        ctx.debugee,
                        ctx.pid,
                        format!("{}[{idx}]", view.name),
                        view.unit_idx,
                        pointee,
                        base_addr + idx * elem_size,
                    )
                    .map(ExprValue::Var)
                }
                _ => Err(Error::TypeMismatch("indexing a non-array value")),
            }
        }
        Expr::Binary(op, lhs, rhs) => {
            let lhs = evaluate(ctx, lhs, semantics)?.as_number(Some(ctx.debugee))?;
            let rhs = evaluate(ctx, rhs, semantics)?.as_number(Some(ctx.debugee))?;
            apply_binary(*op, lhs, rhs, semantics)
        }
    }
}

fn apply_binary(
    op: BinOp,
    lhs: Number,
    rhs: Number,
    semantics: DivisionSemantics,
) -> Result<ExprValue, Error> {
    let as_float = matches!(lhs, Number::Float(_))
        || matches!(rhs, Number::Float(_))
        || (op == BinOp::Div && semantics == DivisionSemantics::Float);

    if as_float {
        let l = match lhs {
            Number::Int(v) => v as f64,
            Number::Float(v) => v,
        };
        let r = match rhs {
            Number::Int(v) => v as f64,
            Number::Float(v) => v,
        };
        let result = match op {
            BinOp::Add => l + r,
            BinOp::Sub => l - r,
            BinOp::Mul => l * r,
            BinOp::Div => {
                if r == 0.0 {
                    return Err(Error::DivideByZero);
                }
                l / r
            }
        };
        return Ok(ExprValue::Float(result));
    }

    let (Number::Int(l), Number::Int(r)) = (lhs, rhs) else {
        unreachable!("float operands handled above");
    };
    let result = match op {
        BinOp::Add => l.wrapping_add(r),
        BinOp::Sub => l.wrapping_sub(r),
        BinOp::Mul => l.wrapping_mul(r),
        BinOp::Div => {
            if r == 0 {
                return Err(Error::DivideByZero);
            }
            match semantics {
                DivisionSemantics::Truncating => l / r,
                DivisionSemantics::Floor => {
                    let q = l / r;
                    if (l % r != 0) && ((l < 0) != (r < 0)) {
                        q - 1
                    } else {
                        q
                    }
                }
                DivisionSemantics::Float => unreachable!("float division handled above"),
            }
        }
    };
    Ok(ExprValue::Int(result))
}

#[cfg(test)]
mod test {
    use super::*;

    fn ident(name: &str) -> Expr {
        Expr::Ident(name.to_string())
    }

    #[test]
    fn test_expr_parsing() {
        struct TestCase {
            string: &'static str,
            expr: Expr,
        }
        let test_cases = vec![
            TestCase {
                string: "a",
                expr: ident("a"),
            },
            TestCase {
                string: "a + b",
                expr: Expr::Binary(BinOp::Add, Box::new(ident("a")), Box::new(ident("b"))),
            },
            TestCase {
                string: "a + b * c",
                expr: Expr::Binary(
                    BinOp::Add,
                    Box::new(ident("a")),
                    Box::new(Expr::Binary(
                        BinOp::Mul,
                        Box::new(ident("b")),
                        Box::new(ident("c")),
                    )),
                ),
            },
            TestCase {
                string: "(a + b) / 2",
                expr: Expr::Binary(
                    BinOp::Div,
                    Box::new(Expr::Binary(
                        BinOp::Add,
                        Box::new(ident("a")),
                        Box::new(ident("b")),
                    )),
                    Box::new(Expr::Int(2)),
                ),
            },
            TestCase {
                string: "*p",
                expr: Expr::Unary(UnaryOp::Deref, Box::new(ident("p"))),
            },
            TestCase {
                string: "**p.field",
                expr: Expr::Unary(
                    UnaryOp::Deref,
                    Box::new(Expr::Unary(
                        UnaryOp::Deref,
                        Box::new(Expr::Field(Box::new(ident("p")), "field".to_string())),
                    )),
                ),
            },
            TestCase {
                string: "s.a.b",
                expr: Expr::Field(
                    Box::new(Expr::Field(Box::new(ident("s")), "a".to_string())),
                    "b".to_string(),
                ),
            },
            TestCase {
                string: "p->next",
                expr: Expr::Field(Box::new(ident("p")), "next".to_string()),
            },
            TestCase {
                string: "arr[2]",
                expr: Expr::Index(Box::new(ident("arr")), Box::new(Expr::Int(2))),
            },
            TestCase {
                string: "arr[i + 1]",
                expr: Expr::Index(
                    Box::new(ident("arr")),
                    Box::new(Expr::Binary(
                        BinOp::Add,
                        Box::new(ident("i")),
                        Box::new(Expr::Int(1)),
                    )),
                ),
            },
            TestCase {
                string: "-x + 0x10",
                expr: Expr::Binary(
                    BinOp::Add,
                    Box::new(Expr::Unary(UnaryOp::Neg, Box::new(ident("x")))),
                    Box::new(Expr::Int(16)),
                ),
            },
        ];

        for tc in test_cases {
            let expr = parse(tc.string).unwrap();
            assert_eq!(expr, tc.expr, "input: {}", tc.string);
        }
    }

    #[test]
    fn test_expr_parse_errors() {
        for input in ["a +", "(a", "a.b.", "[1]", "a b"] {
            assert!(parse(input).is_err(), "input should fail: {input}");
        }
    }

    #[test]
    fn test_division_semantics() {
        let div = |l, r, s| apply_binary(BinOp::Div, Number::Int(l), Number::Int(r), s);

        match div(-7, 2, DivisionSemantics::Truncating).unwrap() {
            ExprValue::Int(v) => assert_eq!(v, -3),
            _ => panic!("expected int"),
        }
        match div(-7, 2, DivisionSemantics::Floor).unwrap() {
            ExprValue::Int(v) => assert_eq!(v, -4),
            _ => panic!("expected int"),
        }
        match div(-7, 2, DivisionSemantics::Float).unwrap() {
            ExprValue::Float(v) => assert_eq!(v, -3.5),
            _ => panic!("expected float"),
        }
        assert!(matches!(
            div(1, 0, DivisionSemantics::Truncating),
            Err(Error::DivideByZero)
        ));
    }
}
