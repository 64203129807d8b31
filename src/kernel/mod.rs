//! Streaming map/reduce kernels applied to each row during import.
//!
//! The operation is resolved once from its name into an [`Operation`], and a [`Kernel`] is
//! instantiated for the element type of the measure. Elements equal to the fill value are
//! excluded from reductions and passed through unchanged by elementwise operations.

mod stream;

pub use stream::{BlockView, Kernel, Partial, StreamContext};

use num_traits::{Num, NumCast};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operation {
    /// Plain copy of every element.
    Copy,
    /// Collapse the implicit dimensions of a row to one value.
    Reduce(Reduction),
    /// Elementwise operation with one scalar argument.
    Scalar(ScalarOp, f64),
    /// Elementwise math function.
    Unary(UnaryOp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    Max,
    Min,
    Avg,
    Sum,
    Std,
    Var,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarOp {
    SumScalar,
    MulScalar,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Abs,
    Sqr,
    Sqrt,
    Ceil,
    Floor,
    Round,
    Int,
    Nint,
    Exp,
    Log,
    Log10,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Reci,
    Not,
}

impl Operation {
    /// Resolve an operation name and its scalar arguments. No name means a plain copy.
    pub fn parse(name: Option<&str>, args: &[f64]) -> Result<Operation> {
        use Operation::*;

        let name = match name {
            Some(n) => n.trim().to_ascii_lowercase(),
            None => return Self::no_args("nop", args).map(|_| Copy),
        };

        let op = match name.as_str() {
            "nop" | "stream" => Copy,

            "max" => Reduce(Reduction::Max),
            "min" => Reduce(Reduction::Min),
            "avg" => Reduce(Reduction::Avg),
            "sum" => Reduce(Reduction::Sum),
            "std" => Reduce(Reduction::Std),
            "var" => Reduce(Reduction::Var),

            "sum_scalar" | "mul_scalar" | "pow" => {
                let scalar = match args {
                    [s] => *s,
                    _ => {
                        return Err(Error::Param(format!(
                            "operation '{name}' takes exactly one argument, got {}",
                            args.len()
                        )))
                    }
                };
                let op = match name.as_str() {
                    "sum_scalar" => ScalarOp::SumScalar,
                    "mul_scalar" => ScalarOp::MulScalar,
                    _ => ScalarOp::Pow,
                };
                return Ok(Scalar(op, scalar));
            }

            "abs" => Unary(UnaryOp::Abs),
            "sqr" => Unary(UnaryOp::Sqr),
            "sqrt" => Unary(UnaryOp::Sqrt),
            "ceil" => Unary(UnaryOp::Ceil),
            "floor" => Unary(UnaryOp::Floor),
            "round" => Unary(UnaryOp::Round),
            "int" => Unary(UnaryOp::Int),
            "nint" => Unary(UnaryOp::Nint),
            "exp" => Unary(UnaryOp::Exp),
            "log" => Unary(UnaryOp::Log),
            "log10" => Unary(UnaryOp::Log10),
            "sin" => Unary(UnaryOp::Sin),
            "cos" => Unary(UnaryOp::Cos),
            "tan" => Unary(UnaryOp::Tan),
            "asin" => Unary(UnaryOp::Asin),
            "acos" => Unary(UnaryOp::Acos),
            "atan" => Unary(UnaryOp::Atan),
            "sinh" => Unary(UnaryOp::Sinh),
            "cosh" => Unary(UnaryOp::Cosh),
            "tanh" => Unary(UnaryOp::Tanh),
            "reci" => Unary(UnaryOp::Reci),
            "not" => Unary(UnaryOp::Not),

            _ => return Err(Error::UnknownOperation(name)),
        };

        Self::no_args(&name, args).map(|_| op)
    }

    fn no_args(name: &str, args: &[f64]) -> Result<()> {
        if args.is_empty() {
            Ok(())
        } else {
            Err(Error::Param(format!(
                "operation '{name}' takes no arguments, got {}",
                args.len()
            )))
        }
    }

    /// Whether the operation collapses a row to a single element.
    pub fn is_reduction(&self) -> bool {
        matches!(self, Operation::Reduce(_))
    }
}

impl ScalarOp {
    #[inline]
    pub fn apply(&self, x: f64, s: f64) -> f64 {
        match self {
            ScalarOp::SumScalar => x + s,
            ScalarOp::MulScalar => x * s,
            ScalarOp::Pow => x.powf(s),
        }
    }

    /// The scalar in the accumulator type `A`, if the operation only adds or multiplies and
    /// `s` is representable in `A` without rounding.
    pub fn exact<A: NumCast>(&self, s: f64) -> Option<A> {
        match self {
            ScalarOp::Pow => None,
            // products of two 64-bit magnitudes still fit in an `i128`
            ScalarOp::SumScalar | ScalarOp::MulScalar if s.abs() <= i64::MAX as f64 => {
                <A as NumCast>::from(s).filter(|a| a.to_f64() == Some(s))
            }
            ScalarOp::SumScalar | ScalarOp::MulScalar => None,
        }
    }

    /// Apply with a scalar resolved by [`ScalarOp::exact`].
    #[inline]
    pub fn apply_exact<A: Num>(&self, x: A, s: A) -> A {
        match self {
            ScalarOp::SumScalar => x + s,
            _ => x * s,
        }
    }
}

impl UnaryOp {
    /// Whether the operation is exact on integers without going through `f64`.
    pub fn is_exact(&self) -> bool {
        use UnaryOp::*;

        matches!(self, Abs | Sqr | Not | Ceil | Floor | Round | Nint | Int)
    }

    /// Apply to an integer accumulator, only for operations where [`UnaryOp::is_exact`] holds.
    /// Rounding is the identity on integers.
    #[inline]
    pub fn apply_exact<A: Num + PartialOrd + Copy>(&self, x: A) -> A {
        use UnaryOp::*;

        match self {
            Abs if x < A::zero() => A::zero() - x,
            Sqr => x * x,
            Not if x == A::zero() => A::one(),
            Not => A::zero(),
            _ => x,
        }
    }

    #[inline]
    pub fn apply(&self, x: f64) -> f64 {
        use UnaryOp::*;

        match self {
            Abs => x.abs(),
            Sqr => x * x,
            Sqrt => x.sqrt(),
            Ceil => x.ceil(),
            Floor => x.floor(),
            Round | Nint => (x + 0.5).floor(),
            Int => x.trunc(),
            Exp => x.exp(),
            Log => x.ln(),
            Log10 => x.log10(),
            Sin => x.sin(),
            Cos => x.cos(),
            Tan => x.tan(),
            Asin => x.asin(),
            Acos => x.acos(),
            Atan => x.atan(),
            Sinh => x.sinh(),
            Cosh => x.cosh(),
            Tanh => x.tanh(),
            Reci => 1.0 / x,
            Not => {
                if x == 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}
