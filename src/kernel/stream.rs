use num_traits::Zero;

use super::{Operation, Reduction};
use crate::error::{Error, Result};
use crate::types::{typed, Element};

/// Position of a delivered sub-block within the row region, in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockView {
    pub offset: usize,
    pub len: usize,
}

/// Accumulators of a reduction over one sub-block, in the accumulator type `A` of the element.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Partial<A> {
    pub value: A,
    pub value2: f64,
    pub count: u64,
}

/// Running state for one row.
///
/// Created fresh per row and dropped once the row result has been written to `out`.
#[derive(Debug)]
pub struct StreamContext<'a, T: Element> {
    pub value: T::Acc,
    /// Sum of squares, only maintained for `var` and `std`.
    pub value2: f64,
    pub count: u64,
    /// At least one non-fill element has been folded.
    pub valid: bool,
    pub out: &'a mut [T],
}

impl<'a, T: Element> StreamContext<'a, T> {
    pub fn new(out: &'a mut [T]) -> StreamContext<'a, T> {
        StreamContext {
            value: T::Acc::zero(),
            value2: 0.0,
            count: 0,
            valid: false,
            out,
        }
    }
}

/// An [`Operation`] bound to an element type and fill value.
#[derive(Debug, Clone, Copy)]
pub struct Kernel<T> {
    op: Operation,
    fill: Option<T>,
}

impl<T: Element> Kernel<T> {
    pub fn new(op: Operation, fill: Option<T>) -> Kernel<T> {
        Kernel { op, fill }
    }

    pub fn operation(&self) -> Operation {
        self.op
    }

    /// Process one sub-block of a row.
    ///
    /// Elementwise operations write straight into the context output at the block offset and
    /// return `None`. Reductions return the partial accumulators of the block, to be folded by
    /// [`Kernel::stream_finish`].
    pub fn stream_step(
        &self,
        view: BlockView,
        raw: &[u8],
        ctx: &mut StreamContext<'_, T>,
    ) -> Result<Option<Partial<T::Acc>>> {
        let values = typed::<T>(raw)?;

        if values.len() != view.len {
            return Err(Error::Type(format!(
                "block of {} bytes does not hold {} elements",
                raw.len(),
                view.len
            )));
        }

        let fill = self.fill;

        match self.op {
            Operation::Reduce(r) => Ok(Some(partial(r, &values, fill))),
            op => {
                let row_len = ctx.out.len();
                let out = ctx
                    .out
                    .get_mut(view.offset..view.offset + view.len)
                    .ok_or_else(|| {
                        Error::Invariant(format!(
                            "block {}..{} outside of row of {} elements",
                            view.offset,
                            view.offset + view.len,
                            row_len
                        ))
                    })?;

                match op {
                    Operation::Copy => out.copy_from_slice(&values),
                    Operation::Scalar(s, arg) => match s.exact::<T::Acc>(arg) {
                        Some(a) => map(&values, out, fill, |x| {
                            T::from_acc(s.apply_exact(x.acc(), a))
                        }),
                        None => map(&values, out, fill, |x| T::narrow(s.apply(x.widen(), arg))),
                    },
                    Operation::Unary(u) if T::INTEGER && u.is_exact() => {
                        map(&values, out, fill, |x| T::from_acc(u.apply_exact(x.acc())))
                    }
                    Operation::Unary(u) => map(&values, out, fill, |x| T::narrow(u.apply(x.widen()))),
                    Operation::Reduce(_) => unreachable!(),
                }

                Ok(None)
            }
        }
    }

    /// Fold `partial` into `ctx` and write the current row result to its output.
    ///
    /// `var` and `std` are recomputed from the cumulative accumulators, so after the last
    /// block the output holds the final value.
    pub fn stream_finish(&self, ctx: &mut StreamContext<'_, T>, partial: Option<Partial<T::Acc>>) {
        let r = match self.op {
            Operation::Reduce(r) => r,
            _ => return,
        };

        if let Some(p) = partial {
            fold(r, ctx, p);
        }

        ctx.valid = ctx.count > 0;

        let result = if ctx.valid {
            value(r, ctx)
        } else {
            self.fill.unwrap_or_else(|| T::narrow(f64::NAN))
        };

        if let Some(o) = ctx.out.first_mut() {
            *o = result;
        }
    }

    /// Run the kernel over a whole row delivered as one block.
    pub fn apply(&self, raw: &[u8], out: &mut [T]) -> Result<()> {
        let len = raw.len() / std::mem::size_of::<T>();
        let mut ctx = StreamContext::new(out);
        let p = self.stream_step(BlockView { offset: 0, len }, raw, &mut ctx)?;
        self.stream_finish(&mut ctx, p);
        Ok(())
    }
}

fn map<T, F>(values: &[T], out: &mut [T], fill: Option<T>, f: F)
where
    T: Element,
    F: Fn(T) -> T,
{
    for (o, &x) in out.iter_mut().zip(values) {
        *o = if x.is_fill(fill) { x } else { f(x) };
    }
}

fn partial<T: Element>(r: Reduction, values: &[T], fill: Option<T>) -> Partial<T::Acc> {
    let valid = values.iter().copied().filter(|x| !x.is_fill(fill));

    match r {
        Reduction::Max | Reduction::Min => {
            let mut p = Partial::default();
            let mut best: Option<T> = None;

            for x in valid {
                p.count += 1;
                best = match best {
                    Some(b) if r == Reduction::Max && !(x > b) => Some(b),
                    Some(b) if r == Reduction::Min && !(x < b) => Some(b),
                    _ => Some(x),
                };
            }

            p.value = best.map(T::acc).unwrap_or_default();
            p
        }
        Reduction::Sum | Reduction::Avg => valid.fold(Partial::default(), |mut p, x| {
            p.value = p.value + x.acc();
            p.count += 1;
            p
        }),
        Reduction::Var | Reduction::Std => valid.fold(Partial::default(), |mut p, x| {
            let w = x.widen();
            p.value = p.value + x.acc();
            p.value2 += w * w;
            p.count += 1;
            p
        }),
    }
}

fn fold<T: Element>(r: Reduction, ctx: &mut StreamContext<'_, T>, p: Partial<T::Acc>) {
    match r {
        Reduction::Max | Reduction::Min => {
            if p.count > 0 {
                let replace = ctx.count == 0
                    || (r == Reduction::Max && p.value > ctx.value)
                    || (r == Reduction::Min && p.value < ctx.value);
                if replace {
                    ctx.value = p.value;
                }
                ctx.count += p.count;
            }
        }
        Reduction::Sum => {
            // running sum of partial sums: the count only flags validity.
            if p.count > 0 {
                ctx.value = ctx.value + p.value;
                ctx.count = 1;
            }
        }
        Reduction::Avg => {
            ctx.value = ctx.value + p.value;
            ctx.count += p.count;
        }
        Reduction::Var | Reduction::Std => {
            ctx.value = ctx.value + p.value;
            ctx.value2 += p.value2;
            ctx.count += p.count;
        }
    }
}

/// Row result of a reduction over at least one valid element.
fn value<T: Element>(r: Reduction, ctx: &StreamContext<'_, T>) -> T {
    match r {
        Reduction::Max | Reduction::Min | Reduction::Sum => T::from_acc(ctx.value),
        Reduction::Avg => T::from_acc(ctx.value / T::count_acc(ctx.count)),
        Reduction::Var | Reduction::Std => {
            let n = ctx.count as f64;
            let sum = T::acc_widen(ctx.value);

            let mut var = (ctx.value2 - sum * sum / n) / n;
            if ctx.count > 1 {
                var *= n / (n - 1.0);
            }

            T::narrow(if r == Reduction::Std { var.sqrt() } else { var })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{ScalarOp, UnaryOp};
    use byte_slice_cast::AsByteSlice;

    const FILL: f32 = -999.0;

    fn reduce(r: Reduction, values: &[f32], fill: Option<f32>) -> f32 {
        let k = Kernel::new(Operation::Reduce(r), fill);
        let mut out = [0f32];
        k.apply(values.as_byte_slice(), &mut out).unwrap();
        out[0]
    }

    #[test]
    fn sum_partial_skips_fill() {
        let k = Kernel::new(Operation::Reduce(Reduction::Sum), Some(FILL));
        let v = [1.0f32, 2.0, FILL, 4.0];
        let mut out = [0f32];
        let mut ctx = StreamContext::new(&mut out);

        let p = k
            .stream_step(BlockView { offset: 0, len: 4 }, v.as_byte_slice(), &mut ctx)
            .unwrap()
            .unwrap();
        assert_eq!(p.value, 7.0);
        assert_eq!(p.count, 3);

        k.stream_finish(&mut ctx, Some(p));
        assert!(ctx.valid);
        assert_eq!(ctx.value, 7.0);
        assert_eq!(ctx.count, 1);
        assert_eq!(out[0], 7.0);
    }

    #[test]
    fn reductions() {
        let v = [1.0f32, 2.0, FILL, 4.0];
        assert_eq!(reduce(Reduction::Sum, &v, Some(FILL)), 7.0);
        assert_eq!(reduce(Reduction::Avg, &v, Some(FILL)), 7.0 / 3.0);
        assert_eq!(reduce(Reduction::Max, &v, Some(FILL)), 4.0);
        assert_eq!(reduce(Reduction::Min, &v, Some(FILL)), 1.0);

        // sample variance of 1, 2, 4
        let var = reduce(Reduction::Var, &v, Some(FILL));
        assert!((var - 7.0 / 3.0).abs() < 1e-6);
        let std = reduce(Reduction::Std, &v, Some(FILL));
        assert!((std - (7.0f32 / 3.0).sqrt()).abs() < 1e-6);

        // without fill the sentinel is an ordinary value
        assert_eq!(reduce(Reduction::Min, &v, None), FILL);
    }

    #[test]
    fn variance_single_element_no_correction() {
        assert_eq!(reduce(Reduction::Var, &[5.0], None), 0.0);
        assert_eq!(reduce(Reduction::Std, &[5.0, FILL], Some(FILL)), 0.0);
    }

    #[test]
    fn all_fill_gives_fill() {
        let v = [FILL, FILL];
        assert_eq!(reduce(Reduction::Avg, &v, Some(FILL)), FILL);
        assert_eq!(reduce(Reduction::Max, &v, Some(FILL)), FILL);
        assert!(reduce(Reduction::Avg, &[], None).is_nan());
    }

    #[test]
    fn blocks_fold_to_whole() {
        let v: Vec<f64> = (0..100).map(|i| ((i * 37) % 23) as f64 - 7.0).collect();

        for r in [
            Reduction::Max,
            Reduction::Min,
            Reduction::Avg,
            Reduction::Sum,
            Reduction::Std,
            Reduction::Var,
        ] {
            let k = Kernel::new(Operation::Reduce(r), Some(-7.0));

            let mut whole = [0f64];
            k.apply(v.as_byte_slice(), &mut whole).unwrap();

            let mut out = [0f64];
            let mut ctx = StreamContext::new(&mut out);
            for (i, block) in v.chunks(13).enumerate() {
                let view = BlockView {
                    offset: i * 13,
                    len: block.len(),
                };
                let p = k.stream_step(view, block.as_byte_slice(), &mut ctx).unwrap();
                k.stream_finish(&mut ctx, p);
            }

            assert!(
                (out[0] - whole[0]).abs() < 1e-9,
                "{r:?}: {} != {}",
                out[0],
                whole[0]
            );
        }
    }

    #[test]
    fn sum_of_blocks_is_not_averaged() {
        let k = Kernel::new(Operation::Reduce(Reduction::Sum), None);
        let mut out = [0i32];
        let mut ctx = StreamContext::new(&mut out);

        for (i, block) in [[1i32, 2], [3, 4], [5, 6]].iter().enumerate() {
            let p = k
                .stream_step(
                    BlockView {
                        offset: i * 2,
                        len: 2,
                    },
                    block.as_byte_slice(),
                    &mut ctx,
                )
                .unwrap();
            k.stream_finish(&mut ctx, p);
        }

        assert_eq!(ctx.count, 1);
        assert_eq!(out[0], 21);
    }

    #[test]
    fn integer_reductions() {
        let v = [3i16, -2, 9, 9, -32768];
        let k = Kernel::new(Operation::Reduce(Reduction::Max), Some(-32768i16));
        let mut out = [0i16];
        k.apply(v.as_byte_slice(), &mut out).unwrap();
        assert_eq!(out[0], 9);

        let k = Kernel::new(Operation::Reduce(Reduction::Avg), Some(-32768i16));
        k.apply(v.as_byte_slice(), &mut out).unwrap();
        assert_eq!(out[0], 4); // 19 / 4 truncated
    }

    #[test]
    fn large_i64_stays_exact() {
        let big = 1i64 << 53;
        let v = [big, 1];

        let k = Kernel::new(Operation::Reduce(Reduction::Sum), None);
        let mut out = [0i64];
        k.apply(v.as_byte_slice(), &mut out).unwrap();
        assert_eq!(out[0], big + 1);

        let k = Kernel::new(Operation::Reduce(Reduction::Avg), None);
        k.apply([big + 1, big + 3].as_byte_slice(), &mut out).unwrap();
        assert_eq!(out[0], big + 2);

        let k = Kernel::new(Operation::Reduce(Reduction::Max), None);
        k.apply([big + 1, big].as_byte_slice(), &mut out).unwrap();
        assert_eq!(out[0], big + 1);

        // saturates instead of wrapping
        let k = Kernel::new(Operation::Reduce(Reduction::Sum), None);
        k.apply([i64::MAX, 5].as_byte_slice(), &mut out).unwrap();
        assert_eq!(out[0], i64::MAX);

        let mut out = [0i64; 2];
        Kernel::new(Operation::Scalar(ScalarOp::SumScalar, 0.0), None)
            .apply([big + 1, -big - 1].as_byte_slice(), &mut out)
            .unwrap();
        assert_eq!(out, [big + 1, -big - 1]);

        Kernel::new(Operation::Scalar(ScalarOp::MulScalar, 2.0), None)
            .apply([big + 1, 3].as_byte_slice(), &mut out)
            .unwrap();
        assert_eq!(out, [2 * big + 2, 6]);

        Kernel::new(Operation::Unary(UnaryOp::Abs), None)
            .apply([-big - 1, 7].as_byte_slice(), &mut out)
            .unwrap();
        assert_eq!(out, [big + 1, 7]);

        // fractional scalars and transcendental functions go through f64
        Kernel::new(Operation::Scalar(ScalarOp::MulScalar, 0.5), None)
            .apply([7i64, -7].as_byte_slice(), &mut out)
            .unwrap();
        assert_eq!(out, [3, -3]);

        Kernel::new(Operation::Unary(UnaryOp::Sqrt), None)
            .apply([16i64, 17].as_byte_slice(), &mut out)
            .unwrap();
        assert_eq!(out, [4, 4]);
    }

    #[test]
    fn elementwise_passes_fill() {
        let v = [1i32, -9999, 3, -4];
        let mut out = [0i32; 4];

        Kernel::new(Operation::Scalar(ScalarOp::MulScalar, 3.0), Some(-9999))
            .apply(v.as_byte_slice(), &mut out)
            .unwrap();
        assert_eq!(out, [3, -9999, 9, -12]);

        Kernel::new(Operation::Unary(UnaryOp::Abs), Some(-9999))
            .apply(v.as_byte_slice(), &mut out)
            .unwrap();
        assert_eq!(out, [1, -9999, 3, 4]);

        Kernel::new(Operation::Copy, Some(-9999))
            .apply(v.as_byte_slice(), &mut out)
            .unwrap();
        assert_eq!(out, v);
    }

    #[test]
    fn elementwise_blocks_land_at_offset() {
        let v = [1.0f64, 4.0, 9.0, 16.0, 25.0];
        let k = Kernel::new(Operation::Unary(UnaryOp::Sqrt), None);
        let mut out = [0f64; 5];
        let mut ctx = StreamContext::new(&mut out);

        let p = k
            .stream_step(
                BlockView { offset: 3, len: 2 },
                v[3..].as_byte_slice(),
                &mut ctx,
            )
            .unwrap();
        assert!(p.is_none());
        k.stream_step(BlockView { offset: 0, len: 3 }, v[..3].as_byte_slice(), &mut ctx)
            .unwrap();

        assert_eq!(out, [1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn block_outside_row() {
        let v = [1.0f64, 2.0];
        let k = Kernel::new(Operation::Copy, None);
        let mut out = [0f64; 2];
        let mut ctx = StreamContext::new(&mut out);
        assert!(k
            .stream_step(BlockView { offset: 1, len: 2 }, v.as_byte_slice(), &mut ctx)
            .is_err());
        assert!(k
            .stream_step(BlockView { offset: 0, len: 3 }, v.as_byte_slice(), &mut ctx)
            .is_err());
    }
}
