use byte_slice_cast::AsByteSlice;
use divan::Bencher;

use fragpop::kernel::{BlockView, Kernel, Operation, StreamContext};

const N: usize = 1 << 16;

fn values() -> Vec<f32> {
    use rand::distributions::Standard;
    use rand::{thread_rng, Rng};

    thread_rng()
        .sample_iter(Standard)
        .take(N)
        .map(|v: f32| if v < 0.05 { -100.0 } else { v * 300.0 })
        .collect()
}

mod reduce {
    use super::*;

    #[divan::bench(args = ["max", "avg", "sum", "std"])]
    fn whole_row(b: Bencher, op: &str) {
        let v = values();
        let k = Kernel::new(Operation::parse(Some(op), &[]).unwrap(), Some(-100.0f32));
        let mut out = [0f32];

        b.bench_local(|| k.apply(v.as_byte_slice(), &mut out).unwrap())
    }

    #[divan::bench]
    fn streamed_var(b: Bencher) {
        let v = values();
        let k = Kernel::new(Operation::parse(Some("var"), &[]).unwrap(), None);
        let mut out = [0f32];

        b.bench_local(|| {
            let mut ctx = StreamContext::new(&mut out);
            for (i, block) in v.chunks(4096).enumerate() {
                let view = BlockView {
                    offset: i * 4096,
                    len: block.len(),
                };
                let p = k.stream_step(view, block.as_byte_slice(), &mut ctx).unwrap();
                k.stream_finish(&mut ctx, p);
            }
        })
    }
}

mod map {
    use super::*;

    #[divan::bench]
    fn mul_scalar(b: Bencher) {
        let v = values();
        let k = Kernel::new(Operation::parse(Some("mul_scalar"), &[2.0]).unwrap(), None);
        let mut out = vec![0f32; N];

        b.bench_local(|| k.apply(v.as_byte_slice(), &mut out).unwrap())
    }

    #[divan::bench]
    fn log10_with_fill(b: Bencher) {
        let v = values();
        let k = Kernel::new(Operation::parse(Some("log10"), &[]).unwrap(), Some(-100.0f32));
        let mut out = vec![0f32; N];

        b.bench_local(|| k.apply(v.as_byte_slice(), &mut out).unwrap())
    }

    #[divan::bench]
    fn copy(b: Bencher) {
        let v = values();
        let k = Kernel::new(Operation::Copy, None);
        let mut out = vec![0f32; N];

        b.bench_local(|| k.apply(v.as_byte_slice(), &mut out).unwrap())
    }
}

fn main() {
    divan::main();
}
