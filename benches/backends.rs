use criterion::{black_box, criterion_group, criterion_main, Criterion};

use niobium::backend::{Backend, PreparedBackend};
use niobium::{compiler, eval, lexer, parser, vm};

const FIB: &str = "
def fib = func(n) {
    if n < 2 { n } else { fib(n - 1) + fib(n - 2) }
}
fib(15)
";

const LOOP_SUM: &str = "
def s = 0
for (def i = 0; i < 1000; i = i + 1) {
    s = s + i
}
s
";

const COLLECTIONS: &str = "
def items = []
for (def i = 0; i < 100; i = i + 1) {
    push(items, i * 2)
}
def h = {}
for i, x in items {
    h[i] = x
}
len(h)
";

fn bench_frontend(c: &mut Criterion) {
    c.bench_function("frontend/tokenize", |b| {
        b.iter(|| lexer::tokenize(black_box(FIB)))
    });
    c.bench_function("frontend/parse", |b| {
        b.iter(|| parser::parse(black_box(FIB)).expect("parse failed"))
    });
    let program = parser::parse(FIB).expect("parse failed");
    c.bench_function("frontend/compile", |b| {
        b.iter(|| compiler::compile(black_box(&program)).expect("compile failed"))
    });
}

fn bench_backends(c: &mut Criterion) {
    let cases = [
        ("fib", FIB),
        ("loop_sum", LOOP_SUM),
        ("collections", COLLECTIONS),
    ];
    for (name, source) in cases {
        let program = parser::parse(source).expect("parse failed");

        let interpreter = eval::Interpreter::new();
        let prepared = interpreter.prepare(&program).expect("prepare failed");
        c.bench_function(&format!("eval/{name}"), |b| {
            b.iter(|| prepared.run().expect("run failed"))
        });

        let machine = vm::Vm::new();
        let prepared = machine.prepare(&program).expect("prepare failed");
        c.bench_function(&format!("vm/{name}"), |b| {
            b.iter(|| prepared.run().expect("run failed"))
        });
    }
}

criterion_group!(benches, bench_frontend, bench_backends);
criterion_main!(benches);
