//! Dispatch throughput benchmarks.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::time::Duration;

use strand::vm::{DataItem, Engine, Function, Instruction, Module, handler_fn};

const STACK: usize = 4096;
const MEMORY: usize = 1024;

/// Counts a local u64 up to `n` through `inc` and `less` operations.
fn counter_module(n: u64) -> Vec<u8> {
    let mut module = Module::new();
    let inc = module.op("inc");
    let less = module.op("less");
    let limit = module.data(DataItem::U64(n));
    module.function(
        Function::new("main")
            .exported()
            .local(8)
            .local(1)
            .label("top")
            .emit_all([
                Instruction::OpBegin,
                Instruction::LocalsAddress(0),
                Instruction::Target,
                Instruction::OpEnd { op: inc, result: 0 },
                Instruction::OpBegin,
                Instruction::LocalsAddress(0),
                Instruction::Param,
                Instruction::DataAddress(limit),
                Instruction::Param,
                Instruction::LocalsAddress(8),
                Instruction::Target,
                Instruction::OpEnd { op: less, result: 0 },
                Instruction::LocalsAddress(8),
                Instruction::BranchIf(0),
            ]),
    );
    module.to_bytes()
}

/// Calls a one-operation function, looping back with `go_to`.
fn call_module() -> Vec<u8> {
    let mut module = Module::new();
    let work = module.op("work");
    let again = module.op("again");
    module.function(Function::new("main").exported().label("top").emit_all([
        Instruction::Call(1),
        Instruction::OpBegin,
        Instruction::OpEnd { op: again, result: 0 },
    ]));
    module.function(
        Function::new("leaf").emit_all([Instruction::OpBegin, Instruction::OpEnd { op: work, result: 0 }]),
    );
    module.to_bytes()
}

fn run_counter(engine: &Engine, bytecode: &[u8]) -> u64 {
    let handle = engine.start(bytecode, "main", MEMORY, STACK).unwrap();
    let mut total = 0;
    engine
        .consume(
            handle,
            handler_fn(|ctx, op| {
                match op.name {
                    "inc" => {
                        let value: u64 = ctx.load(op.targets[0])?;
                        total = value + 1;
                        ctx.store(op.targets[0], total)?;
                    }
                    _ => {
                        let value: u64 = ctx.load(op.params[0])?;
                        let limit: u64 = ctx.load(op.params[1])?;
                        ctx.store(op.targets[0], value < limit)?;
                    }
                }
                Ok(())
            }),
        )
        .unwrap();
    total
}

fn run_calls(engine: &Engine, bytecode: &[u8], n: u64) -> u64 {
    let handle = engine.start(bytecode, "main", MEMORY, STACK).unwrap();
    let mut calls = 0;
    engine
        .consume(
            handle,
            handler_fn(|ctx, op| {
                if op.name == "work" {
                    calls += 1;
                } else if calls < n {
                    ctx.go_to("top")?;
                }
                Ok(())
            }),
        )
        .unwrap();
    calls
}

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(5));

    let engine = Engine::default();
    for n in [1_000u64, 10_000, 100_000] {
        let bytecode = counter_module(n);
        group.bench_with_input(BenchmarkId::new("counter", n), &bytecode, |b, code| {
            b.iter(|| run_counter(&engine, black_box(code)))
        });
    }
    group.finish();
}

fn bench_calls(c: &mut Criterion) {
    let mut group = c.benchmark_group("calls");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(5));

    let engine = Engine::default();
    let bytecode = call_module();
    for n in [1_000u64, 10_000] {
        group.bench_with_input(BenchmarkId::new("go_to_loop", n), &n, |b, &n| {
            b.iter(|| run_calls(&engine, black_box(&bytecode), n))
        });
    }
    group.finish();
}

fn bench_start(c: &mut Criterion) {
    let engine = Engine::default();
    let bytecode = counter_module(1);
    c.bench_function("start_cancel", |b| {
        b.iter(|| {
            let handle = engine
                .start(black_box(&bytecode), "main", MEMORY, STACK)
                .unwrap();
            engine.cancel(handle);
        })
    });
}

criterion_group!(benches, bench_dispatch, bench_calls, bench_start);
criterion_main!(benches);
