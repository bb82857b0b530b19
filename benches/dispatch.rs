use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use lyra_vm::{Function, Instruction, Opcode, Runtime, Value};

fn loop_function(runtime: &Runtime, iterations: i32) -> u32 {
    // sum = 0; i = 0; while i < iterations { sum += i; i += 1 }; sum
    let mut builder = Function::builder().name("spin").max_stack(6);
    let k0 = builder.constant(Value::small_int(0)) as i32;
    let k1 = builder.constant(Value::small_int(1)) as i32;
    let kn = builder.constant(Value::small_int(iterations)) as i32;
    runtime.register_function(
        builder
            .instruction(Instruction::abx(Opcode::LoadK, 0, k0))
            .instruction(Instruction::abx(Opcode::LoadK, 1, k0))
            .instruction(Instruction::abx(Opcode::LoadK, 2, kn))
            .instruction(Instruction::abx(Opcode::LoadK, 3, k1))
            .instruction(Instruction::abc(Opcode::Lt, 4, 1, 2))
            .instruction(Instruction::abx(Opcode::JumpIfFalse, 4, 4))
            .instruction(Instruction::abc(Opcode::Add, 0, 0, 1))
            .instruction(Instruction::abc(Opcode::Add, 1, 1, 3))
            .instruction(Instruction::abx(Opcode::Jump, 0, -4))
            .instruction(Instruction::abc(Opcode::Return, 0, 2, 0))
            .build(),
    )
}

fn counter_functions(runtime: &Runtime) -> (u32, u32) {
    let mut builder = Function::builder().name("tick").max_stack(2);
    let k1 = builder.constant(Value::small_int(1)) as i32;
    let tick = runtime.register_function(
        builder
            .instruction(Instruction::ab(Opcode::GetUpvalue, 0, 0))
            .instruction(Instruction::abx(Opcode::LoadK, 1, k1))
            .instruction(Instruction::abc(Opcode::Add, 0, 0, 1))
            .instruction(Instruction::ab(Opcode::SetUpvalue, 0, 0))
            .instruction(Instruction::abc(Opcode::Return, 0, 2, 0))
            .build(),
    );
    let mut builder = Function::builder().name("make_counter").max_stack(3);
    let ktick = builder.constant(Value::function(tick)) as i32;
    let k0 = builder.constant(Value::small_int(0)) as i32;
    let make_counter = runtime.register_function(
        builder
            .instruction(Instruction::abx(Opcode::LoadK, 0, ktick))
            .instruction(Instruction::abx(Opcode::LoadK, 1, k0))
            .instruction(Instruction::abc(Opcode::MakeClosure, 2, 0, 1))
            .instruction(Instruction::abc(Opcode::Return, 2, 2, 0))
            .build(),
    );
    (tick, make_counter)
}

pub fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    group.sample_size(50);

    for iterations in [1_000, 10_000] {
        let runtime = Runtime::new();
        let id = loop_function(&runtime, iterations);
        group.bench_function(BenchmarkId::new("arith-loop", iterations), |b| {
            b.iter(|| runtime.execute(id, vec![]).unwrap());
        });
    }

    let runtime = Runtime::new();
    let (_, make_counter) = counter_functions(&runtime);
    group.bench_function("closure-counter", |b| {
        b.iter(|| {
            let counter = runtime.execute(make_counter, vec![]).unwrap()[0];
            runtime.release_value(counter);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_dispatch);
criterion_main!(benches);
