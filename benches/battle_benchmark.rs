use corearena::{Assembler, BattleConfig, BattleSystem};
use criterion::{criterion_group, criterion_main, Criterion};

const BOT_A: &str = "\
.name \"chaser\"
start: inc r0
       cmp r0, #1000
       jl start
       jmp start
";

const BOT_B: &str = "\
.name \"stomper\"
start: mov $0800, #0
       inc r1
       jmp start
";

fn bench_assemble(c: &mut Criterion) {
    let assembler = Assembler::new();
    c.bench_function("assemble_bot", |b| {
        b.iter(|| assembler.assemble_source(BOT_A).unwrap())
    });
}

fn bench_battle_turns(c: &mut Criterion) {
    let mut group = c.benchmark_group("battle");

    group.bench_function("run_100_turns", |b| {
        b.iter(|| {
            let mut system = BattleSystem::new(BattleConfig {
                max_turns: 100,
                seed: 42,
                ..Default::default()
            })
            .unwrap();
            system.load_bot("chaser", BOT_A).unwrap();
            system.load_bot("stomper", BOT_B).unwrap();
            system.run_to_completion().unwrap()
        })
    });

    group.finish();
}

criterion_group!(benches, bench_assemble, bench_battle_turns);
criterion_main!(benches);
