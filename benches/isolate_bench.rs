use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use isolate_host::{Context, EventLoop, Isolate, IsolateConfig, IsolateHost, RunMode, Script};
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

fn bench_script_run(c: &mut Criterion) {
    let config = IsolateConfig::default();
    let isolate = Isolate::new(&config).unwrap();
    let context = Context::new(&isolate).unwrap();

    c.bench_function("compile_cached_and_run", |b| {
        b.iter(|| {
            let script = Script::compile(&context, "bench.js", "[1, 2, 3].map((x) => x * 2).join(',')").unwrap();
            black_box(script.run().unwrap())
        })
    });
}

fn bench_event_loop(c: &mut Criterion) {
    let event_loop = EventLoop::new(&IsolateConfig::default()).unwrap();

    c.bench_function("hundred_zero_timers", |b| {
        b.iter(|| {
            let fired = Rc::new(Cell::new(0u32));
            for _ in 0..100 {
                let fired = Rc::clone(&fired);
                event_loop
                    .set_timeout(Duration::ZERO, move || fired.set(fired.get() + 1))
                    .unwrap();
            }
            event_loop.run(RunMode::DrainAll).unwrap();
            black_box(fired.get())
        })
    });

    c.bench_function("hundred_work_items", |b| {
        b.iter(|| {
            for i in 0..100u64 {
                event_loop.queue_work(move || i * i, |r| drop(black_box(r))).unwrap();
            }
            event_loop.run(RunMode::DrainAll).unwrap();
        })
    });
}

fn bench_host_lifecycle(c: &mut Criterion) {
    let config = IsolateConfig::default();

    c.bench_function("host_create_and_shutdown", |b| {
        b.iter_batched(
            || {
                let mut host = IsolateHost::with_event_loop(&config).unwrap();
                let ctx = host.new_context().unwrap();
                host.create_environment(ctx, vec![], vec![]).unwrap();
                host
            },
            |mut host| black_box(host.shutdown().unwrap()),
            BatchSize::PerIteration,
        )
    });
}

criterion_group!(benches, bench_script_run, bench_event_loop, bench_host_lifecycle);
criterion_main!(benches);
