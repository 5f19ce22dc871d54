use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kolosal_pnas::architectures::CellNetworkBuilder;
use kolosal_pnas::nas::{
    ControllerConfig, ModelBuilder, PolicyController, SearchConfig, SpaceConfig, StateSpace,
    TrainingBudget,
};
use kolosal_pnas::utils::data_loader::Dataset;

fn bench_propose(c: &mut Criterion) {
    let mut group = c.benchmark_group("controller");

    for hidden_dim in [32, 100].iter() {
        group.bench_with_input(
            BenchmarkId::new("propose_train_update", hidden_dim),
            hidden_dim,
            |b, &hidden_dim| {
                b.iter(|| {
                    let space = StateSpace::new(&SpaceConfig::default()).unwrap();
                    let config = ControllerConfig {
                        hidden_dim,
                        ..ControllerConfig::default()
                    };
                    let mut ctrl = PolicyController::new(space, config, Some(7)).unwrap();
                    let proposals = ctrl.propose().unwrap();
                    let rewards: Vec<f64> = (0..proposals.len())
                        .map(|i| (i % 10) as f64 / 10.0)
                        .collect();
                    black_box(ctrl.train_step(&rewards).unwrap());
                    ctrl.update_step().unwrap();
                })
            },
        );
    }

    group.finish();
}

fn bench_child_training(c: &mut Criterion) {
    let mut group = c.benchmark_group("child");
    group.sample_size(10); // Fewer samples for training benchmarks

    let config = SearchConfig::default();
    let space = StateSpace::new(&config.space).unwrap();
    let budget = TrainingBudget {
        epochs: 1,
        batch_size: 64,
        learning_rate: 0.01,
    };

    for n_rows in [256, 1024].iter() {
        let data = Dataset::synthetic(*n_rows, 64, 64, 4, 0);
        let arch = space.decode(&space.enumerate_block(0, &[])[5]).unwrap();

        group.bench_with_input(BenchmarkId::new("train_cell", n_rows), &data, |b, data| {
            b.iter(|| {
                let mut model = CellNetworkBuilder::new(1)
                    .build(&arch, &data.shape(), 1)
                    .unwrap();
                model
                    .train(black_box(data.x_train.view()), data.y_train.view(), &budget)
                    .unwrap()
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_propose, bench_child_training);
criterion_main!(benches);
