//! Benchmarks for recognition throughput
//!
//! Run with: cargo bench

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use spantag_engine::classifier::NetworkParameters;
use spantag_engine::recognizer::{ModelVariant, Recognizer};
use spantag_engine::tagger::TaggerKind;
use spantag_engine::trainer;

fn build_recognizer() -> Recognizer {
    let mut train_data = String::new();
    // A synthetic corpus with a few hundred distinct forms
    for i in 0..100 {
        train_data.push_str(&format!(
            "Person{i}\tB-PER\nSurname{i}\tI-PER\nvisited{i}\tO\nCity{i}\tB-LOC\n\n"
        ));
    }

    let parameters = NetworkParameters {
        iterations: 5,
        ..NetworkParameters::default()
    };
    trainer::train(
        ModelVariant::Generic,
        TaggerKind::Trivial,
        1,
        &parameters,
        "Form/2\nFormCapitalization/1\nFormSuffix/1 2 4\n",
        train_data.as_bytes(),
        None,
    )
    .expect("training failed")
}

fn bench_recognize(c: &mut Criterion) {
    let recognizer = build_recognizer();
    let forms = [
        "Person17", "Surname17", "visited3", "City8", "and", "Person42", "Surname42",
    ];

    let mut group = c.benchmark_group("recognize");
    group.bench_function("seven_tokens", |b| {
        b.iter(|| recognizer.recognize(black_box(&forms)))
    });
    group.bench_function("single_token", |b| {
        b.iter(|| recognizer.recognize(black_box(&["Person17"])))
    });
    group.finish();
}

criterion_group!(benches, bench_recognize);
criterion_main!(benches);
