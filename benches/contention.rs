// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use criterion::{criterion_group, criterion_main, Criterion};
use stronghold_mvstm as stm;

/// Primitive benchmarks over a single transactional variable
pub fn bnc_write(c: &mut Criterion) {
    c.bench_function("bench_write", |b| {
        let var = stm::TVar::new(8usize);

        b.iter(|| {
            let var = var.clone();
            stm::atomically(move || var.write(234)).expect("transaction failed");
        })
    });
}

pub fn bnc_modify(c: &mut Criterion) {
    c.bench_function("bench_modify", |b| {
        let var = stm::TVar::new(0usize);

        b.iter(|| {
            let var = var.clone();
            stm::atomically(move || var.modify(|n| *n = n.wrapping_add(1))).expect("transaction failed");
        })
    });
}

pub fn bnc_commute(c: &mut Criterion) {
    c.bench_function("bench_commute", |b| {
        let var = stm::TVar::new(0usize);

        b.iter(|| {
            let var = var.clone();
            stm::atomically(move || var.commute(|n| *n = n.wrapping_add(1))).expect("transaction failed");
        })
    });
}

criterion_group!(benches, bnc_write, bnc_modify, bnc_commute);
criterion_main!(benches);
