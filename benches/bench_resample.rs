// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Gridding and degridding benchmarks

use criterion::*;
use visgrid::{
    c32, constants::VEL_C, resampler::identity_map, ConvolutionFunction, FftTransform, Grid,
    GridSpec, ImageMapper, InMemoryVisSource, MajorCycleController, SerialDispatcher,
    ThreadedDispatcher, VisBatch, VisResampler, UVW,
};

const NUM_ROWS: usize = 8128;
const NUM_CHANS: usize = 16;
const NUM_POLS: usize = 4;
const GRID_SIZE: usize = 256;

/// Baselines out to about a third of the grid, at 150 MHz.
fn synthetic_batch(seed: u64) -> VisBatch {
    let mut state = seed;
    let mut next = || {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((state >> 11) as f64 / (1_u64 << 53) as f64) * 2.0 - 1.0
    };
    let uvws = (0..NUM_ROWS)
        .map(|_| UVW::new(next() * 150.0, next() * 150.0, next() * 10.0))
        .collect();
    let freqs_hz = (0..NUM_CHANS).map(|i| 150e6 + i as f64 * 40e3).collect();
    let mut batch = VisBatch::new(uvws, freqs_hz, NUM_POLS);
    batch
        .vis
        .mapv_inplace(|_| c32::new(next() as f32, next() as f32));
    batch
}

fn spec() -> GridSpec {
    // Keep the longest baseline well inside the grid.
    let max_lambda = 150.0 * 150e6 * 1.01 / VEL_C;
    GridSpec::new(GRID_SIZE, GRID_SIZE, 1.0 / (3.0 * max_lambda)).with_pols(NUM_POLS)
}

fn resample(c: &mut Criterion) {
    let kernel = ConvolutionFunction::default_spheroidal();
    let spec = spec();
    let resampler = VisResampler::for_spec(
        &spec,
        &kernel,
        vec![Some(0); NUM_CHANS],
        identity_map(NUM_POLS),
    );
    let batch = synthetic_batch(42);

    let mut group = c.benchmark_group("resample");
    group.throughput(Throughput::Elements((NUM_ROWS * NUM_CHANS * NUM_POLS) as u64));

    let mut grid = Grid::<f32>::from_spec(&spec).unwrap();
    group.bench_function("data_to_grid f32", |b| {
        b.iter(|| {
            resampler
                .data_to_grid(black_box(&batch), &mut grid, &kernel, false)
                .unwrap()
        })
    });

    let mut grid = Grid::<f64>::from_spec(&spec).unwrap();
    group.bench_function("data_to_grid f64", |b| {
        b.iter(|| {
            resampler
                .data_to_grid(black_box(&batch), &mut grid, &kernel, false)
                .unwrap()
        })
    });

    let mut predicted = batch.zeroed_like();
    group.bench_function("grid_to_data f64", |b| {
        b.iter(|| {
            resampler
                .grid_to_data(black_box(&grid), &mut predicted, &kernel)
                .unwrap()
        })
    });
    group.finish();
}

fn psf_pass(c: &mut Criterion) {
    let spec = spec();
    let mapper = || {
        ImageMapper::<f32>::new(
            "bench",
            spec,
            ConvolutionFunction::default_spheroidal(),
            vec![Some(0); NUM_CHANS],
            identity_map(NUM_POLS),
        )
        .unwrap()
    };
    let batches: Vec<VisBatch> = (0..8).map(synthetic_batch).collect();

    let mut group = c.benchmark_group("psf_pass");
    group.sample_size(10);
    group.bench_function("serial", |b| {
        b.iter(|| {
            let mut source = InMemoryVisSource::new(batches.clone());
            let mut controller =
                MajorCycleController::new(vec![mapper()], SerialDispatcher, FftTransform).unwrap();
            controller.make_psf(&mut source).unwrap();
        })
    });
    group.bench_function("threaded", |b| {
        b.iter(|| {
            let mut source = InMemoryVisSource::new(batches.clone());
            let mut controller = MajorCycleController::new(
                vec![mapper()],
                ThreadedDispatcher::default(),
                FftTransform,
            )
            .unwrap();
            controller.make_psf(&mut source).unwrap();
        })
    });
    group.finish();
}

criterion_group!(benches, resample, psf_pass);
criterion_main!(benches);
