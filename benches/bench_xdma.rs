// Xilinx XDMA Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Benchmarks of the session paths against the simulated card.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use xdma_rust::descriptor::{build_ring, XdmaDesc};
use xdma_rust::host::sim::{SimCard, SimHost};
use xdma_rust::host::SgEntry;
use xdma_rust::{Direction, DmaOptions, Xdma};

const VID: u16 = 0x10EE;
const DID: u16 = 0x9038;

/// Build descriptor rings of increasing length.
fn bench_build_ring(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_ring");

    for pages in [1usize, 16, 256, 4096] {
        let entries: Vec<SgEntry> = (0..pages)
            .map(|i| SgEntry {
                phys: 0x1_0000_0000 + (i as u64) * 0x1000,
                bytes: 0x1000,
            })
            .collect();
        let mut ring = vec![XdmaDesc::new(); pages];

        group.throughput(Throughput::Elements(pages as u64));
        group.bench_with_input(BenchmarkId::from_parameter(pages), &entries, |b, entries| {
            b.iter(|| build_ring(&mut ring, 0x8000, entries, Direction::ToDevice, 0, false).unwrap());
        });
    }

    group.finish();
}

/// Start and poll one H2C transfer per iteration.
fn bench_polling_transfer(c: &mut Criterion) {
    let sizes: Vec<usize> = vec![
        4 * 1024,    // 4 KB
        64 * 1024,   // 64 KB
        512 * 1024,  // 512 KB
    ];

    let card = SimCard::new(VID, DID).with_channels(1);
    let xdma = Xdma::init(Arc::new(SimHost::new(card))).unwrap();
    let device = xdma.device_open(VID, DID).unwrap();

    let mut group = c.benchmark_group("polling_transfer");

    for size in sizes {
        let options = DmaOptions::new(Direction::ToDevice, 0, size).polling(true);
        let mut session = device.dma_open(&options).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(BenchmarkId::from_parameter(size), |b| {
            b.iter(|| {
                session.transfer_start().unwrap();
                session.poll_completion().unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_build_ring, bench_polling_transfer);
criterion_main!(benches);
