use std::hint::black_box;
use std::io;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use sigil_envelope::{generate_keypair, seal, Opener, PublicKey, SealOptions, SecretKey, SenderMode};

fn keys(n: usize) -> Vec<(PublicKey, SecretKey)> {
    (0..n).map(|_| generate_keypair()).collect()
}

fn opts() -> SealOptions {
    SealOptions {
        armor: false,
        ..SealOptions::default()
    }
}

fn bench_seal(c: &mut Criterion) {
    let plaintext = vec![0x42u8; 64 * 1024];
    let mut group = c.benchmark_group("seal");
    group.throughput(Throughput::Bytes(plaintext.len() as u64));
    for n in [1usize, 4, 16] {
        let pks: Vec<PublicKey> = keys(n).into_iter().map(|(pk, _)| pk).collect();
        group.bench_with_input(BenchmarkId::from_parameter(n), &pks, |b, pks| {
            b.iter(|| seal(black_box(&plaintext[..]), io::sink(), pks, SenderMode::Anonymous, &opts()).unwrap())
        });
    }
    group.finish();
}

fn bench_open(c: &mut Criterion) {
    let plaintext = vec![0x42u8; 64 * 1024];
    let mut group = c.benchmark_group("open_last_slot");
    for n in [1usize, 4, 16] {
        let pairs = keys(n);
        let pks: Vec<PublicKey> = pairs.iter().map(|(pk, _)| pk.clone()).collect();
        let mut env = Vec::new();
        seal(&plaintext[..], &mut env, &pks, SenderMode::Anonymous, &opts()).unwrap();
        let sk = &pairs[n - 1].1;
        group.bench_with_input(BenchmarkId::from_parameter(n), &env, |b, env| {
            b.iter(|| {
                let opener = Opener::begin(black_box(&env[..]), "decrypt").unwrap();
                let unlocked = opener.unlock(&[sk]).unwrap();
                opener.stream(&unlocked, io::sink()).unwrap()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_seal, bench_open);
criterion_main!(benches);
