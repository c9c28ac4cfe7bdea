use std::collections::BTreeSet;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use kas::modules::crypto::policy_binding_hash;
use kas::rewrap::combiner::{combine_all_of, split_all_of};
use kas::rewrap::{Classification, Policy};

fn bench_combine_all_of(c: &mut Criterion) {
    let dek = [0x5au8; 32];
    for n in [2usize, 5, 10] {
        let shares = split_all_of(&dek, n).unwrap();
        let views: Vec<&[u8]> = shares.iter().map(|s| s.as_slice()).collect();
        c.bench_function(&format!("combine_all_of_{}", n), |b| {
            b.iter(|| {
                let key = combine_all_of(black_box(&views)).unwrap();
                assert_eq!(key.as_slice(), &dek);
            })
        });
    }
}

fn bench_policy_binding_hash(c: &mut Criterion) {
    let policy = Policy {
        classification: Classification::TopSecret,
        releasability_to: ["USA", "GBR", "CAN", "AUS", "NZL"]
            .into_iter()
            .map(String::from)
            .collect(),
        coi: Some(BTreeSet::from(["FVEY".to_string(), "NATO-COSMIC".to_string()])),
        creation_date: Some("2026-01-15T09:30:00Z".to_string()),
    };

    c.bench_function("policy_binding_hash", |b| {
        b.iter(|| policy_binding_hash(black_box(&policy)).unwrap())
    });
}

criterion_group!(benches, bench_combine_all_of, bench_policy_binding_hash);
criterion_main!(benches);
