//! Benchmarks for the consensus decision and breaker bookkeeping.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;
use vdpflow::consensus::{AgentProposal, AgentRole, ConsensusGate, ConsensusPolicy};
use vdpflow::resilience::{BreakerConfig, CircuitBreaker};

fn consensus_benchmark(c: &mut Criterion) {
    let mut gate = ConsensusGate::new(ConsensusPolicy::default(), "bench");
    for (role, confidence) in [
        (AgentRole::Commander, 0.95),
        (AgentRole::Implementer, 0.88),
        (AgentRole::Ux, 0.92),
    ] {
        let proposal = AgentProposal::new(role, role.as_str(), confidence, "add breaker; add dlq; wire saga")
            .with_risk("rollout complexity")
            .with_implementation_time("45min");
        if gate.submit(proposal).is_err() {
            return;
        }
    }

    c.bench_function("consensus_decide", |b| b.iter(|| black_box(gate.decide())));
}

fn breaker_benchmark(c: &mut Criterion) {
    let breaker = CircuitBreaker::new("bench", BreakerConfig::default().with_failure_threshold(u32::MAX));

    c.bench_function("breaker_record_success", |b| {
        b.iter(|| breaker.record_success(black_box(Duration::from_millis(12))));
    });
    c.bench_function("breaker_allow_request", |b| b.iter(|| black_box(breaker.allow_request())));
    c.bench_function("breaker_snapshot", |b| b.iter(|| black_box(breaker.snapshot())));
}

criterion_group!(benches, consensus_benchmark, breaker_benchmark);
criterion_main!(benches);
