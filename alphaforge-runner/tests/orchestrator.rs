//! Batch orchestrator integration tests against a scripted service double.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alphaforge_core::domain::{BatchNo, CandidateDraft, CandidateId, CandidatePatch, ExternalId, Level, Settings};
use alphaforge_core::lifecycle::CandidateState;
use alphaforge_runner::config::PipelineConfig;
use alphaforge_runner::orchestrator::{BatchSummary, Orchestrator};
use alphaforge_runner::rate_limit::RateLimiter;
use alphaforge_runner::repository::{CandidateRepository, Filter, InMemoryRepository};
use alphaforge_runner::service::{ItemOutcome, ItemResult, ServiceError, SimulationRequest};

use common::{complete_all, seeded_config, FakeService};

fn pending(repo: &InMemoryRepository, n: usize, region: &str, batch: &str) -> Vec<CandidateId> {
    (0..n)
        .map(|i| {
            let mut settings = Settings::default_simulation();
            settings.insert("region", region);
            let draft = CandidateDraft::generated(format!("rank(f_{region}_{batch}_{i})"), settings, Level::First)
                .with_batch_no(BatchNo::new(batch));
            repo.create(draft).unwrap().id()
        })
        .collect()
}

fn orchestrator(repo: &Arc<InMemoryRepository>, service: &Arc<FakeService>, config: &PipelineConfig) -> Orchestrator {
    Orchestrator::new(repo.clone(), service.clone(), Arc::new(RateLimiter::unlimited()), config)
}

fn states(repo: &InMemoryRepository, ids: &[CandidateId]) -> Vec<CandidateState> {
    ids.iter().map(|id| repo.get(*id).unwrap().unwrap().state).collect()
}

// ── Verdicts ──

#[test]
fn partial_acceptance_leaves_the_rest_simulating() {
    let repo = Arc::new(InMemoryRepository::new());
    let ids = pending(&repo, 10, "USA", "b");
    let service = Arc::new(FakeService::with_submit(|batch: &[SimulationRequest]| {
        Ok(batch
            .iter()
            .enumerate()
            .map(|(i, r)| ItemResult {
                candidate_id: r.candidate_id,
                outcome: if i < 7 {
                    ItemOutcome::Completed {
                        external_id: ExternalId::new(format!("ext-{}", r.candidate_id)),
                    }
                } else {
                    ItemOutcome::Unresolved {
                        reason: "not accepted".into(),
                    }
                },
            })
            .collect())
    }));

    let summary = orchestrator(&repo, &service, &seeded_config(0))
        .run_batch(&Filter::new(), 1)
        .unwrap();

    assert_eq!(summary.sub_batches, 1);
    assert_eq!(summary.completed, 7);
    assert_eq!(summary.unresolved, 3);

    let s = states(&repo, &ids);
    assert_eq!(s.iter().filter(|st| **st == CandidateState::Simulated).count(), 7);
    assert_eq!(s.iter().filter(|st| **st == CandidateState::Simulating).count(), 3);
    let linked = repo.search(&Filter::new().is_null("external_id", false)).unwrap();
    assert!(linked.iter().all(|c| c.external_id == Some(ExternalId::new(format!("ext-{}", c.id)))));
}

#[test]
fn failed_items_become_simulated_fail() {
    let repo = Arc::new(InMemoryRepository::new());
    let ids = pending(&repo, 2, "USA", "b");
    let service = Arc::new(FakeService::with_submit(|batch: &[SimulationRequest]| {
        Ok(batch
            .iter()
            .map(|r| ItemResult {
                candidate_id: r.candidate_id,
                outcome: ItemOutcome::Failed {
                    reason: "unknown variable".into(),
                },
            })
            .collect())
    }));

    let summary = orchestrator(&repo, &service, &seeded_config(0))
        .run_batch(&Filter::new(), 2)
        .unwrap();
    assert_eq!(summary.failed, 2);
    assert_eq!(states(&repo, &ids), vec![CandidateState::SimulatedFail; 2]);
}

#[test]
fn repeated_verdicts_keep_the_last_one() {
    let repo = Arc::new(InMemoryRepository::new());
    let ids = pending(&repo, 4, "USA", "b");
    let service = Arc::new(FakeService::with_submit(|batch: &[SimulationRequest]| {
        let mut items = complete_all(&batch[..3])?;
        items.push(ItemResult {
            candidate_id: batch[0].candidate_id,
            outcome: ItemOutcome::Failed {
                reason: "recomputed".into(),
            },
        });
        Ok(items)
    }));

    let summary = orchestrator(&repo, &service, &seeded_config(0))
        .run_batch(&Filter::new(), 1)
        .unwrap();
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.unresolved, 1);
    assert_eq!(
        states(&repo, &ids),
        vec![
            CandidateState::SimulatedFail,
            CandidateState::Simulated,
            CandidateState::Simulated,
            CandidateState::Simulating,
        ]
    );
}

#[test]
fn verdict_for_a_candidate_moved_on_elsewhere_is_dropped_alone() {
    let repo = Arc::new(InMemoryRepository::new());
    let ids = pending(&repo, 20, "USA", "b");
    let shared = Arc::clone(&repo);
    let first_call = AtomicBool::new(true);
    // a concurrent sync sees the first candidate as ACTIVE mid-flight
    let service = Arc::new(FakeService::with_submit(move |batch: &[SimulationRequest]| {
        if first_call.swap(false, Ordering::SeqCst) {
            shared
                .update(batch[0].candidate_id, &CandidatePatch::state(CandidateState::Active))
                .unwrap();
        }
        complete_all(batch)
    }));

    let summary = orchestrator(&repo, &service, &seeded_config(0))
        .run_batch(&Filter::new(), 1)
        .unwrap();
    assert_eq!(service.submissions.lock().unwrap().len(), 2);
    assert_eq!(summary.completed, 19);
    assert_eq!(summary.unresolved, 1);

    let s = states(&repo, &ids);
    assert_eq!(s[0], CandidateState::Active);
    assert!(s[1..].iter().all(|st| *st == CandidateState::Simulated));
    for id in &ids[1..] {
        assert_eq!(
            repo.get(*id).unwrap().unwrap().external_id,
            Some(ExternalId::new(format!("ext-{id}")))
        );
    }
}

// ── Grouping and bounds ──

#[test]
fn sub_batches_are_context_homogeneous_and_bounded() {
    let repo = Arc::new(InMemoryRepository::new());
    pending(&repo, 25, "USA", "b");
    pending(&repo, 3, "EUR", "b");
    let service = Arc::new(FakeService::new());

    let summary = orchestrator(&repo, &service, &seeded_config(0))
        .run_batch(&Filter::new(), 2)
        .unwrap();

    assert_eq!(summary.selected, 28);
    assert_eq!(summary.groups, 2);
    assert_eq!(summary.sub_batches, 4);
    assert_eq!(summary.completed, 28);

    for batch in service.submissions.lock().unwrap().iter() {
        assert!(batch.len() <= 10);
        let regions: HashSet<_> = batch.iter().map(|r| r.settings.region().unwrap().to_string()).collect();
        assert_eq!(regions.len(), 1);
    }
    assert!(repo
        .search(&Filter::new())
        .unwrap()
        .iter()
        .all(|c| c.state == CandidateState::Simulated));
}

#[test]
fn in_flight_submissions_never_exceed_concurrency() {
    let repo = Arc::new(InMemoryRepository::new());
    pending(&repo, 120, "USA", "b");
    let service = Arc::new(FakeService::new().with_delay(Duration::from_millis(20)));

    let summary = orchestrator(&repo, &service, &seeded_config(0))
        .run_batch(&Filter::new(), 3)
        .unwrap();

    assert_eq!(summary.sub_batches, 12);
    assert_eq!(summary.completed, 120);
    let max = service.max_in_flight.load(Ordering::SeqCst);
    assert!(max >= 1 && max <= 3, "max in flight was {max}");
}

#[test]
fn small_pages_still_select_everything() {
    let repo = Arc::new(InMemoryRepository::new());
    pending(&repo, 10, "USA", "b");
    let mut config = seeded_config(0);
    config.batch.page_size = 3;
    let service = Arc::new(FakeService::new());

    let orch = orchestrator(&repo, &service, &config);
    assert_eq!(orch.select_pending(&Filter::new()).unwrap().len(), 10);
    assert_eq!(orch.run_batch(&Filter::new(), 1).unwrap().selected, 10);
}

#[test]
fn overlapping_runs_submit_each_candidate_once() {
    let repo = Arc::new(InMemoryRepository::new());
    pending(&repo, 20, "USA", "b");
    let config = seeded_config(0);

    let other_service = Arc::new(FakeService::new());
    let other = orchestrator(&repo, &other_service, &config);
    let other_summary: Arc<Mutex<Option<BatchSummary>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&other_summary);
    let first_call = AtomicBool::new(true);
    // a second run starts while the first sub-batch of this one is in flight
    let service = Arc::new(FakeService::with_submit(move |batch: &[SimulationRequest]| {
        if first_call.swap(false, Ordering::SeqCst) {
            *slot.lock().unwrap() = other.run_batch(&Filter::new(), 1).ok();
        }
        complete_all(batch)
    }));

    let summary = orchestrator(&repo, &service, &config)
        .run_batch(&Filter::new(), 1)
        .unwrap();
    let other = other_summary.lock().unwrap().clone().unwrap();

    assert_eq!(summary.selected, 20);
    assert_eq!(summary.dispatched, 1);
    assert_eq!(summary.skipped, 10);
    assert_eq!(other.selected, 10);
    assert_eq!(other.completed, 10);

    let mut submitted: Vec<u64> = service.submitted_ids().concat();
    submitted.extend(other_service.submitted_ids().concat());
    let distinct: HashSet<u64> = submitted.iter().copied().collect();
    assert_eq!(submitted.len(), 20);
    assert_eq!(distinct.len(), 20);
    assert!(repo
        .search(&Filter::new())
        .unwrap()
        .iter()
        .all(|c| c.state == CandidateState::Simulated));
}

#[test]
fn selector_limits_the_run_to_one_batch() {
    let repo = Arc::new(InMemoryRepository::new());
    let wanted = pending(&repo, 4, "USA", "wanted");
    let other = pending(&repo, 4, "USA", "other");
    let service = Arc::new(FakeService::new());

    orchestrator(&repo, &service, &seeded_config(0))
        .run_batch(&Filter::new().eq("batch_no", "wanted"), 2)
        .unwrap();
    assert_eq!(states(&repo, &wanted), vec![CandidateState::Simulated; 4]);
    assert_eq!(states(&repo, &other), vec![CandidateState::Pending; 4]);
}

// ── Failures ──

#[test]
fn errored_sub_batch_does_not_affect_siblings() {
    let repo = Arc::new(InMemoryRepository::new());
    let usa = pending(&repo, 5, "USA", "b");
    let eur = pending(&repo, 5, "EUR", "b");
    let service = Arc::new(FakeService::with_submit(|batch: &[SimulationRequest]| {
        if batch[0].settings.region() == Some("EUR") {
            Err(ServiceError::Timeout("poll".into()))
        } else {
            complete_all(batch)
        }
    }));

    let summary = orchestrator(&repo, &service, &seeded_config(0))
        .run_batch(&Filter::new(), 2)
        .unwrap();
    assert_eq!(summary.errored, 1);
    assert_eq!(summary.completed, 5);
    assert_eq!(summary.unresolved, 5);
    assert_eq!(states(&repo, &usa), vec![CandidateState::Simulated; 5]);
    assert_eq!(states(&repo, &eur), vec![CandidateState::Simulating; 5]);
    assert_eq!(service.reauth_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn expired_session_triggers_reauthentication() {
    let repo = Arc::new(InMemoryRepository::new());
    pending(&repo, 3, "USA", "b");
    let service = Arc::new(FakeService::with_submit(|_: &[SimulationRequest]| {
        Err(ServiceError::Unauthorized("session expired".into()))
    }));

    let summary = orchestrator(&repo, &service, &seeded_config(0))
        .run_batch(&Filter::new(), 1)
        .unwrap();
    assert_eq!(summary.errored, 1);
    assert_eq!(service.reauth_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn requeue_returns_stale_candidates_to_pending() {
    let repo = Arc::new(InMemoryRepository::new());
    let ids = pending(&repo, 4, "USA", "b");
    let failing = Arc::new(FakeService::with_submit(|_: &[SimulationRequest]| {
        Err(ServiceError::Network("connection reset".into()))
    }));
    let config = seeded_config(0);
    orchestrator(&repo, &failing, &config).run_batch(&Filter::new(), 1).unwrap();
    assert_eq!(states(&repo, &ids), vec![CandidateState::Simulating; 4]);

    let healthy = Arc::new(FakeService::new());
    let orch = orchestrator(&repo, &healthy, &config);
    // stale rows are not PENDING, so a plain rerun skips them
    assert_eq!(orch.run_batch(&Filter::new(), 1).unwrap().selected, 0);

    assert_eq!(orch.requeue_stale(&Filter::new()).unwrap(), 4);
    assert_eq!(states(&repo, &ids), vec![CandidateState::Pending; 4]);
    assert_eq!(orch.run_batch(&Filter::new(), 1).unwrap().completed, 4);
    assert_eq!(orch.requeue_stale(&Filter::new()).unwrap(), 0);
}

#[test]
fn cancelled_run_dispatches_nothing() {
    let repo = Arc::new(InMemoryRepository::new());
    let ids = pending(&repo, 3, "USA", "b");
    let service = Arc::new(FakeService::new());
    let orch = orchestrator(&repo, &service, &seeded_config(0));
    orch.cancel_flag().store(true, Ordering::Relaxed);

    let summary = orch.run_batch(&Filter::new(), 2).unwrap();
    assert_eq!(summary.dispatched, 0);
    assert_eq!(states(&repo, &ids), vec![CandidateState::Pending; 3]);
    assert!(service.submissions.lock().unwrap().is_empty());
}
