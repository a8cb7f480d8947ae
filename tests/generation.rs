//! End-to-end generation behaviour over stub upstreams.

mod common;

use std::time::Duration;

use futures::future::join_all;

use common::{barcelona, paris, HarnessBuilder, StubCompletion, StubPlaces, MARKED_PLAN};
use trip_planner::artifact::{BlobKey, BlobStore};
use trip_planner::budget::{BudgetLimits, ServiceLimits};
use trip_planner::clock::Clock;
use trip_planner::orchestrator::{
    GenerationOutcome, GenerationStage, OrchestratorSettings, PlanOrchestrator, FAILURE_MESSAGE,
};
use trip_planner::trip::TripStatus;
use trip_planner::upstream::UpstreamError;

#[tokio::test]
async fn test_concurrent_and_repeated_generate_produce_one_artifact() {
    let h = HarnessBuilder::new(
        StubCompletion::replying(MARKED_PLAN).with_delay(Duration::from_millis(50)),
    )
    .build();
    let id = h.create(&barcelona());

    let outcomes = join_all((0..5).map(|_| h.orchestrator.generate(id))).await;
    let completed = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(GenerationOutcome::Completed { .. })))
        .count();
    assert_eq!(completed, 1);
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, Ok(GenerationOutcome::Completed { .. }) | Ok(GenerationOutcome::InFlight))));

    for _ in 0..3 {
        let again = h.orchestrator.generate(id).await.unwrap();
        assert!(matches!(again, GenerationOutcome::Skipped(_)));
    }

    assert_eq!(h.completion.calls(), 1);
    assert_eq!(h.renderer.calls(), 1);
    assert_eq!(h.places.calls(), 3);
    assert_eq!(h.blobs.list().await.unwrap(), vec![BlobKey::for_request(id)]);
    assert_eq!(h.store.get_trip(id).unwrap().status, TripStatus::Complete);
}

#[tokio::test]
async fn test_second_process_sees_claim_and_backs_off() {
    let h = HarnessBuilder::new(
        StubCompletion::replying(MARKED_PLAN).with_delay(Duration::from_millis(100)),
    )
    .build();
    let id = h.create(&barcelona());

    let other = PlanOrchestrator::new(
        h.store.clone(),
        h.gateway.clone(),
        h.completion.clone(),
        h.places.clone(),
        h.artifacts.clone(),
        h.clock.clone(),
        OrchestratorSettings::default(),
    );

    let (first, second) = tokio::join!(h.orchestrator.generate(id), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        other.generate(id).await
    });
    assert!(matches!(first.unwrap(), GenerationOutcome::Completed { .. }));
    assert_eq!(second.unwrap(), GenerationOutcome::InFlight);
    assert_eq!(h.completion.calls(), 1);
    assert_eq!(h.renderer.calls(), 1);
}

#[tokio::test]
async fn test_stale_claim_is_taken_over() {
    let h = HarnessBuilder::new(StubCompletion::replying(MARKED_PLAN)).build();
    let id = h.create(&barcelona());

    let claimed = h
        .store
        .claim_generation(id, "crashed-worker", h.clock.now(), chrono::Duration::minutes(10))
        .unwrap();
    assert!(claimed);
    assert_eq!(h.orchestrator.generate(id).await.unwrap(), GenerationOutcome::InFlight);

    h.clock.advance(chrono::Duration::minutes(11));
    let outcome = h.orchestrator.generate(id).await.unwrap();
    assert!(matches!(outcome, GenerationOutcome::Completed { degraded: false, .. }));
}

#[tokio::test]
async fn test_quota_exhaustion_degrades_to_template() {
    let h = HarnessBuilder::new(StubCompletion::failing(UpstreamError::quota_exceeded(
        "You exceeded your current quota",
    )))
    .build();
    let id = h.create(&paris());

    let outcome = h.orchestrator.generate(id).await.unwrap();
    assert!(matches!(outcome, GenerationOutcome::Completed { degraded: true, .. }));
    assert_eq!(h.completion.calls(), 1);

    let trip = h.store.get_trip(id).unwrap();
    assert_eq!(trip.status, TripStatus::Complete);
    let plan = h.store.get_plan(id).unwrap().unwrap();
    assert!(plan.degraded);
    assert!(plan.has_content());
    assert!(plan.locations.iter().any(|l| l == "Eiffel Tower"));

    let status = h.orchestrator.status(id).await.unwrap();
    assert_eq!(status.stage, GenerationStage::Degraded);
    assert!(status.has_artifact);
    assert!(status.message.is_none());
}

#[tokio::test]
async fn test_exhausted_retries_degrade() {
    let h = HarnessBuilder::new(StubCompletion::failing(UpstreamError::transient(
        "503 Service Unavailable",
    )))
    .build();
    let id = h.create(&barcelona());

    let outcome = h.orchestrator.generate(id).await.unwrap();
    assert!(matches!(outcome, GenerationOutcome::Completed { degraded: true, .. }));
    assert_eq!(h.completion.calls(), 3);
    assert_eq!(h.store.get_trip(id).unwrap().status, TripStatus::Complete);
}

#[tokio::test]
async fn test_budget_denial_never_calls_upstream() {
    let limits = BudgetLimits {
        completion: ServiceLimits {
            max_calls: 0,
            max_cost: 5.0,
            cost_per_call: 0.002,
        },
        ..BudgetLimits::default()
    };
    let h = HarnessBuilder::new(StubCompletion::replying(MARKED_PLAN))
        .limits(limits)
        .build();
    let id = h.create(&barcelona());

    let outcome = h.orchestrator.generate(id).await.unwrap();
    assert!(matches!(outcome, GenerationOutcome::Completed { degraded: true, .. }));
    assert_eq!(h.completion.calls(), 0);
}

#[tokio::test]
async fn test_unauthorized_fails_with_generic_message() {
    let h = HarnessBuilder::new(StubCompletion::failing(UpstreamError::unauthorized(
        "Incorrect API key provided: sk-abc",
    )))
    .build();
    let id = h.create(&barcelona());

    let outcome = h.orchestrator.generate(id).await.unwrap();
    assert_eq!(
        outcome,
        GenerationOutcome::Failed {
            message: FAILURE_MESSAGE.to_string()
        }
    );
    assert_eq!(h.completion.calls(), 1);

    let status = h.orchestrator.status(id).await.unwrap();
    assert_eq!(status.state, TripStatus::Failed);
    assert!(!status.message.unwrap().contains("sk-abc"));
    assert!(h.blobs.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_one_failed_place_keeps_all_locations() {
    let h = HarnessBuilder::new(StubCompletion::replying(MARKED_PLAN))
        .places(StubPlaces::new(&["Park Guell"]))
        .build();
    let id = h.create(&barcelona());

    let outcome = h.orchestrator.generate(id).await.unwrap();
    assert!(matches!(outcome, GenerationOutcome::Completed { degraded: false, .. }));

    let rendered = h.renderer.last_locations.lock().unwrap().clone();
    let names: Vec<_> = rendered.iter().map(|l| l.name.as_str()).collect();
    assert_eq!(names, vec!["Sagrada Familia", "Park Guell", "Gothic Quarter"]);
    assert!(rendered[0].is_enriched());
    assert!(!rendered[1].is_enriched());
    assert!(rendered[2].is_enriched());
}

#[tokio::test]
async fn test_missing_blob_reuses_stored_content() {
    let h = HarnessBuilder::new(StubCompletion::replying(MARKED_PLAN)).build();
    let id = h.create(&barcelona());
    h.orchestrator.generate(id).await.unwrap();

    h.blobs.delete(&BlobKey::for_request(id)).await.unwrap();
    let outcome = h.orchestrator.generate(id).await.unwrap();

    assert!(matches!(outcome, GenerationOutcome::Completed { .. }));
    assert_eq!(h.completion.calls(), 1);
    assert_eq!(h.renderer.calls(), 2);
    assert_eq!(h.blobs.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_cached_completion_serves_identical_request() {
    let h = HarnessBuilder::new(StubCompletion::replying(MARKED_PLAN)).build();
    let first = h.create(&barcelona());
    let second = h.create(&barcelona());

    h.orchestrator.generate(first).await.unwrap();
    h.orchestrator.generate(second).await.unwrap();

    assert_eq!(h.completion.calls(), 1);
    assert_eq!(h.places.calls(), 3);
    assert_eq!(h.renderer.calls(), 2);
    assert!(h.cache.stats().hits >= 4);
}

#[tokio::test]
async fn test_status_never_triggers_generation() {
    let h = HarnessBuilder::new(StubCompletion::replying(MARKED_PLAN)).build();
    let id = h.create(&barcelona());

    for _ in 0..3 {
        let status = h.orchestrator.status(id).await.unwrap();
        assert_eq!(status.state, TripStatus::Pending);
    }
    assert_eq!(h.completion.calls(), 0);
    assert_eq!(h.renderer.calls(), 0);
}
