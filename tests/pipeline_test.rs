//! End-to-end pipeline tests against a fixture catalogue, a
//! deterministic embedder and a scripted chat transport. No network, no
//! model weights.

mod common;

use std::time::Duration;

use emitter::models::{DecisionType, JobMode, JobStatus, RowStatus};
use emitter::pipeline::calc::format_number;
use emitter::pipeline::scheduler::ResolveError;

use common::*;

async fn run_job(
    env: &TestEnv,
    rows: Vec<emitter::models::InputRowCreate>,
    mode: JobMode,
) -> (String, Vec<i64>, JobStatus) {
    let job = env.jobs.create_job(mode).await.unwrap();
    let ids = env.jobs.add_input_rows(&job.id, &rows).await.unwrap();
    let status = env.scheduler.run_job(&job.id).await.unwrap();
    (job.id, ids, status)
}

// ── S1: simple match, same unit ─────────────────────────

#[tokio::test]
async fn s1_simple_match_same_unit() {
    let dir = tempfile::tempdir().unwrap();
    let chat = StubChat::new(vec![(
        r#"Bezeichnung: "Stahl""#,
        match_response(STEEL_DE),
    )]);
    let env = build_env(dir.path(), chat.clone(), Duration::ZERO).await;

    let (job_id, ids, status) = run_job(
        &env,
        vec![input_row_full("Stahl", "kg", Some("RER"), Some("Scope 3"))],
        JobMode::Auto,
    )
    .await;

    assert_eq!(status, JobStatus::Completed);
    let row = env.jobs.load_row(ids[0]).await.unwrap().unwrap();
    assert_eq!(row.status, RowStatus::Calculated);
    assert_eq!(row.region_norm, "RER");

    let result = env.jobs.load_result(ids[0]).await.unwrap().unwrap();
    assert_eq!(result.decision_type, DecisionType::Match);
    assert_eq!(result.selected_uuid.as_deref(), Some(STEEL_DE));
    // biogenic 0.002 kg/kg × 1 / 1000, common 1.8 kg/kg × 1 / 1000
    assert_eq!(
        result.biogenic_t.as_deref(),
        Some(format_number(0.002 * 1.0 / 1000.0).as_str())
    );
    assert_eq!(
        result.common_t.as_deref(),
        Some(format_number(1.8 * 1.0 / 1000.0).as_str())
    );

    let beschreibung = result.beschreibung.unwrap();
    assert!(beschreibung.len() <= 1000);
    assert!(beschreibung.contains("steel production, converter, low-alloyed"));
    let quelle = result.quelle.unwrap();
    assert!(quelle.starts_with("ecoinvent 3.11"));
    assert!(quelle.contains(STEEL_DE));

    // same unit: exactly one LLM call, no conversion
    assert_eq!(chat.call_count(), 1);

    let counters = env.jobs.counters(&job_id).await.unwrap();
    assert_eq!(counters.total, 1);
    assert_eq!(counters.calculated, 1);
}

// ── S2: match with unit conversion ──────────────────────

#[tokio::test]
async fn s2_match_with_conversion() {
    let dir = tempfile::tempdir().unwrap();
    let chat = StubChat::new(vec![
        (r#"Bezeichnung: "Diesel""#, match_response(DIESEL_BUILDING)),
        (
            "Source unit: l",
            conversion_response(36.0, "1 liter of diesel contains about 36 MJ"),
        ),
    ]);
    let env = build_env(dir.path(), chat.clone(), Duration::ZERO).await;

    let (_job_id, ids, status) = run_job(
        &env,
        vec![input_row_full("Diesel", "Liter", Some("RER"), Some("Scope 1"))],
        JobMode::Auto,
    )
    .await;

    assert_eq!(status, JobStatus::Completed);
    let result = env.jobs.load_result(ids[0]).await.unwrap().unwrap();
    assert_eq!(result.selected_uuid.as_deref(), Some(DIESEL_BUILDING));
    // common 0.075 kg/MJ × 36 MJ/l / 1000 = 0.0027 t per liter
    assert_eq!(
        result.common_t.as_deref(),
        Some(format_number(0.075 * 36.0 / 1000.0).as_str())
    );

    let detailed = result.detailed_calc.unwrap();
    assert!(detailed.contains("Conversion factor: 36"));
    assert!(detailed.contains("36 MJ"));

    // decide + convert_unit
    assert_eq!(chat.call_count(), 2);
}

// ── S3: ambiguous in review mode, then resolve ──────────

#[tokio::test]
async fn s3_ambiguous_review_suspends_then_resolves() {
    let dir = tempfile::tempdir().unwrap();
    let chat = StubChat::new(vec![
        (
            r#"Bezeichnung: "Diesel Verbrennung""#,
            ambiguous_response(&[
                (DIESEL_BUILDING, "burned in building machine"),
                (DIESEL_FISHING, "burned in fishing vessel"),
            ]),
        ),
        (
            "Source unit: l",
            conversion_response(36.0, "lower heating value of diesel"),
        ),
    ]);
    let env = build_env(dir.path(), chat.clone(), Duration::ZERO).await;

    let (job_id, ids, status) = run_job(
        &env,
        vec![input_row_full(
            "Diesel Verbrennung",
            "l",
            None,
            Some("Scope 1"),
        )],
        JobMode::Review,
    )
    .await;

    // suspension barrier
    assert_eq!(status, JobStatus::AwaitingResolution);
    let row = env.jobs.load_row(ids[0]).await.unwrap().unwrap();
    assert_eq!(row.status, RowStatus::Ambiguous);

    let ambiguous = env.jobs.list_ambiguous(&job_id).await.unwrap();
    assert_eq!(ambiguous.len(), 1);
    let saved = env.jobs.load_candidates(ids[0]).await.unwrap();
    assert_eq!(saved.len(), 2);
    assert_eq!(saved[0].uuid, DIESEL_BUILDING);
    assert_eq!(saved[0].rank, 1);
    assert_eq!(saved[1].uuid, DIESEL_FISHING);

    // external resolution runs the tail without another decide
    let decide_calls_before = chat.call_count();
    env.scheduler
        .resolve(&job_id, ids[0], DIESEL_BUILDING)
        .await
        .unwrap();

    let row = env.jobs.load_row(ids[0]).await.unwrap().unwrap();
    assert_eq!(row.status, RowStatus::Calculated);
    let result = env.jobs.load_result(ids[0]).await.unwrap().unwrap();
    assert_eq!(result.selected_uuid.as_deref(), Some(DIESEL_BUILDING));
    assert_eq!(
        result.common_t.as_deref(),
        Some(format_number(0.075 * 36.0 / 1000.0).as_str())
    );

    // only the conversion call was added
    assert_eq!(chat.call_count(), decide_calls_before + 1);

    // the last resolution completes the job
    let job = env.jobs.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    // idempotent once calculated
    env.scheduler
        .resolve(&job_id, ids[0], DIESEL_BUILDING)
        .await
        .unwrap();
    // but a different uuid is rejected
    assert!(matches!(
        env.scheduler.resolve(&job_id, ids[0], DIESEL_FISHING).await,
        Err(ResolveError::NotAmbiguous { .. })
    ));
}

// ── S4: ambiguous in auto mode picks rank 1 ─────────────

#[tokio::test]
async fn s4_ambiguous_auto_picks_first() {
    let dir = tempfile::tempdir().unwrap();
    let chat = StubChat::new(vec![
        (
            r#"Bezeichnung: "Diesel Verbrennung""#,
            ambiguous_response(&[
                (DIESEL_BUILDING, "burned in building machine"),
                (DIESEL_FISHING, "burned in fishing vessel"),
            ]),
        ),
        ("Source unit: l", conversion_response(36.0, "heating value")),
    ]);
    let env = build_env(dir.path(), chat.clone(), Duration::ZERO).await;

    let (job_id, ids, status) = run_job(
        &env,
        vec![input_row_full(
            "Diesel Verbrennung",
            "l",
            None,
            Some("Scope 1"),
        )],
        JobMode::Auto,
    )
    .await;

    // no suspension in auto mode
    assert_eq!(status, JobStatus::Completed);
    let row = env.jobs.load_row(ids[0]).await.unwrap().unwrap();
    assert_eq!(row.status, RowStatus::Calculated);
    let result = env.jobs.load_result(ids[0]).await.unwrap().unwrap();
    assert_eq!(result.selected_uuid.as_deref(), Some(DIESEL_BUILDING));
    assert_eq!(env.jobs.counters(&job_id).await.unwrap().ambiguous, 0);
}

// ── S5: decomposition ───────────────────────────────────

#[tokio::test]
async fn s5_decomposition_sums_components() {
    let dir = tempfile::tempdir().unwrap();
    // fractions of one burger; each component dataset is per kg, so each
    // gets a unit→kg conversion (one burger portion ≈ 250 g)
    let components = [
        ("beef patty", 0.45, BEEF_GLO, 0.4, 24.0),
        ("wheat bun", 0.30, WHEAT_GLO, 0.05, 0.6),
        ("cheese slice", 0.15, CHEESE_GLO, 0.2, 9.0),
        ("vegetables", 0.06, VEGETABLES_GLO, 0.01, 0.4),
        ("packaging film", 0.04, PACKAGING_GLO, 0.0, 2.2),
    ];

    let mut rules = vec![(
        r#"Bezeichnung: "Hamburger""#,
        decompose_response(&[
            ("beef patty", 0.45, "materials"),
            ("wheat bun", 0.30, "materials"),
            ("cheese slice", 0.15, "materials"),
            ("vegetables", 0.06, "materials"),
            ("packaging film", 0.04, "packaging"),
        ]),
    )];
    let needles: Vec<String> = components
        .iter()
        .map(|(name, ..)| format!(r#"Bezeichnung: "{name}""#))
        .collect();
    for (i, (_, _, uuid, _, _)) in components.iter().enumerate() {
        rules.push((needles[i].as_str(), match_response(uuid)));
    }
    let conv_needles: Vec<String> = components
        .iter()
        .map(|(name, ..)| format!("Product: {name}"))
        .collect();
    for needle in &conv_needles {
        rules.push((needle.as_str(), conversion_response(0.25, "portion of one unit")));
    }

    let chat = StubChat::new(rules);
    let env = build_env(dir.path(), chat.clone(), Duration::ZERO).await;

    let (_job_id, ids, status) = run_job(
        &env,
        vec![input_row_full("Hamburger", "Stück", None, Some("Scope 3"))],
        JobMode::Auto,
    )
    .await;

    assert_eq!(status, JobStatus::Completed);
    let row = env.jobs.load_row(ids[0]).await.unwrap().unwrap();
    assert_eq!(row.status, RowStatus::Calculated);

    let result = env.jobs.load_result(ids[0]).await.unwrap().unwrap();
    assert_eq!(result.decision_type, DecisionType::Decompose);
    let resolved = result.components.unwrap();
    assert_eq!(resolved.len(), 5);

    // quantities survive as stated and sum to 1.0
    let quantity_sum: f64 = resolved.iter().map(|c| c.quantity).sum();
    assert!((quantity_sum - 1.0).abs() <= 0.02);

    // totals equal the component-wise sum: factor × conversion × quantity
    let mut expected_bio_kg = 0.0;
    let mut expected_common_kg = 0.0;
    for (i, (_, quantity, uuid, bio, common)) in components.iter().enumerate() {
        let scaled_bio = bio * (0.25 * quantity);
        let scaled_common = common * (0.25 * quantity);
        assert_eq!(resolved[i].matched_uuid, *uuid);
        let rel = |a: f64, b: f64| (a - b).abs() / b.abs().max(1e-30);
        assert!(rel(resolved[i].biogenic_kg, scaled_bio) < 1e-9 || scaled_bio == 0.0);
        assert!(rel(resolved[i].common_kg, scaled_common) < 1e-9);
        expected_bio_kg += scaled_bio;
        expected_common_kg += scaled_common;
    }

    // 0.25 × (0.4·0.45 + 0.05·0.30 + 0.2·0.15 + 0.01·0.06) = 0.0564 kg
    assert!((expected_bio_kg - 0.0564).abs() < 1e-12);
    // 0.25 × (24·0.45 + 0.6·0.30 + 9·0.15 + 0.4·0.06 + 2.2·0.04) = 3.1105 kg
    assert!((expected_common_kg - 3.1105).abs() < 1e-12);
    assert_eq!(
        result.biogenic_t.as_deref(),
        Some(format_number(expected_bio_kg / 1000.0).as_str())
    );
    assert_eq!(
        result.common_t.as_deref(),
        Some(format_number(expected_common_kg / 1000.0).as_str())
    );

    // all five sources listed
    let quelle = result.quelle.unwrap();
    for (_, _, uuid, _, _) in &components {
        assert!(quelle.contains(uuid));
    }
    assert!(quelle.len() <= 1000);

    // every component resolved to a non-market dataset
    assert!(resolved.iter().all(|c| !c.matched_uuid.contains("market")));
}

// ── S6: unknown unit ────────────────────────────────────

#[tokio::test]
async fn s6_unknown_unit_fails_row_not_job() {
    let dir = tempfile::tempdir().unwrap();
    let chat = StubChat::new(vec![(
        r#"Bezeichnung: "Stahl""#,
        match_response(STEEL_DE),
    )]);
    let env = build_env(dir.path(), chat.clone(), Duration::ZERO).await;

    let (job_id, ids, status) = run_job(
        &env,
        vec![
            input_row("Rohöl", "Faß"),
            input_row_full("Stahl", "kg", Some("DE"), None),
        ],
        JobMode::Auto,
    )
    .await;

    // the bad row fails, the job continues
    assert_eq!(status, JobStatus::Completed);
    let bad = env.jobs.load_row(ids[0]).await.unwrap().unwrap();
    assert_eq!(bad.status, RowStatus::Error);
    assert!(bad.error_message.unwrap().contains("UnknownUnit"));

    let good = env.jobs.load_row(ids[1]).await.unwrap().unwrap();
    assert_eq!(good.status, RowStatus::Calculated);

    let counters = env.jobs.counters(&job_id).await.unwrap();
    assert_eq!(counters.errors, 1);
    assert_eq!(counters.calculated, 1);
}

// ── nested decomposition never happens ──────────────────

#[tokio::test]
async fn nested_decomposition_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let chat = StubChat::new(vec![
        (
            r#"Bezeichnung: "Gemisch""#,
            decompose_response(&[
                ("mystery paste", 0.5, "materials"),
                ("cheese slice", 0.3, "materials"),
                ("vegetables", 0.2, "materials"),
            ]),
        ),
        // the component answer illegally tries to decompose again
        (
            r#"Bezeichnung: "mystery paste""#,
            decompose_response(&[
                ("a", 0.5, "materials"),
                ("b", 0.3, "materials"),
                ("c", 0.2, "materials"),
            ]),
        ),
    ]);
    let env = build_env(dir.path(), chat.clone(), Duration::ZERO).await;

    let (_job_id, ids, status) = run_job(
        &env,
        vec![input_row("Gemisch", "kg")],
        JobMode::Auto,
    )
    .await;

    assert_eq!(status, JobStatus::Completed);
    let row = env.jobs.load_row(ids[0]).await.unwrap().unwrap();
    assert_eq!(row.status, RowStatus::Error);
    let message = row.error_message.unwrap();
    assert!(message.contains("ComponentFailed"));
    assert!(message.contains("mystery paste"));
    assert!(message.contains("not allowed"));
}

// ── component ambiguity auto-picks in review mode too ───

#[tokio::test]
async fn component_ambiguity_never_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let chat = StubChat::new(vec![
        (
            r#"Bezeichnung: "Fischgericht""#,
            decompose_response(&[
                ("diesel for the boat", 0.4, "energy"),
                ("vegetables", 0.35, "materials"),
                ("packaging film", 0.25, "packaging"),
            ]),
        ),
        (
            r#"Bezeichnung: "diesel for the boat""#,
            ambiguous_response(&[
                (DIESEL_FISHING, "fishing vessel"),
                (DIESEL_BUILDING, "building machine"),
            ]),
        ),
        (r#"Bezeichnung: "vegetables""#, match_response(VEGETABLES_GLO)),
        (
            r#"Bezeichnung: "packaging film""#,
            match_response(PACKAGING_GLO),
        ),
        // diesel datasets are per MJ, the rest per kg: one conversion each
        ("Product: diesel for the boat", conversion_response(12.0, "energy share")),
    ]);
    let env = build_env(dir.path(), chat.clone(), Duration::ZERO).await;

    // review mode: the parent could suspend, components must not
    let (_job_id, ids, status) = run_job(
        &env,
        vec![input_row("Fischgericht", "kg")],
        JobMode::Review,
    )
    .await;

    assert_eq!(status, JobStatus::Completed);
    let row = env.jobs.load_row(ids[0]).await.unwrap().unwrap();
    assert_eq!(row.status, RowStatus::Calculated);

    let result = env.jobs.load_result(ids[0]).await.unwrap().unwrap();
    let resolved = result.components.unwrap();
    // the sub-ambiguity picked the first-listed option
    assert_eq!(resolved[0].matched_uuid, DIESEL_FISHING);
    assert!(resolved[0].conversion.is_some());
}

// ── resolve guards ──────────────────────────────────────

#[tokio::test]
async fn resolve_rejects_unknown_candidate_and_bad_states() {
    let dir = tempfile::tempdir().unwrap();
    let chat = StubChat::new(vec![(
        r#"Bezeichnung: "Diesel Verbrennung""#,
        ambiguous_response(&[
            (DIESEL_BUILDING, "building"),
            (DIESEL_FISHING, "fishing"),
        ]),
    )]);
    let env = build_env(dir.path(), chat.clone(), Duration::ZERO).await;

    let (job_id, ids, _status) = run_job(
        &env,
        vec![input_row_full("Diesel Verbrennung", "l", None, Some("Scope 1"))],
        JobMode::Review,
    )
    .await;

    // a uuid outside the saved candidate set is rejected
    assert!(matches!(
        env.scheduler.resolve(&job_id, ids[0], STEEL_DE).await,
        Err(ResolveError::UnknownCandidate(_))
    ));

    // a row that is not ambiguous is rejected
    let other_job = env.jobs.create_job(JobMode::Review).await.unwrap();
    let other_ids = env
        .jobs
        .add_input_rows(&other_job.id, &[input_row("Stahl", "kg")])
        .await
        .unwrap();
    assert!(matches!(
        env.scheduler
            .resolve(&other_job.id, other_ids[0], STEEL_DE)
            .await,
        Err(ResolveError::NotAmbiguous { .. })
    ));

    // an unknown row id is rejected
    assert!(matches!(
        env.scheduler.resolve(&job_id, 9999, DIESEL_BUILDING).await,
        Err(ResolveError::RowNotFound(_))
    ));
}

// ── rate pacing across workers ──────────────────────────

#[tokio::test]
async fn llm_calls_are_paced_across_workers() {
    let dir = tempfile::tempdir().unwrap();
    let chat = StubChat::new(vec![(
        r#"Bezeichnung: "Stahl""#,
        match_response(STEEL_DE),
    )]);
    let interval = Duration::from_millis(25);
    let env = build_env(dir.path(), chat.clone(), interval).await;

    let rows = vec![
        input_row("Stahl", "kg"),
        input_row("Stahl", "kg"),
        input_row("Stahl", "kg"),
    ];
    let (_job_id, _ids, status) = run_job(&env, rows, JobMode::Auto).await;
    assert_eq!(status, JobStatus::Completed);

    let mut instants = chat.call_instants();
    instants.sort();
    assert_eq!(instants.len(), 3);
    for pair in instants.windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(
            gap >= Duration::from_millis(20),
            "calls only {gap:?} apart"
        );
    }
}

// ── cancellation ────────────────────────────────────────

#[tokio::test]
async fn cancellation_stops_queued_rows() {
    let dir = tempfile::tempdir().unwrap();
    let chat = StubChat::with_delay(
        vec![(r#"Bezeichnung: "Stahl""#, match_response(STEEL_DE))],
        Duration::from_millis(60),
    );
    let env = build_env(dir.path(), chat.clone(), Duration::ZERO).await;

    let rows: Vec<_> = (0..6).map(|_| input_row("Stahl", "kg")).collect();
    let job = env.jobs.create_job(JobMode::Auto).await.unwrap();
    let ids = env.jobs.add_input_rows(&job.id, &rows).await.unwrap();

    let scheduler = env.scheduler.clone();
    let job_id = job.id.clone();
    let handle = tokio::spawn(async move { scheduler.run_job(&job_id).await });

    tokio::time::sleep(Duration::from_millis(15)).await;
    env.scheduler.cancel_job(&job.id);

    let status = handle.await.unwrap().unwrap();
    assert_eq!(status, JobStatus::Error);

    let mut cancelled = 0;
    for id in &ids {
        let row = env.jobs.load_row(*id).await.unwrap().unwrap();
        // every row is settled: either it finished its in-flight work or
        // it was rolled to error with "cancelled"
        assert!(row.status.is_settled(), "row {} left in {:?}", id, row.status);
        if row.status == RowStatus::Error {
            assert_eq!(row.error_message.as_deref(), Some("cancelled"));
            cancelled += 1;
        }
    }
    // the two rows that never reached a worker must be cancelled
    assert!(cancelled >= 2, "expected queued rows to be cancelled");
}

// ── lexical-only degradation ────────────────────────────

#[tokio::test]
async fn broken_embedder_degrades_to_lexical_search() {
    let dir = tempfile::tempdir().unwrap();
    let chat = StubChat::new(vec![(
        r#"Bezeichnung: "Stahl""#,
        match_response(STEEL_DE),
    )]);
    let env = build_env_with_embedder(
        dir.path(),
        chat.clone(),
        Duration::ZERO,
        std::sync::Arc::new(BrokenEmbedder),
    )
    .await;

    let (_job_id, ids, status) = run_job(
        &env,
        vec![input_row_full("Stahl", "kg", Some("DE"), Some("Scope 3"))],
        JobMode::Auto,
    )
    .await;

    assert_eq!(status, JobStatus::Completed);
    let row = env.jobs.load_row(ids[0]).await.unwrap().unwrap();
    assert_eq!(row.status, RowStatus::Calculated);
}
