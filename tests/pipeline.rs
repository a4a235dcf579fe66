// Escenarios end-to-end del pipeline (S1..S7) + invariantes cuantificados.
// Todo corre contra SQLite en memoria con generators guionados.

mod support;

use std::sync::Arc;
use std::time::Duration;

use fabrica::db::Database;
use fabrica::error::FactoryError;
use fabrica::factory::Factory;
use fabrica::factory::context::load_context;
use fabrica::llm::{DemoGenerator, MemoryIndex, NoopIndex};
use fabrica::model::{
    BeatEntry, BeatType, CanonFact, ChapterStatus, ProjectStatus, Slot, WorkStatus,
};

use support::{FailKind, Response, ScriptedGenerator, SlowGenerator, harness_with};

// --- S1: happy path, 3 capítulos ---
#[tokio::test(flavor = "multi_thread")]
async fn s1_happy_path_three_chapters() {
    let h = harness_with(DemoGenerator::new()).await;

    let summary = h.factory.start_run(&h.project_id, 3).await.unwrap();

    assert_eq!(summary.chapters_written, 3);
    assert_eq!(summary.chapters_failed, 0);
    assert_eq!(summary.total_rewrites, 0);
    assert!(summary.avg_qc_score >= 7.0, "avg_qc={}", summary.avg_qc_score);
    assert!(summary.cost.session_cost > 0.0);
    assert!(summary.stopped_reason.is_none());

    let project = h.db.get_project(&h.project_id).await.unwrap().unwrap();
    assert_eq!(project.current_chapter, 3);
    assert_eq!(
        h.db.chapter_numbers(&project.novel_id).await.unwrap(),
        vec![1, 2, 3]
    );
    for n in 1..=3 {
        let ch = h.db.get_chapter(&project.novel_id, n).await.unwrap().unwrap();
        assert_eq!(ch.status, ChapterStatus::Draft);
        assert!(ch.word_count > 500);
        assert!(!ch.content.contains("Chương 1:"), "título fuera del cuerpo");
    }
}

// --- P9: round-trip de resúmenes en el contexto ---
#[tokio::test(flavor = "multi_thread")]
async fn p9_context_round_trip_includes_recent_titles() {
    let h = harness_with(DemoGenerator::new()).await;
    h.factory.start_run(&h.project_id, 3).await.unwrap();

    let project = h.db.get_project(&h.project_id).await.unwrap().unwrap();
    let config = h.factory.config().await;
    let bundle = load_context(
        &h.db,
        &NoopIndex,
        &h.factory.heuristics,
        &config,
        &project,
        4,
    )
    .await;

    assert_eq!(bundle.previous_summaries.len(), 3);
    assert_eq!(
        bundle
            .previous_summaries
            .iter()
            .map(|s| s.chapter_number)
            .collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    for s in &bundle.previous_summaries {
        assert_eq!(s.title, "Bước chân không lùi");
        assert!(!s.summary.is_empty());
    }
}

// --- S2: auto-rewrite por sobreuso de beat, segundo intento pasa ---
#[tokio::test(flavor = "multi_thread")]
async fn s2_beat_overuse_rewrite_succeeds() {
    const BREAKTHROUGH_SPAM: &str =
        "Hắn liên tục đột phá, đột phá rồi lại đột phá, bình cảnh vỡ vụn, thăng cấp \
         liền hai lần, cảnh giới mới mở ra trước mắt.";

    let generator = ScriptedGenerator::new(vec![
        Response::GoodPlus(BREAKTHROUGH_SPAM),
        Response::Good,
    ]);
    let h = harness_with(generator.clone()).await;

    // Historial: 5 breakthroughs recientes ya en el ledger, proyecto en ch5.
    for ch in 1..=5 {
        h.db.record_beat(&BeatEntry {
            project_id: h.project_id.clone(),
            chapter_number: ch,
            beat_type: BeatType::Breakthrough,
            category: "power".into(),
            intensity: 6,
            at: 0,
        })
        .await
        .unwrap();
        assert!(h.db.advance_project_chapter(&h.project_id, ch).await.unwrap());
    }

    let summary = h.factory.start_run(&h.project_id, 1).await.unwrap();

    assert_eq!(summary.chapters_written, 1);
    assert_eq!(summary.chapters_needing_review, 0);
    assert_eq!(summary.total_rewrites, 1);
    assert_eq!(summary.results[0].rewrite_attempts, 1);
    assert!(!summary.results[0].needs_human_review);

    // La versión persistida es la reescritura (sin el spam de breakthroughs).
    let project = h.db.get_project(&h.project_id).await.unwrap().unwrap();
    let ch = h.db.get_chapter(&project.novel_id, 6).await.unwrap().unwrap();
    assert!(!ch.content.contains("bình cảnh vỡ vụn"));
    assert_eq!(project.current_chapter, 6);
}

// --- S3: todos los rewrites fallan => revisión humana, sin avance ---
#[tokio::test(flavor = "multi_thread")]
async fn s3_exhausted_rewrites_escalate_to_human_review() {
    let generator = ScriptedGenerator::new(vec![Response::Medium, Response::Weak]);
    let h = harness_with(generator.clone()).await;

    let summary = h.factory.start_run(&h.project_id, 3).await.unwrap();

    // El run se corta en el primer capítulo (default: sin continue_on_review).
    assert_eq!(summary.stopped_reason.as_deref(), Some("human_review"));
    assert_eq!(summary.chapters_needing_review, 1);
    assert_eq!(summary.chapters_written, 0);
    assert_eq!(summary.results[0].rewrite_attempts, 3);

    // P6: cota del writer = 1 + maxRewriteAttempts.
    let config = h.factory.config().await;
    assert_eq!(generator.call_count(), 1 + config.max_rewrite_attempts);

    // El mejor draft quedó guardado, pero el proyecto NO avanzó.
    let project = h.db.get_project(&h.project_id).await.unwrap().unwrap();
    assert_eq!(project.current_chapter, 0);
    let ch = h.db.get_chapter(&project.novel_id, 1).await.unwrap().unwrap();
    assert_eq!(ch.status, ChapterStatus::Draft);
    assert!(ch.word_count > 0);
}

// --- S4: presupuesto diario agotado a mitad de run ---
#[tokio::test(flavor = "multi_thread")]
async fn s4_budget_exhaustion_mid_run() {
    let db = Database::connect_in_memory().await.unwrap();
    let project_id = db.inject_demo_project().await.unwrap();

    // ~0.35 USD por capítulo con estas tarifas y tokens.
    let mut cfg = db.load_factory_config().await.unwrap();
    cfg.daily_budget_usd = 1.0;
    cfg.usd_per_1k_input_tokens = 0.05;
    cfg.usd_per_1k_output_tokens = 0.1;
    cfg.min_inter_chapter_delay_ms = 10;
    db.save_factory_config(&cfg).await.unwrap();

    let generator = ScriptedGenerator::with_tokens(vec![Response::Good], (1_000, 3_000));
    let factory = Factory::new(db.clone(), generator, MemoryIndex::new())
        .await
        .unwrap();

    let summary = factory.start_run(&project_id, 10).await.unwrap();

    assert_eq!(summary.chapters_written, 3);
    assert_eq!(summary.chapters_failed, 0);
    assert_eq!(summary.stopped_reason.as_deref(), Some("budget"));

    let project = db.get_project(&project_id).await.unwrap().unwrap();
    assert_eq!(project.current_chapter, 3);
    assert_eq!(project.status, ProjectStatus::Paused);

    // P3: gasto del día <= presupuesto + un capítulo en vuelo.
    let spent = db.total_cost_since(&project_id, 0).await.unwrap();
    assert!(spent <= 1.0 + 0.36, "spent={spent}");
}

// --- S5: dos ticks concurrentes compiten por el mismo capítulo ---
#[tokio::test(flavor = "multi_thread")]
async fn s5_racing_ticks_claim_exactly_once() {
    let db = Database::connect_in_memory().await.unwrap();
    let project_id = db.inject_demo_project().await.unwrap();

    let mut cfg = db.load_factory_config().await.unwrap();
    cfg.min_inter_chapter_delay_ms = 10;
    db.save_factory_config(&cfg).await.unwrap();

    let generator = Arc::new(SlowGenerator {
        latency: Duration::from_millis(300),
    });
    let factory = Factory::new(db.clone(), generator, MemoryIndex::new())
        .await
        .unwrap();

    // Items ya agendados (el planner no los mueve) y due desde el pasado.
    for n in 1..=3 {
        db.enqueue_write(&project_id, n, 100, Slot::Morning, 0).await.unwrap();
    }

    let f1 = factory.clone();
    let f2 = factory.clone();
    let (a, b) = tokio::join!(f1.tick_scheduler(), f2.tick_scheduler());
    let dispatched = a.unwrap() + b.unwrap();

    // Exactamente un worker escribió el capítulo 1; el otro claim no vio item.
    assert_eq!(dispatched, 1);
    let project = db.get_project(&project_id).await.unwrap().unwrap();
    assert_eq!(project.current_chapter, 1);
    assert_eq!(db.chapter_numbers(&project.novel_id).await.unwrap(), vec![1]);

    let item = db.get_write_item(&project_id, 1).await.unwrap().unwrap();
    assert_eq!(item.status, WorkStatus::Succeeded);
}

// --- P1: ticks secuenciales producen 1,2,3 sin huecos ni duplicados ---
#[tokio::test(flavor = "multi_thread")]
async fn p1_sequential_ticks_preserve_chapter_order() {
    let db = Database::connect_in_memory().await.unwrap();
    let project_id = db.inject_demo_project().await.unwrap();

    let mut cfg = db.load_factory_config().await.unwrap();
    cfg.min_inter_chapter_delay_ms = 10;
    db.save_factory_config(&cfg).await.unwrap();

    let factory = Factory::new(db.clone(), DemoGenerator::new(), MemoryIndex::new())
        .await
        .unwrap();

    for n in 1..=3 {
        db.enqueue_write(&project_id, n, 100, Slot::Morning, 0).await.unwrap();
    }

    // Cada tick puede escribir a lo sumo un capítulo del proyecto (el claim
    // exige chapter == current + 1). Cuatro ticks: el último no tiene nada.
    let mut total = 0;
    for _ in 0..4 {
        total += factory.tick_scheduler().await.unwrap();
    }
    assert_eq!(total, 3);

    let project = db.get_project(&project_id).await.unwrap().unwrap();
    assert_eq!(project.current_chapter, 3);
    assert_eq!(db.chapter_numbers(&project.novel_id).await.unwrap(), vec![1, 2, 3]);
}

// --- S6: ciclo de publicación + segundo tick no-op ---
#[tokio::test(flavor = "multi_thread")]
async fn s6_publish_cycle() {
    let h = harness_with(DemoGenerator::new()).await;
    h.factory.start_run(&h.project_id, 3).await.unwrap();

    let project = h.db.get_project(&h.project_id).await.unwrap().unwrap();
    let before = h.db.novel_updated_at(&project.novel_id).await.unwrap();

    let published = h.factory.tick_publisher().await.unwrap();
    assert_eq!(published, 3);

    for n in 1..=3 {
        let ch = h.db.get_chapter(&project.novel_id, n).await.unwrap().unwrap();
        assert_eq!(ch.status, ChapterStatus::Published);
        assert!(ch.published_at.is_some());
    }
    let after = h.db.novel_updated_at(&project.novel_id).await.unwrap();
    assert!(after >= before);

    // Re-tick: published es terminal.
    assert_eq!(h.factory.tick_publisher().await.unwrap(), 0);
}

// --- S7: violación de canon corregida por la reescritura ---
#[tokio::test(flavor = "multi_thread")]
async fn s7_dead_character_fixed_by_rewrite() {
    const ELDER_LINE: &str = "Trưởng lão Hắc, kẻ đã bỏ mạng từ lâu, bước ra từ bóng tối.";

    let generator =
        ScriptedGenerator::new(vec![Response::GoodPlus(ELDER_LINE), Response::Good]);
    let h = harness_with(generator).await;

    // Canon: el trưởng lão murió en el capítulo 30 (de una corrida previa).
    h.db.upsert_canon_fact(&CanonFact::new(
        &h.project_id,
        "Trưởng lão Hắc",
        "alive",
        "false",
        30,
    ))
    .await
    .unwrap();

    let summary = h.factory.start_run(&h.project_id, 1).await.unwrap();

    assert_eq!(summary.chapters_written, 1);
    assert_eq!(summary.results[0].rewrite_attempts, 1);
    assert!(!summary.results[0].needs_human_review);

    let project = h.db.get_project(&h.project_id).await.unwrap().unwrap();
    let ch = h.db.get_chapter(&project.novel_id, 1).await.unwrap().unwrap();
    assert!(!ch.content.contains("Trưởng lão Hắc"));
    assert_eq!(project.current_chapter, 1);

    // El muerto sigue muerto en el canon.
    let facts = h.db.get_active_facts(&h.project_id).await.unwrap();
    assert!(facts
        .iter()
        .any(|f| f.subject == "Trưởng lão Hắc" && f.predicate == "alive" && f.object == "false"));
}

// --- P7: pause/stop cooperativos en bordes de capítulo ---
#[tokio::test(flavor = "multi_thread")]
async fn p7_pause_and_stop_are_respected() {
    let db = Database::connect_in_memory().await.unwrap();
    let project_id = db.inject_demo_project().await.unwrap();

    let mut cfg = db.load_factory_config().await.unwrap();
    cfg.min_inter_chapter_delay_ms = 50;
    db.save_factory_config(&cfg).await.unwrap();

    let generator = Arc::new(SlowGenerator {
        latency: Duration::from_millis(250),
    });
    let factory = Factory::new(db.clone(), generator, MemoryIndex::new())
        .await
        .unwrap();

    let runner = factory.clone();
    let pid = project_id.clone();
    let handle = tokio::spawn(async move { runner.start_run(&pid, 12).await });

    // Pause en pleno vuelo: el capítulo en curso termina, ninguno nuevo
    // arranca.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(factory.pause(&project_id).await.is_some());

    tokio::time::sleep(Duration::from_millis(900)).await;
    let frozen = db.get_project(&project_id).await.unwrap().unwrap().current_chapter;
    tokio::time::sleep(Duration::from_millis(700)).await;
    let still = db.get_project(&project_id).await.unwrap().unwrap().current_chapter;
    assert_eq!(frozen, still, "paused run must not start new chapters");

    // Resume + Stop: el run termina en el siguiente borde.
    factory.resume(&project_id).await.unwrap();
    factory.stop(&project_id).await.unwrap();

    let summary = handle.await.unwrap().unwrap();
    assert_eq!(summary.stopped_reason.as_deref(), Some("stopped"));
    assert!(summary.chapters_written < 12);

    // La sesión murió con el run.
    assert!(factory.pause(&project_id).await.is_none());
}

// --- P8: serialización por proyecto (una sesión viva a la vez) ---
#[tokio::test(flavor = "multi_thread")]
async fn p8_one_session_per_project() {
    let db = Database::connect_in_memory().await.unwrap();
    let project_id = db.inject_demo_project().await.unwrap();

    let generator = Arc::new(SlowGenerator {
        latency: Duration::from_millis(400),
    });
    let factory = Factory::new(db.clone(), generator, MemoryIndex::new())
        .await
        .unwrap();

    let runner = factory.clone();
    let pid = project_id.clone();
    let handle = tokio::spawn(async move { runner.start_run(&pid, 1).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = factory.start_run(&project_id, 1).await;
    assert!(matches!(second, Err(FactoryError::SessionBusy(_))));

    handle.await.unwrap().unwrap();
}

// --- Writer transitorio agotado: capítulo FAILED, run se corta ---
#[tokio::test(flavor = "multi_thread")]
async fn transient_upstream_failure_fails_the_chapter() {
    let generator = ScriptedGenerator::new(vec![Response::Fail(FailKind::Upstream)]);
    let h = harness_with(generator.clone()).await;

    let summary = h.factory.start_run(&h.project_id, 2).await.unwrap();

    assert_eq!(summary.chapters_written, 0);
    assert_eq!(summary.chapters_failed, 1);
    assert_eq!(summary.stopped_reason.as_deref(), Some("error"));
    // 1 llamada + writer_retries reintentos.
    let config = h.factory.config().await;
    assert_eq!(generator.call_count(), 1 + config.writer_retries);

    let project = h.db.get_project(&h.project_id).await.unwrap().unwrap();
    assert_eq!(project.current_chapter, 0);
}

// --- Contenido vacío: tratado como falla dura y rescatado por el rewriter ---
#[tokio::test(flavor = "multi_thread")]
async fn empty_generation_recovers_via_rewrite() {
    let generator =
        ScriptedGenerator::new(vec![Response::Fail(FailKind::Empty), Response::Good]);
    let h = harness_with(generator).await;

    let summary = h.factory.start_run(&h.project_id, 1).await.unwrap();

    assert_eq!(summary.chapters_written, 1);
    assert_eq!(summary.results[0].rewrite_attempts, 1);

    let project = h.db.get_project(&h.project_id).await.unwrap().unwrap();
    assert_eq!(project.current_chapter, 1);
}

// --- El presupuesto diario sobrevive un restart (totales persistidos) ---
#[tokio::test(flavor = "multi_thread")]
async fn daily_budget_survives_restart() {
    use fabrica::factory::gates::cost::CostGate;
    use fabrica::model::{CostRecord, TaskKind};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fabrica.db");

    let project_id = {
        let db = Database::connect(path.clone()).await.unwrap();
        let project_id = db.inject_demo_project().await.unwrap();
        db.record_cost(&CostRecord {
            project_id: project_id.clone(),
            at: 0,
            task: TaskKind::Writing,
            model: "m".into(),
            input_tokens: 1_000,
            output_tokens: 3_000,
            cost_usd: 0.9,
        })
        .await
        .unwrap();
        project_id
    };

    // "Restart": proceso nuevo, conexión nueva, gate nuevo.
    let db = Database::connect(path).await.unwrap();
    let spent = db.total_cost_since(&project_id, 0).await.unwrap();
    assert!((spent - 0.9).abs() < 1e-9);

    let mut cfg = db.load_factory_config().await.unwrap();
    cfg.daily_budget_usd = 1.0;
    cfg.usd_per_1k_output_tokens = 0.1;
    cfg.usd_per_1k_input_tokens = 0.05;

    let gate = CostGate::new();
    let decision = gate
        .can_proceed(&db, &cfg, &project_id, 1_000, 3_000, TaskKind::Writing)
        .await
        .unwrap();
    assert!(!decision.allowed, "restart must not re-grant budget");
}

// --- AlreadyComplete en el borde ---
#[tokio::test(flavor = "multi_thread")]
async fn run_on_complete_project_reports_already_complete() {
    let h = harness_with(DemoGenerator::new()).await;

    for ch in 1..=12 {
        assert!(h.db.advance_project_chapter(&h.project_id, ch).await.unwrap());
    }

    let err = h.factory.start_run(&h.project_id, 1).await.unwrap_err();
    assert!(matches!(err, FactoryError::AlreadyComplete(_)));
}
