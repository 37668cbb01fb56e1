use std::path::Path;

use rl_api::LayerSession;
use rl_conformance::{
    HarnessConfig, error_label, run_layer_param_conformance, run_round_conformance,
    run_smoke, run_smooth_l1_conformance,
};
use rl_config::{DecodeMode, LayerParam};
use rl_core::{Blob, BlobShape, ExecutionMode};
use rl_runtime::EvidenceKind;

#[test]
fn smoke_report_is_stable() {
    let cfg = HarnessConfig::default_paths();
    let report = run_smoke(&cfg);
    assert_eq!(report.suite, "smoke");
    assert_eq!(report.fixture_count, 3);
    assert!(report.cases_total > 0);
    assert_eq!(report.cases_total, report.cases_passed);

    let fixture_path = cfg.fixture_root.join("smooth_l1_cases.json");
    assert!(Path::new(&fixture_path).exists());
}

#[test]
fn hardened_smoke_report_is_green() {
    let cfg = HarnessConfig {
        strict_mode: false,
        ..HarnessConfig::default_paths()
    };
    let report = run_smoke(&cfg);
    assert!(!report.strict_mode);
    assert_eq!(report.cases_total, report.cases_passed);
}

#[test]
fn every_suite_executes_in_both_modes() {
    let cfg = HarnessConfig::default_paths();
    for mode in [ExecutionMode::Strict, ExecutionMode::Hardened] {
        let (smooth_l1, _) =
            run_smooth_l1_conformance(&cfg, mode).expect("smooth l1 suite should run");
        let (round, _) = run_round_conformance(&cfg, mode).expect("round suite should run");
        let (layer_param, _) =
            run_layer_param_conformance(&cfg, mode).expect("layer param suite should run");

        assert_eq!(smooth_l1.cases_total, smooth_l1.cases_passed);
        assert_eq!(round.cases_total, round.cases_passed);
        assert_eq!(layer_param.cases_total, layer_param.cases_passed);
    }
}

#[test]
fn missing_fixture_root_fails_closed() {
    let cfg = HarnessConfig {
        fixture_root: std::env::temp_dir().join("rl_conformance_missing_fixture_root"),
        strict_mode: true,
    };
    let err = run_smooth_l1_conformance(&cfg, ExecutionMode::Strict)
        .expect_err("missing fixture must fail");
    assert!(err.contains("smooth_l1_cases.json"));

    let report = run_smoke(&cfg);
    assert_eq!(report.fixture_count, 0);
    assert_eq!(report.cases_total, 0);
}

#[test]
fn regression_layer_roundtrip_through_json_config() {
    let param = LayerParam::smooth_l1("loss_bbox", 3.0)
        .with_bottoms([
            "bbox_pred",
            "bbox_targets",
            "bbox_inside_weights",
            "bbox_outside_weights",
        ])
        .with_tops(["loss_bbox"]);
    let payload = rl_config::encode_layer_param(&param).expect("encode");
    let mut session = LayerSession::from_json(&payload, DecodeMode::Strict, ExecutionMode::Strict)
        .expect("strict decode");

    let shape = BlobShape::nchw(1, 2, 1, 1);
    let pred = Blob::from_data(shape.clone(), vec![0.05, -1.0]).expect("pred");
    let target = Blob::new(shape.clone());
    let inside = Blob::filled(shape.clone(), 1.0);
    let outside = Blob::from_data(shape, vec![2.0, 1.0]).expect("outside");
    session
        .bind_bottom(vec![pred, target, inside, outside])
        .expect("bind four inputs");

    // sigma2 = 9: 0.5 * 0.0025 * 9 * 2 + (1 - 1/18)
    let objective = session.forward().expect("forward");
    assert!((objective - (0.0225 + 1.0 - 1.0 / 18.0)).abs() < 1e-12);

    let report = session
        .backward(&[true, true, false, false])
        .expect("backward");
    assert_eq!(report.propagated, vec![0, 1]);
    let grad = session.bottom_gradient(0).expect("pred grad");
    assert!((grad[0] - 0.9).abs() < 1e-12);
    assert_eq!(grad[1], -1.0);

    let kinds: Vec<EvidenceKind> = session
        .evidence()
        .iter()
        .map(|entry| entry.kind())
        .collect();
    assert_eq!(
        kinds,
        vec![
            EvidenceKind::Policy,
            EvidenceKind::Policy,
            EvidenceKind::Setup,
            EvidenceKind::Reshape,
            EvidenceKind::Forward,
            EvidenceKind::Backward,
        ]
    );
}

#[test]
fn error_labels_follow_session_failures() {
    let mut session = LayerSession::from_param(&LayerParam::round("q"), ExecutionMode::Strict)
        .expect("session");
    let err = session.forward().expect_err("nothing bound");
    assert_eq!(error_label(&err), "not_bound");

    let err = session
        .bind_bottom(vec![Blob::new(BlobShape::scalar()), Blob::new(BlobShape::scalar())])
        .expect_err("round takes one input");
    assert_eq!(error_label(&err), "bottom_count");

    let param = LayerParam::smooth_l1("loss", 1.0).with_bottoms(["pred", "target", "inside"]);
    let mut session = LayerSession::from_param(&param, ExecutionMode::Strict).expect("session");
    let shape = BlobShape::nchw(1, 1, 1, 2);
    let err = session
        .bind_bottom(vec![Blob::new(shape.clone()), Blob::new(shape)])
        .expect_err("three bottoms declared");
    assert_eq!(error_label(&err), "declared_bottom_count");

    let shape = BlobShape::nchw(0, 1, 1, 2);
    let err = session
        .bind_bottom(vec![
            Blob::new(shape.clone()),
            Blob::new(shape.clone()),
            Blob::new(shape),
        ])
        .expect_err("empty batch");
    assert_eq!(error_label(&err), "empty_batch");
}
