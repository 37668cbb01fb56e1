#![forbid(unsafe_code)]

use std::path::PathBuf;

use rl_conformance::{
    HarnessConfig, HarnessReport, LayerParamCaseReport, RoundCaseReport, SmoothL1CaseReport,
    mode_label, run_layer_param_conformance, run_round_conformance, run_smooth_l1_conformance,
};
use rl_core::ExecutionMode;
use serde_json::{Value, json};

fn main() -> Result<(), String> {
    let mut mode = String::from("both");
    let mut fixture_root: Option<PathBuf> = None;
    let mut output: Option<PathBuf> = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--mode" => {
                mode = args
                    .next()
                    .ok_or_else(|| "--mode requires one of: strict|hardened|both".to_string())?;
            }
            "--fixtures" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--fixtures requires a directory path".to_string())?;
                fixture_root = Some(PathBuf::from(value));
            }
            "--output" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--output requires a file path".to_string())?;
                output = Some(PathBuf::from(value));
            }
            other => {
                return Err(format!(
                    "unknown arg '{other}'. usage: run_conformance_report [--mode strict|hardened|both] [--fixtures dir] [--output path]"
                ));
            }
        }
    }

    let modes = parse_modes(mode.as_str())?;
    let mut config = HarnessConfig::default_paths();
    if let Some(root) = fixture_root {
        config.fixture_root = root;
    }

    let mut mode_reports = Vec::with_capacity(modes.len());
    let mut total = 0usize;
    let mut passed = 0usize;
    for mode in modes {
        let (smooth_l1, smooth_l1_cases) = run_smooth_l1_conformance(&config, mode)?;
        let (round, round_cases) = run_round_conformance(&config, mode)?;
        let (layer_param, layer_param_cases) = run_layer_param_conformance(&config, mode)?;

        let mut failed: Vec<String> = Vec::new();
        failed.extend(
            smooth_l1_cases
                .iter()
                .filter(|case| !case.passed())
                .map(describe_smooth_l1_failure),
        );
        failed.extend(
            round_cases
                .iter()
                .filter(|case| !case.passed())
                .map(describe_round_failure),
        );
        failed.extend(
            layer_param_cases
                .iter()
                .filter(|case| !case.passed())
                .map(describe_layer_param_failure),
        );

        let suites = [smooth_l1, round, layer_param];
        total += suites.iter().map(|suite| suite.cases_total).sum::<usize>();
        passed += suites.iter().map(|suite| suite.cases_passed).sum::<usize>();
        mode_reports.push(json!({
            "mode": mode_label(mode),
            "suites": suites.iter().map(suite_summary).collect::<Vec<Value>>(),
            "failed_cases": failed,
        }));
    }

    let summary = json!({
        "status": if total == passed { "ok" } else { "needs_attention" },
        "fixture_root": config.fixture_root.display().to_string(),
        "cases_total": total,
        "cases_passed": passed,
        "modes": mode_reports,
    });
    let rendered = serde_json::to_string_pretty(&summary)
        .map_err(|error| format!("failed to serialize summary: {error}"))?;

    if let Some(path) = output {
        std::fs::write(&path, rendered.as_bytes())
            .map_err(|error| format!("failed writing {}: {error}", path.display()))?;
    }
    println!("{rendered}");
    Ok(())
}

fn parse_modes(raw: &str) -> Result<Vec<ExecutionMode>, String> {
    match raw {
        "strict" => Ok(vec![ExecutionMode::Strict]),
        "hardened" => Ok(vec![ExecutionMode::Hardened]),
        "both" => Ok(vec![ExecutionMode::Strict, ExecutionMode::Hardened]),
        _ => Err(format!(
            "unsupported mode '{raw}'; expected strict|hardened|both"
        )),
    }
}

fn suite_summary(report: &HarnessReport) -> Value {
    json!({
        "suite": report.suite,
        "cases_total": report.cases_total,
        "cases_passed": report.cases_passed,
    })
}

fn describe_smooth_l1_failure(case: &SmoothL1CaseReport) -> String {
    format!(
        "smooth_l1_loss/{} loss_ok={} pred_grad_ok={} target_grad_ok={} error_ok={} observed_error={}",
        case.name,
        case.loss_ok,
        case.pred_grad_ok,
        case.target_grad_ok,
        case.error_ok,
        case.observed_error.unwrap_or("none")
    )
}

fn describe_round_failure(case: &RoundCaseReport) -> String {
    format!(
        "round/{} output_ok={} backward_policy_ok={}",
        case.name, case.output_ok, case.backward_policy_ok
    )
}

fn describe_layer_param_failure(case: &LayerParamCaseReport) -> String {
    format!(
        "layer_param/{} decode_ok={} ignored_fields_ok={} observed_error={}",
        case.name,
        case.decode_ok,
        case.ignored_fields_ok,
        case.observed_error.unwrap_or("none")
    )
}
