//! End-to-end renders with a real interpreter. Each test skips itself when no
//! Python with matplotlib, numpy and pandas is available.

use plotsandbox::{EngineConfig, ElementKind, ExecutionOptions, ExecutionStatus, Orchestrator};
use std::path::PathBuf;
use std::time::Duration;

fn python_with_plotting() -> Option<PathBuf> {
    let python = which::which("python3").or_else(|_| which::which("python")).ok()?;
    let status = std::process::Command::new(&python)
        .args(["-c", "import matplotlib, numpy, pandas"])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .ok()?;
    status.success().then_some(python)
}

fn orchestrator(workspaces: &std::path::Path) -> Option<Orchestrator> {
    let Some(python) = python_with_plotting() else {
        eprintln!("skipping: python3 with matplotlib/numpy/pandas not available");
        return None;
    };
    let mut config = EngineConfig::default();
    config.executor.python_path = Some(python);
    config.executor.workspace_base = workspaces.to_path_buf();
    config.executor.dpi = 72;
    Some(Orchestrator::from_config(config).unwrap())
}

fn options(timeout_seconds: u64) -> ExecutionOptions {
    ExecutionOptions {
        timeout_seconds,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_two_dataset_render() {
    let dir = tempfile::tempdir().unwrap();
    let Some(orch) = orchestrator(&dir.path().join("ws")) else { return };

    let sales = dir.path().join("sales.csv");
    let weather = dir.path().join("weather.csv");
    std::fs::write(&sales, "month,revenue\njan,10\nfeb,14\nmar,9\n").unwrap();
    std::fs::write(&weather, "day,temp\n1,20.5\n2,22.0\n3,19.5\n").unwrap();

    let code = "\
import matplotlib.pyplot as plt
fig, (a, b) = plt.subplots(1, 2)
a.bar(df_sales['month'], df_sales['revenue'])
b.plot(df_weather['day'], df_weather['temp'])
";
    let result = orch.run_submission(code, &[sales, weather], options(60)).await;

    assert_eq!(result.status, ExecutionStatus::Success, "{:?}", result.diagnostic);
    let artifact = result.artifact.unwrap();
    assert_eq!(&artifact[..4], b"\x89PNG");
    assert!(result.diagnostic.is_none());
}

#[tokio::test]
async fn test_three_labels_give_three_elements() {
    let dir = tempfile::tempdir().unwrap();
    let Some(orch) = orchestrator(dir.path()) else { return };

    let code = "\
plt.plot([1, 2, 3], [4, 5, 6])
plt.title('Growth')
plt.xlabel('Year')
plt.ylabel('Units')
";
    let result = orch.run_submission(code, &[], options(60)).await;

    assert_eq!(result.status, ExecutionStatus::Success, "{:?}", result.diagnostic);
    assert_eq!(result.elements.len(), 3);
    let kinds: Vec<ElementKind> = result.elements.iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&ElementKind::Title));
    assert!(kinds.contains(&ElementKind::XLabel));
    assert!(kinds.contains(&ElementKind::YLabel));
    for element in &result.elements {
        let b = element.bbox;
        assert!(b.width > 0.0 && b.height > 0.0, "{element:?}");
        assert!(b.x >= 0.0 && b.y >= 0.0 && b.x + b.width <= 1.0 + 1e-9 && b.y + b.height <= 1.0 + 1e-9);
    }

    let title = result.elements.iter().find(|e| e.kind == ElementKind::Title).unwrap();
    let xlabel = result.elements.iter().find(|e| e.kind == ElementKind::XLabel).unwrap();
    // Bottom-left origin: the title sits above the x label
    assert!(title.bbox.y > xlabel.bbox.y);
}

#[tokio::test]
async fn test_infinite_loop_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let Some(orch) = orchestrator(dir.path()) else { return };

    // Warm-up so font cache creation does not count against the 2 s budget
    let _ = orch.run_submission("plt.plot([1])", &[], options(60)).await;

    let started = std::time::Instant::now();
    let result = orch.run_submission("while True:\n    pass\n", &[], options(2)).await;

    assert_eq!(result.status, ExecutionStatus::Timeout);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(result.artifact.is_none());
    assert_eq!(orch.health().live_workers, 0);
}

/// RLIMIT_AS caps virtual size, and importing matplotlib, numpy and pandas
/// already reserves several hundred MB of address space for BLAS buffers and
/// shared libraries. The cap has to clear that before it says anything about
/// the submission.
#[cfg(all(unix, not(target_os = "macos")))]
const CAPPED_BYTES: u64 = 1024 * 1024 * 1024;

/// 8 GiB requested but never touched, so an uncapped run does not commit it.
#[cfg(all(unix, not(target_os = "macos")))]
const OVERSIZED_ALLOCATION: &str = "big = np.empty((1024, 1024, 1024))\nplt.plot(big[0, 0, :10])";

#[cfg(all(unix, not(target_os = "macos")))]
fn capped(memory_cap_bytes: u64) -> ExecutionOptions {
    ExecutionOptions {
        timeout_seconds: 60,
        memory_cap_bytes,
        ..Default::default()
    }
}

#[cfg(all(unix, not(target_os = "macos")))]
#[tokio::test]
async fn test_memory_cap_is_resource_exceeded() {
    let dir = tempfile::tempdir().unwrap();
    let Some(orch) = orchestrator(dir.path()) else { return };

    let result = orch.run_submission(OVERSIZED_ALLOCATION, &[], capped(CAPPED_BYTES)).await;

    assert_eq!(result.status, ExecutionStatus::ResourceExceeded, "{:?}", result.diagnostic);
    assert!(result.artifact.is_none());
}

#[cfg(all(unix, not(target_os = "macos")))]
#[tokio::test]
async fn test_same_allocation_without_cap_is_not_resource_exceeded() {
    let dir = tempfile::tempdir().unwrap();
    let Some(orch) = orchestrator(dir.path()) else { return };

    let result = orch.run_submission(OVERSIZED_ALLOCATION, &[], capped(0)).await;

    // Success where the kernel overcommits, runtime_error where it refuses
    assert_ne!(result.status, ExecutionStatus::ResourceExceeded, "{:?}", result.diagnostic);
}

#[cfg(all(unix, not(target_os = "macos")))]
#[tokio::test]
async fn test_small_plot_fits_under_cap() {
    let dir = tempfile::tempdir().unwrap();
    let Some(orch) = orchestrator(dir.path()) else { return };

    let code = "\
x = np.linspace(0, 1, 200)
frame = pd.DataFrame({'x': x, 'y': x ** 2})
plt.plot(frame['x'], frame['y'])
plt.title('Small')
";
    let result = orch.run_submission(code, &[], capped(CAPPED_BYTES)).await;

    assert_eq!(result.status, ExecutionStatus::Success, "{:?}", result.diagnostic);
    assert!(result.artifact.is_some());
}

#[tokio::test]
async fn test_rejected_code_reports_violations() {
    let dir = tempfile::tempdir().unwrap();
    let Some(orch) = orchestrator(dir.path()) else { return };

    let result = orch
        .run_submission("open('/etc/passwd').read()\nplt.plot([1])", &[], options(10))
        .await;

    assert_eq!(result.status, ExecutionStatus::SafetyRejected);
    assert!(result
        .violations
        .iter()
        .any(|v| v.rule == plotsandbox::RuleId::FileAccess));
    assert_eq!(orch.health().spawned_workers, 0);
}
