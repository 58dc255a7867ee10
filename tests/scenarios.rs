//! End-to-end scenarios, scaled down for CI: small memory, short
//! runtimes, but the full setup → stress → teardown → analysis path.

use clap::Parser;

use hwstress::config::Args;
use hwstress::controller::Sat;

fn args(argv: &[&str]) -> Args {
    let mut full = vec!["hwstress"];
    full.extend_from_slice(argv);
    Args::parse_from(full)
}

fn run(argv: &[&str]) -> (i32, u64) {
    hwstress::util::test_logging();
    let mut sat = Sat::new(args(argv)).expect("constructible");
    let code = sat.run();
    let diagnoses = sat.report().diagnosis_count();
    (code, diagnoses)
}

#[test]
fn copy_run_exits_clean() {
    let (code, diagnoses) = run(&["-M", "8", "-p", "65536", "-m", "2", "-s", "1", "--no_affinity"]);
    assert_eq!(code, 0);
    assert_eq!(diagnoses, 0);
}

#[test]
fn invert_and_check_run_exits_clean() {
    let (code, diagnoses) = run(&[
        "-M",
        "8",
        "-p",
        "65536",
        "-m",
        "1",
        "-i",
        "1",
        "-c",
        "1",
        "-s",
        "1",
        "--no_affinity",
    ]);
    assert_eq!(code, 0);
    assert_eq!(diagnoses, 0);
}

#[test]
fn pause_resume_cycle_completes() {
    // One second of pause inside a three second run; the workers must
    // rendezvous, wait and come back without wedging.
    let (code, diagnoses) = run(&[
        "-M",
        "8",
        "-p",
        "65536",
        "-m",
        "2",
        "-s",
        "3",
        "--pause_delay",
        "1",
        "--pause_duration",
        "1",
        "--no_affinity",
    ]);
    assert_eq!(code, 0);
    assert_eq!(diagnoses, 0);
}

#[test]
fn tag_mode_run_exits_clean() {
    let (code, diagnoses) = run(&[
        "-M",
        "8",
        "-p",
        "65536",
        "-m",
        "1",
        "-s",
        "1",
        "--tag_mode",
        "--no_affinity",
    ]);
    assert_eq!(code, 0);
    assert_eq!(diagnoses, 0);
}

#[test]
fn cache_coherency_run_exits_clean() {
    let (code, diagnoses) = run(&[
        "-M",
        "8",
        "-p",
        "65536",
        "-m",
        "1",
        "-s",
        "1",
        "--cc_test",
        "--cc_inc_count",
        "500",
        "--no_affinity",
    ]);
    assert_eq!(code, 0);
    assert_eq!(diagnoses, 0);
}

#[test]
fn file_io_roundtrip_exits_clean() {
    let path = std::env::temp_dir().join(format!("hwstress-file-{}.img", std::process::id()));
    let path_str = path.to_str().unwrap().to_string();
    let (code, diagnoses) = run(&[
        "-M",
        "8",
        "-p",
        "65536",
        "-m",
        "1",
        "-s",
        "2",
        "-f",
        &path_str,
        "--filesize",
        "1048576",
        "--no_affinity",
    ]);
    let _ = std::fs::remove_file(&path);
    assert_eq!(code, 0);
    assert_eq!(diagnoses, 0);
}

#[test]
fn coarse_grain_pool_run_exits_clean() {
    let (code, diagnoses) = run(&[
        "-M",
        "8",
        "-p",
        "65536",
        "-m",
        "2",
        "-s",
        "1",
        "--coarse_grain_lock",
        "--no_affinity",
    ]);
    assert_eq!(code, 0);
    assert_eq!(diagnoses, 0);
}

#[test]
fn bad_configuration_is_rejected() {
    let parsed = args(&["--tag_mode", "-f", "/tmp/whatever"]);
    assert!(Sat::new(parsed).is_err());
    let parsed = args(&["-p", "1000"]);
    assert!(Sat::new(parsed).is_err());
}
