use assert_cmd::Command;

#[test]
fn help_lists_subcommands() {
    let output = Command::cargo_bin("genpool")
        .unwrap()
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    let help = String::from_utf8_lossy(&output.stdout);
    for sub in ["batch", "chat", "generate"] {
        assert!(help.contains(sub), "missing {sub} in:\n{help}");
    }
}

#[test]
fn zero_workers_is_rejected() {
    Command::cargo_bin("genpool")
        .unwrap()
        .args(["batch", "--workers", "0", "--input", "-"])
        .write_stdin("")
        .assert()
        .failure();
}

#[test]
fn unknown_backend_is_rejected() {
    Command::cargo_bin("genpool")
        .unwrap()
        .args(["--backend", "vllm", "generate", "hi"])
        .assert()
        .failure();
}
