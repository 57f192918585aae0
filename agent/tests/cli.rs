use indoc::indoc;

mod common;
use common::{Workspace, agent};

const VALID: &str = indoc! {r#"
    [[component]]
    type = "local.value"
    label = "source"
    arguments = { value = 5 }

    [[component]]
    type = "local.value"
    label = "sink"
    expressions = { value = "local.value.source.value * 2" }
"#};

fn stdout(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn help() {
    let output = agent().arg("--help").output().unwrap();
    assert!(output.status.success());
    let out = stdout(&output);
    assert!(out.contains("check"), "unexpected help: {out}");
    assert!(out.contains("components"), "unexpected help: {out}");
    assert!(out.contains("--pipeline"), "unexpected help: {out}");
}

#[test]
fn components() {
    let output = agent().arg("components").output().unwrap();
    assert!(output.status.success(), "{}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("local.value (generally-available)"), "{out}");
    assert!(out.contains("local.log (public-preview)"), "{out}");
    assert!(out.contains("local.ticker (experimental)"), "{out}");
}

#[test]
fn check_valid_pipeline() {
    let ws = Workspace::new();
    let pipeline = ws.write("pipeline.toml", VALID);
    let output = ws.agent(&pipeline).arg("check").output().unwrap();
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("is valid (2 blocks)"));
}

#[test]
fn check_unknown_component() {
    let ws = Workspace::new();
    let pipeline = ws.write("pipeline.toml", &VALID.replace("\"local.value\"\nlabel = \"sink\"", "\"local.nope\"\nlabel = \"sink\""));
    let output = ws.agent(&pipeline).arg("check").output().unwrap();
    assert!(!output.status.success());
    let err = stderr(&output);
    assert!(err.contains("unknown component type \"local.nope\""), "{err}");
}

#[test]
fn check_cycle() {
    let ws = Workspace::new();
    let pipeline = ws.write(
        "pipeline.toml",
        indoc! {r#"
            [[component]]
            type = "local.value"
            label = "a"
            expressions = { value = "local.value.b.value" }

            [[component]]
            type = "local.value"
            label = "b"
            expressions = { value = "local.value.a.value" }
        "#},
    );
    let output = ws.agent(&pipeline).arg("check").output().unwrap();
    assert!(!output.status.success());
    let err = stderr(&output);
    assert!(err.contains("dependency cycle"), "{err}");
}

#[test]
fn stability_gate() {
    let ws = Workspace::new();
    let pipeline = ws.write(
        "pipeline.toml",
        indoc! {r#"
            [[component]]
            type = "local.ticker"
            label = "tick"
            arguments = { interval = "1s" }
        "#},
    );
    let output = ws.agent(&pipeline).arg("check").output().unwrap();
    assert!(!output.status.success());
    assert!(stderr(&output).contains("experimental"));

    let output = ws
        .agent(&pipeline)
        .args(["--min-stability", "experimental", "check"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", stderr(&output));
}

#[test]
fn missing_pipeline() {
    let ws = Workspace::new();
    let output = ws.agent(&ws.path().join("nope.toml")).arg("check").output().unwrap();
    assert!(!output.status.success());
    assert!(stderr(&output).contains("could not load pipeline"));
}

#[test]
fn options_after_the_command() {
    let ws = Workspace::new();
    let pipeline = ws.write("pipeline.toml", VALID);
    let output = common::agent()
        .current_dir(ws.path())
        .arg("check")
        .arg("--pipeline")
        .arg(&pipeline)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("is valid (2 blocks)"));
}
