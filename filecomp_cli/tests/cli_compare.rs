use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            dir: TempDir::new().expect("temp dir"),
        }
    }

    fn file(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, content).expect("write fixture");
        path
    }

    fn config_path(&self) -> PathBuf {
        self.dir.path().join("filecomp.toml")
    }

    fn filecomp(&self) -> Command {
        let mut cmd = Command::cargo_bin("filecomp").expect("binary");
        cmd.env("RUST_LOG", "error")
            .arg("--config")
            .arg(self.config_path());
        cmd
    }

    fn compare(&self, left: &Path, right: &Path) -> Command {
        let mut cmd = self.filecomp();
        cmd.arg("compare").arg(left).arg(right).arg("--no-progress");
        cmd
    }
}

#[test]
fn identical_files_exit_zero() {
    let fx = Fixture::new();
    let left = fx.file("a.txt", b"one\ntwo\n");
    let right = fx.file("b.txt", b"one\ntwo\n");

    fx.compare(&left, &right)
        .assert()
        .code(0)
        .stdout(predicate::str::contains("Files are identical"));
}

#[test]
fn different_text_exits_one() {
    let fx = Fixture::new();
    let left = fx.file("a.txt", b"abc\ndef\n");
    let right = fx.file("b.txt", b"abc\nxef\n");

    fx.compare(&left, &right)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("2 < def"))
        .stdout(predicate::str::contains("2 > xef"))
        .stdout(predicate::str::contains("1 change block(s)"));
}

#[test]
fn ignore_case_flag() {
    let fx = Fixture::new();
    let left = fx.file("a.txt", b"ABC\n");
    let right = fx.file("b.txt", b"abc\n");

    fx.compare(&left, &right).assert().code(1);
    fx.compare(&left, &right).arg("--ignore-case").assert().code(0);
}

#[test]
fn brief_reports_only_whether_files_differ() {
    let fx = Fixture::new();
    let left = fx.file("a.txt", b"ABC\nsame\n");
    let right = fx.file("b.txt", b"abc\nsame\n");

    fx.compare(&left, &right)
        .arg("--brief")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("differ"))
        .stdout(predicate::str::contains("<").not());
    fx.compare(&left, &right)
        .args(["-q", "-i"])
        .assert()
        .code(0)
        .stdout(predicate::str::is_empty());
}

#[test]
fn json_report_for_text_diff() {
    let fx = Fixture::new();
    let left = fx.file("a.txt", b"abc\ndef\n");
    let right = fx.file("b.txt", b"abc\nxef\n");

    let output = fx.compare(&left, &right).arg("--json").output().expect("run");
    assert_eq!(output.status.code(), Some(1));

    let report: Value = serde_json::from_slice(&output.stdout).expect("json output");
    assert_eq!(report["status"], "text-diff");
    assert_eq!(report["text"]["blocks"][0]["row"], 1);
    assert_eq!(report["text"]["blocks"][0]["rows"], 1);
    assert_eq!(report["text"]["rows"][1]["left"]["Change"]["ranges"][0][0], 0);
    assert_eq!(report["text"]["rows"][1]["left"]["Change"]["ranges"][0][1], 1);
    assert_eq!(report["text"]["rows"][0]["right"]["Common"]["line"], 0);
}

#[test]
fn context_elides_common_lines() {
    let fx = Fixture::new();
    let left = fx.file("a.txt", b"1\n2\n3\n4\n5\n6\n");
    let right = fx.file("b.txt", b"1\n2\n3\n4\n5\nsix\n");

    fx.compare(&left, &right)
        .args(["--context", "1"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("..."))
        .stdout(predicate::str::contains("   1   1").not());
}

#[test]
fn binary_files_report_offsets() {
    let fx = Fixture::new();
    let left = fx.file("a.bin", &[0, 1, 2, 3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    let right = fx.file("b.bin", &[0, 1, 9, 3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);

    fx.compare(&left, &right)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("Binary files differ"))
        .stdout(predicate::str::contains("first difference at offset 0x2"));
}

#[test]
fn missing_file_exits_two() {
    let fx = Fixture::new();
    let left = fx.file("a.txt", b"x\n");

    fx.compare(&left, &fx.dir.path().join("missing.txt"))
        .assert()
        .code(2);
}

#[test]
fn detect_reports_utf16() {
    let fx = Fixture::new();
    let file = fx.file("u16.txt", &[0xFF, 0xFE, b'a', 0, b'\n', 0]);

    fx.filecomp()
        .arg("detect")
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("UTF-16"))
        .stdout(predicate::str::contains("ByteOrderMark"));
}

#[test]
fn config_shows_defaults() {
    let fx = Fixture::new();

    fx.filecomp()
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("filecomp.toml (defaults)"))
        .stdout(predicate::str::contains("max_binary_changes = 32768"));
}

#[test]
fn configured_defaults_apply() {
    let fx = Fixture::new();
    fs::write(fx.config_path(), "[compare]\nignore_all_space = true\n").expect("write config");
    let left = fx.file("a.txt", b"a  b\n");
    let right = fx.file("b.txt", b"a b\n");

    fx.compare(&left, &right).assert().code(0);
}
