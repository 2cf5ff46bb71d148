//! Integration tests for the `gobuild-nix` CLI.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use tempfile::TempDir;

fn gobuild_nix() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_gobuild-nix"));
    cmd.env_remove("NIX_GOBUILD_PROXY")
        .env_remove("NIX_BUILD_CORES")
        .env_remove("NIX_GOBUILD_CACHE")
        .env_remove("NIX_GOBUILD_CACHE_OUT")
        .env_remove("NIX_GOBUILD_CACHE_VERBOSE")
        .env_remove("SOURCE_DATE_EPOCH")
        .env("RUST_LOG", "warn");
    cmd
}

fn touch(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

#[test]
fn test_help_command() {
    let output = gobuild_nix().arg("--help").output().expect("failed to run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage:"));
    assert!(stdout.contains("merge-cache"));
}

#[test]
fn test_version_command() {
    let output = gobuild_nix().arg("--version").output().expect("failed to run");
    assert!(output.status.success());
}

#[test]
fn test_fmt_mod_normalises_manifest() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("go.mod");
    std::fs::write(
        &file,
        "module example.com/app\ngo 1.22\nrequire (\n  b.com/y v1.0.0 // indirect\n)\nrequire a.com/x v0.1.0\n",
    )
    .unwrap();

    let output = gobuild_nix().arg("fmt-mod").arg(&file).output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("module example.com/app\n"));
    assert!(stdout.contains("go 1.22"));
    assert!(stdout.contains("b.com/y v1.0.0 // indirect"));
    assert!(stdout.contains("a.com/x v0.1.0"));
}

#[test]
fn test_fmt_mod_rejects_garbage() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("go.mod");
    std::fs::write(&file, "module\nrequire (\n").unwrap();

    let output = gobuild_nix().arg("fmt-mod").arg(&file).output().unwrap();
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
}

#[test]
fn test_merge_cache_writes_pinned_manifest() {
    let dir = TempDir::new().unwrap();
    let first = dir.path().join("first");
    let second = dir.path().join("second");
    touch(
        &first,
        "cache/download/a.com/x/@v/v1.0.0.mod",
        "module a.com/x\n\nrequire b.com/y v1.0.0\n",
    );
    touch(&first, "cache/download/b.com/y/@v/v1.0.0.mod", "module b.com/y\n");
    touch(&second, "cache/download/b.com/y/@v/v1.1.0.mod", "module b.com/y\n");

    let target = dir.path().join("merged");
    let manifest = dir.path().join("go.mod");
    let output = gobuild_nix()
        .args(["--jobs", "2", "merge-cache", "--target"])
        .arg(&target)
        .arg("--manifest")
        .arg(&manifest)
        .arg(&first)
        .arg(&second)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let merged =
        std::fs::read_to_string(target.join("cache/download/a.com/x/@v/v1.0.0.mod")).unwrap();
    assert!(merged.contains("require b.com/y v1.1.0"));

    let manifest = std::fs::read_to_string(manifest).unwrap();
    assert!(manifest.contains("module gobuild.nix/build"));
    assert!(manifest.contains("a.com/x v1.0.0"));
    assert!(manifest.contains("b.com/y v1.1.0"));
}

#[test]
fn test_merge_cache_requires_sources() {
    let dir = TempDir::new().unwrap();
    let output = gobuild_nix()
        .arg("merge-cache")
        .arg("--target")
        .arg(dir.path().join("t"))
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_proxy_output_reads_dependency_proxies() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    let dep = dir.path().join("dep");
    touch(
        &src,
        "cache/download/a.com/x/@v/v1.0.0.mod",
        "module a.com/x\n\nrequire b.com/y v1.0.0\n",
    );
    touch(&dep, "cache/download/b.com/y/@v/v1.2.0.mod", "module b.com/y\n");

    let out = dir.path().join("proxy");
    let output = gobuild_nix()
        .env("NIX_GOBUILD_PROXY", &dep)
        .arg("proxy-output")
        .arg("--out")
        .arg(&out)
        .arg(&src)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let manifest =
        std::fs::read_to_string(out.join("cache/download/a.com/x/@v/v1.0.0.mod")).unwrap();
    assert!(manifest.contains("require b.com/y v1.2.0"));
}

fn cache_session(mut cmd: Command, input: &str) -> Vec<serde_json::Value> {
    let mut child = cmd
        .arg("gocacheprog")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    child.stdin.take().unwrap().write_all(input.as_bytes()).unwrap();
    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());
    String::from_utf8(output.stdout)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn response(responses: &[serde_json::Value], id: i64) -> &serde_json::Value {
    responses.iter().find(|r| r["ID"] == id).unwrap()
}

#[test]
fn test_gocacheprog_serves_dependency_cache() {
    let dir = TempDir::new().unwrap();
    let dep = dir.path().join("dep");
    let out = dir.path().join("out");

    let mut cmd = gobuild_nix();
    cmd.env("NIX_GOBUILD_CACHE_OUT", &dep).env("SOURCE_DATE_EPOCH", "315532800");
    let responses = cache_session(
        cmd,
        concat!(
            r#"{"ID":1,"Command":"put","ActionID":"q80=","OutputID":"7w==","BodySize":5}"#,
            "\n\"aGVsbG8=\"\n",
            r#"{"ID":2,"Command":"close"}"#,
            "\n",
        ),
    );
    assert_eq!(responses[0]["KnownCommands"], serde_json::json!(["get", "put", "close"]));
    assert_eq!(response(&responses, 1)["DiskPath"], dep.join("o-ef").display().to_string());
    assert_eq!(responses.last().unwrap()["ID"], 2);
    assert_eq!(std::fs::read(dep.join("o-ef")).unwrap(), b"hello");
    assert!(dep.join("a-abcd").is_file());

    let mut cmd = gobuild_nix();
    cmd.env("NIX_GOBUILD_CACHE", &dep).env("NIX_GOBUILD_CACHE_OUT", &out);
    let responses = cache_session(
        cmd,
        concat!(
            r#"{"ID":1,"Command":"get","ActionID":"q80="}"#,
            "\n",
            r#"{"ID":2,"Command":"get","ActionID":"AA=="}"#,
            "\n",
        ),
    );
    let hit = response(&responses, 1);
    assert_eq!(hit["OutputID"], "7w==");
    assert_eq!(hit["Size"], 5);
    assert_eq!(hit["Time"], "1980-01-01T00:00:00.000000000Z");
    assert_eq!(response(&responses, 2)["Miss"], true);
    assert!(out.is_dir());
}

#[test]
fn test_gocacheprog_rejects_bad_epoch() {
    let mut cmd = gobuild_nix();
    let output = cmd
        .arg("gocacheprog")
        .env("SOURCE_DATE_EPOCH", "yesterday")
        .stdin(Stdio::null())
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("SOURCE_DATE_EPOCH"));
}
