//! Stamps build provenance into the barracks binary
//!
//! Exposed through `/version`: short and full commit, branch, cargo
//! profile and build time. Outside a git checkout the git values are
//! "unknown".

use std::process::Command;

/// Trimmed stdout of a successful `git` invocation
fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn stamp(key: &str, value: Option<String>) {
    println!(
        "cargo:rustc-env={}={}",
        key,
        value.as_deref().unwrap_or("unknown")
    );
}

fn main() {
    stamp("GIT_COMMIT_SHORT", git(&["rev-parse", "--short", "HEAD"]));
    stamp("GIT_COMMIT_FULL", git(&["rev-parse", "HEAD"]));
    stamp("GIT_BRANCH", git(&["rev-parse", "--abbrev-ref", "HEAD"]));
    stamp("BUILD_PROFILE", std::env::var("PROFILE").ok());
    stamp(
        "BUILD_TIMESTAMP",
        Some(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()),
    );

    for watched in [".git/HEAD", ".git/refs/heads/", "build.rs"] {
        println!("cargo:rerun-if-changed={}", watched);
    }
}
