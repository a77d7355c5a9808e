use std::{env, process::Command};

/// Short commit hash reported by `GET /health`.
///
/// Packaged builds run outside a checkout, so an explicit `HERALD_GIT_SHA`
/// in the build environment wins over asking git.
fn git_sha() -> String {
    if let Ok(sha) = env::var("HERALD_GIT_SHA") {
        let sha = sha.trim();
        if !sha.is_empty() {
            return sha.to_string();
        }
    }
    Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|sha| !sha.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn main() {
    println!("cargo:rustc-env=HERALD_GIT_SHA={}", git_sha());

    println!("cargo:rerun-if-env-changed=HERALD_GIT_SHA");
    // HEAD moves on checkout, refs move on commit.
    println!("cargo:rerun-if-changed=../../.git/HEAD");
    println!("cargo:rerun-if-changed=../../.git/refs/");
}
