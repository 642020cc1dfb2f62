use std::process::Command;

/// Release pipelines building from a tarball pass the version in directly
const VERSION_OVERRIDE_ENV: &str = "AGENTGATE_BUILD_VERSION";

/// Trimmed stdout of a successful git command
fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn main() {
    let commit = git(&["rev-parse", "--short", "HEAD"]).unwrap_or_else(|| "unknown".to_string());

    let version = std::env::var(VERSION_OVERRIDE_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| git(&["describe", "--tags", "--abbrev=0"]))
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());

    println!("cargo:rustc-env=AGENTGATE_COMMIT={}", commit);
    println!("cargo:rustc-env=AGENTGATE_VERSION={}", version);
    println!(
        "cargo:rustc-env=AGENTGATE_BUILD_TIME={}",
        chrono::Utc::now().to_rfc3339()
    );

    println!("cargo:rerun-if-env-changed={}", VERSION_OVERRIDE_ENV);
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs");
}
