use std::env;
use std::fs;
use std::path::Path;
use std::process::Command;

use chrono::Utc;

fn main() {
    println!("cargo:rerun-if-env-changed=VIGIL_BUILD_ID_OVERRIDE");
    println!("cargo:rerun-if-env-changed=VIGIL_FILE_VERSION_OVERRIDE");
    println!("cargo:rerun-if-env-changed=VIGIL_BUILD_REVISION");
    for watched in [".git/HEAD".to_string(), ".git/refs".to_string()]
        .into_iter()
        .chain(git_head_path())
    {
        println!("cargo:rerun-if-changed={}", watched);
    }

    let build_time = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let git_label = git_describe().unwrap_or_else(|| "unknown".to_string());
    let build_id = env::var("VIGIL_BUILD_ID_OVERRIDE")
        .unwrap_or_else(|_| format!("{} | {}", build_time, git_label));

    let file_version = env::var("VIGIL_FILE_VERSION_OVERRIDE")
        .ok()
        .and_then(|raw| four_part(&raw))
        .unwrap_or_else(|| {
            let pkg = env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "0.0.0".to_string());
            let revision = env::var("VIGIL_BUILD_REVISION").unwrap_or_else(|_| "0".to_string());
            four_part(&format!("{}.{}", pkg, revision)).unwrap_or_else(|| "0.0.0.0".to_string())
        });

    println!("cargo:rustc-env=VIGIL_BUILD_ID={}", build_id);
    println!("cargo:rustc-env=VIGIL_BUILD_TIME={}", build_time);
    println!("cargo:rustc-env=VIGIL_BUILD_GIT={}", git_label);
    println!("cargo:rustc-env=VIGIL_FILE_VERSION={}", file_version);
}

/// Normalises "1.2.3-beta.4" style input into exactly four numeric parts.
fn four_part(raw: &str) -> Option<String> {
    let core = raw.trim().split(['-', '+']).next()?;
    let mut parts: Vec<u32> = Vec::with_capacity(4);
    for piece in core.split('.').filter(|p| !p.is_empty()) {
        parts.push(piece.parse().ok()?);
    }
    if parts.is_empty() {
        return None;
    }
    parts.resize(4, 0);
    Some(
        parts[..4]
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join("."),
    )
}

/// File whose change means the checked-out commit moved.
fn git_head_path() -> Option<String> {
    let head = fs::read_to_string(".git/HEAD").ok()?;
    let watched = head
        .strip_prefix("ref: ")
        .map(|reference| format!(".git/{}", reference.trim()))
        .filter(|reference| Path::new(reference).exists())
        .unwrap_or_else(|| ".git/HEAD".to_string());
    Some(watched)
}

fn git_describe() -> Option<String> {
    let output = Command::new("git")
        .args(["describe", "--tags", "--dirty", "--always"])
        .output()
        .ok()
        .filter(|output| output.status.success())?;
    let label = String::from_utf8(output.stdout).ok()?;
    Some(label.trim().to_string()).filter(|label| !label.is_empty())
}
