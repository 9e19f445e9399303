use std::process::Command;

fn main() {
    // Reported by GET /health
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
    let built = build_time().unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=TUSGATE_BUILD_TIME={built}");
}

/// UTC build timestamp. Honors SOURCE_DATE_EPOCH for reproducible builds.
fn build_time() -> Option<String> {
    let mut date = Command::new("date");
    date.arg("-u");
    if let Ok(epoch) = std::env::var("SOURCE_DATE_EPOCH") {
        date.arg("-d").arg(format!("@{epoch}"));
    }
    let output = date.arg("+%Y-%m-%dT%H:%M:%SZ").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stamp = String::from_utf8(output.stdout).ok()?;
    Some(stamp.trim().to_string())
}
