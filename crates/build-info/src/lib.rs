use once_cell::sync::Lazy;

/// Prefix of the version marker embedded in every binary that links this crate.
pub const MARKER_PREFIX: &str = "@(#)vigil-file-version:";

/// Marker scanned by the version oracle; NUL-terminated so readers know where it stops.
#[used]
static EMBEDDED_MARKER: &str = concat!(
    "@(#)vigil-file-version:",
    env!("VIGIL_FILE_VERSION"),
    "\0"
);

#[derive(Debug)]
struct BuildMeta {
    build_id: String,
    build_time: String,
    git_label: String,
}

impl BuildMeta {
    fn collect() -> Self {
        let build_id = option_env!("VIGIL_BUILD_ID")
            .unwrap_or("unknown build")
            .to_string();
        let build_time = option_env!("VIGIL_BUILD_TIME")
            .unwrap_or("unknown time")
            .to_string();
        let git_label = option_env!("VIGIL_BUILD_GIT")
            .unwrap_or("unknown git")
            .to_string();
        Self {
            build_id,
            build_time,
            git_label,
        }
    }
}

static META: Lazy<BuildMeta> = Lazy::new(BuildMeta::collect);

/// Four-part file version baked in at build time (e.g. "0.1.0.0").
///
/// Read back out of the marker so the marker stays referenced in every binary.
pub fn file_version() -> &'static str {
    embedded_marker().trim_start_matches(MARKER_PREFIX)
}

/// The full marker as it appears in the binary, without the trailing NUL.
pub fn embedded_marker() -> &'static str {
    std::hint::black_box(EMBEDDED_MARKER).trim_end_matches('\0')
}

/// Full build identifier (e.g. "2025-10-05 15:47:12 UTC | v1.2.3-8a4f1d2-dirty").
pub fn build_id() -> &'static str {
    META.build_id.as_str()
}

/// Human readable build timestamp (UTC).
pub fn build_timestamp() -> &'static str {
    META.build_time.as_str()
}

/// Git tag/commit label detected at build time.
pub fn git_label() -> &'static str {
    META.git_label.as_str()
}

/// Display banner for a specific binary.
pub fn formatted_banner(package: &str) -> String {
    format!("{} {} | {}", package, file_version(), build_id())
}
