use serde::Serialize;

#[derive(Clone, Copy, Debug, Serialize)]
pub(crate) struct BuildInfo {
    pub(crate) version: &'static str,
    pub(crate) git_commit: &'static str,
    pub(crate) git_ref: &'static str,
}

/// Commit and ref are stamped by the image build through `GIT_COMMIT` and `GIT_REF`.
pub(crate) const BUILD_INFO: BuildInfo = BuildInfo {
    version: env!("CARGO_PKG_VERSION"),
    git_commit: or_unknown(option_env!("GIT_COMMIT")),
    git_ref: or_unknown(option_env!("GIT_REF")),
};

const fn or_unknown(value: Option<&'static str>) -> &'static str {
    match value {
        Some(value) => value,
        None => "unknown",
    }
}
