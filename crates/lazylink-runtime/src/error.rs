use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadErrorKind {
    FetchError,
    Timeout,
    Missing,
    LinkError,
    UnregisteredDependency,
    ExecutionError,
}

impl LoadErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LoadErrorKind::FetchError => "fetch_error",
            LoadErrorKind::Timeout => "timeout",
            LoadErrorKind::Missing => "missing",
            LoadErrorKind::LinkError => "link_error",
            LoadErrorKind::UnregisteredDependency => "unregistered_dependency",
            LoadErrorKind::ExecutionError => "execution_error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "fetch_error" => Some(LoadErrorKind::FetchError),
            "timeout" => Some(LoadErrorKind::Timeout),
            "missing" => Some(LoadErrorKind::Missing),
            "link_error" => Some(LoadErrorKind::LinkError),
            "unregistered_dependency" => Some(LoadErrorKind::UnregisteredDependency),
            "execution_error" => Some(LoadErrorKind::ExecutionError),
            _ => None,
        }
    }

    /// True if a later `ensure` for the same chunk issues a fresh request.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            LoadErrorKind::FetchError | LoadErrorKind::Timeout | LoadErrorKind::Missing
        )
    }
}

impl fmt::Display for LoadErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed chunk load, link, or dispatch.
///
/// `Clone` because one pending request hands the same failure to every waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadError {
    kind: LoadErrorKind,
    resource: String,
    message: String,
}

impl LoadError {
    pub fn new(kind: LoadErrorKind, resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            resource: resource.into(),
            message: message.into(),
        }
    }

    pub(crate) fn chunk(kind: LoadErrorKind, chunk_id: &str, src: &str, detail: Option<&str>) -> Self {
        let mut message = format!("Loading chunk {chunk_id} failed.\n({kind}: {src})");
        if let Some(detail) = detail {
            message.push_str(&format!("\n{detail}"));
        }
        Self::new(kind, src, message)
    }

    pub(crate) fn link(module_id: &str, err: &anyhow::Error) -> Self {
        Self::new(
            LoadErrorKind::LinkError,
            module_id,
            format!("Linking binary module {module_id:?} failed: {err:#}"),
        )
    }

    pub(crate) fn fetch(module_id: &str, src: &str, err: &anyhow::Error) -> Self {
        Self::new(
            LoadErrorKind::FetchError,
            src,
            format!("Fetching binary module {module_id:?} failed ({src}): {err:#}"),
        )
    }

    pub(crate) fn unregistered(unit_id: &str) -> Self {
        Self::new(
            LoadErrorKind::UnregisteredDependency,
            unit_id,
            format!("Cannot find code unit {unit_id:?}: no loader registered (was its chunk loaded?)"),
        )
    }

    pub(crate) fn execution(unit_id: &str, err: &anyhow::Error) -> Self {
        Self::new(
            LoadErrorKind::ExecutionError,
            unit_id,
            format!("Code unit {unit_id:?} failed: {err:#}"),
        )
    }

    pub fn kind(&self) -> LoadErrorKind {
        self.kind
    }

    /// The chunk script URL, binary module id, or unit id the failure is about.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for LoadError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_round_trip_through_their_names() {
        for &kind in &[
            LoadErrorKind::FetchError,
            LoadErrorKind::Timeout,
            LoadErrorKind::Missing,
            LoadErrorKind::LinkError,
            LoadErrorKind::UnregisteredDependency,
            LoadErrorKind::ExecutionError,
        ] {
            assert_eq!(LoadErrorKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(LoadErrorKind::parse("load"), None);
    }

    #[test]
    fn only_chunk_transport_failures_are_retryable() {
        assert!(LoadErrorKind::FetchError.is_retryable());
        assert!(LoadErrorKind::Timeout.is_retryable());
        assert!(LoadErrorKind::Missing.is_retryable());
        assert!(!LoadErrorKind::LinkError.is_retryable());
        assert!(!LoadErrorKind::UnregisteredDependency.is_retryable());
        assert!(!LoadErrorKind::ExecutionError.is_retryable());
    }

    #[test]
    fn chunk_errors_name_the_kind_and_request() {
        let err = LoadError::chunk(LoadErrorKind::Missing, "0", "/static/0.bootstrap.js", None);
        assert_eq!(err.kind(), LoadErrorKind::Missing);
        assert_eq!(err.resource(), "/static/0.bootstrap.js");
        assert_eq!(
            err.to_string(),
            "Loading chunk 0 failed.\n(missing: /static/0.bootstrap.js)"
        );
    }
}
