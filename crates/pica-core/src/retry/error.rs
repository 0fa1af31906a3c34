//! Distinguished error types the classifier keys on.

/// Caller-side mistake (bad scheme, bad id, missing auth key). Fails the
/// task immediately; the retry loop refuses to spend attempts on it.
#[derive(Debug)]
pub struct ArgError(pub String);

impl std::fmt::Display for ArgError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ArgError {}

/// Non-2xx HTTP response. Carries a short whitespace-collapsed body snippet
/// so the task's `message` field stays actionable.
#[derive(Debug)]
pub struct HttpStatusError {
    pub status: u16,
    pub snippet: String,
}

impl HttpStatusError {
    pub fn new(status: u16, body: &[u8]) -> Self {
        Self {
            status,
            snippet: collapse_snippet(body),
        }
    }
}

impl std::fmt::Display for HttpStatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.snippet.is_empty() {
            write!(f, "bad status: {}", self.status)
        } else {
            write!(f, "bad status: {}: {}", self.status, self.snippet)
        }
    }
}

impl std::error::Error for HttpStatusError {}

/// Collapse a response body into at most 240 chars of single-spaced text.
pub fn collapse_snippet(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(240).collect()
}
