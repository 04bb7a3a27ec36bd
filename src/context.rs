//! Per-call dial context.

use http::HeaderMap;
use tokio_util::sync::CancellationToken;

/// Per-call options passed to [`ContextDialer::dial_context`].
///
/// [`ContextDialer::dial_context`]: crate::dialer::ContextDialer::dial_context
#[derive(Debug, Clone, Default)]
pub struct DialContext {
    headers: Option<HeaderMap>,
    cancel: Option<CancellationToken>,
}

impl DialContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Headers merged over the dialer's default CONNECT headers for this call.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Abort the dial when the token is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn headers(&self) -> Option<&HeaderMap> {
        self.headers.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }

    /// Resolves once the dial is cancelled. Never resolves without a token.
    pub async fn cancelled(&self) {
        match &self.cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    }

    /// Merge the per-call headers over `base`.
    pub(crate) fn merge_headers(&self, base: &HeaderMap) -> HeaderMap {
        match &self.headers {
            Some(extra) => merge_headers(base, extra),
            None => base.clone(),
        }
    }
}

/// Overlay `extra` on `base`. A key present in `extra` replaces every value
/// of that key in `base`.
pub fn merge_headers(base: &HeaderMap, extra: &HeaderMap) -> HeaderMap {
    let mut merged = base.clone();
    for key in extra.keys() {
        merged.remove(key);
        for value in extra.get_all(key) {
            merged.append(key.clone(), value.clone());
        }
    }
    merged
}
