//! Bearer token authentication for Runtime calls.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

/// A bearer token sent with every Runtime call.
///
/// Clones share the token: [`replace`](AccessToken::replace) on any clone is
/// picked up by the next call made through any connection built from it. An
/// empty token sends no `authorization` header. `Debug` never shows the token.
#[derive(Clone)]
pub struct AccessToken {
    sender: Arc<watch::Sender<String>>,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("is_empty", &self.is_empty())
            .finish_non_exhaustive()
    }
}

impl Default for AccessToken {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl AccessToken {
    /// Create a token. An empty string sends no header.
    pub fn new(token: impl Into<String>) -> Self {
        let (sender, _) = watch::channel(token.into());
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Use `token` from the next call on.
    pub fn replace(&self, token: impl Into<String>) {
        self.sender.send_replace(token.into());
    }

    /// Whether calls are currently sent without an `authorization` header.
    pub fn is_empty(&self) -> bool {
        self.sender.borrow().is_empty()
    }

    pub(crate) fn interceptor(&self) -> BearerInterceptor {
        BearerInterceptor {
            token: self.sender.subscribe(),
        }
    }
}

/// Adds the current [`AccessToken`] to outgoing requests.
#[derive(Clone)]
pub(crate) struct BearerInterceptor {
    token: watch::Receiver<String>,
}

impl fmt::Debug for BearerInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerInterceptor").finish_non_exhaustive()
    }
}

impl tonic::service::Interceptor for BearerInterceptor {
    fn call(&mut self, mut req: tonic::Request<()>) -> Result<tonic::Request<()>, tonic::Status> {
        let token = self.token.borrow();
        if !token.is_empty() {
            let value = format!("Bearer {}", *token)
                .parse::<tonic::metadata::MetadataValue<_>>()
                .map_err(|_| tonic::Status::unauthenticated("access token contains invalid characters"))?;
            req.metadata_mut().insert("authorization", value);
        }
        Ok(req)
    }
}
