//! Token renewal and payload decoding collaborators.
//!
//! The engine never acquires tokens or decodes payloads itself. It decides
//! when renewal is needed and hands the work to a [`TokenRenewer`]; inbound
//! message data passes through an optional [`PayloadDecoder`].

use ripple_protocol::{ErrorInfo, Message};

/// Completion of a token renewal: the new access token, or why renewal
/// failed. A failure with status 403 is fatal for the connection.
pub type RenewCallback = Box<dyn FnOnce(Result<String, ErrorInfo>) + Send>;

/// Obtains a fresh access token.
pub trait TokenRenewer: Send + Sync {
    /// Start renewing. `reason` is the token error that triggered renewal,
    /// if any. `done` may be called from any thread, once.
    fn renew(&self, reason: Option<&ErrorInfo>, done: RenewCallback);
}

impl<F> TokenRenewer for F
where
    F: Fn(Option<&ErrorInfo>) -> Result<String, ErrorInfo> + Send + Sync,
{
    fn renew(&self, reason: Option<&ErrorInfo>, done: RenewCallback) {
        done(self(reason));
    }
}

/// Decodes inbound message payloads in place.
pub trait PayloadDecoder: Send + Sync {
    /// Decode `message.data` according to `message.encoding`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be decoded. For delta-encoded
    /// messages this makes the channel re-attach.
    fn decode(&self, channel: &str, message: &mut Message) -> Result<(), ErrorInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_closure_renewer() {
        let renewer = |reason: Option<&ErrorInfo>| match reason {
            Some(e) if e.status_code == 403 => Err(e.clone()),
            _ => Ok("fresh-token".to_string()),
        };

        let result = Arc::new(Mutex::new(None));
        let slot = result.clone();
        renewer.renew(
            Some(&ErrorInfo::new(ErrorInfo::TOKEN_EXPIRED, 401, "expired")),
            Box::new(move |r| *slot.lock().unwrap() = Some(r)),
        );
        assert_eq!(
            result.lock().unwrap().clone(),
            Some(Ok("fresh-token".to_string()))
        );
    }
}
