use error::*;

/// The project native wrapper over everything that can go wrong while talking to
/// the Kubernetes API server.
///
/// The interesting part is the [Retryable](retry::Retryable) implementation. A
/// connection failure or a throttled request is the weather and the next tick of
/// whichever task hit it will simply try again. A 4xx rejection of a pod spec,
/// on the other hand, will be rejected tomorrow too, so it is fatal for the job
/// that owns the spec and its text belongs on the event stream.
#[derive(Error, ExecError, Kind, Debug)]
pub enum ApiError {
    #[error("The Kubernetes API server rejected our request")]
    Api(#[source] kube::Error),
    #[error("Failed to connect to the Kubernetes API server")]
    Connection(#[source] kube::Error),
    #[error("The request to the Kubernetes API server failed")]
    Rest(#[source] kube::Error),
}

impl ApiError {
    /// Whether this wraps a 404 from the API server. Callers that treat "the
    /// object is gone" or "the API group does not exist" as acceptable answers
    /// branch on this.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::Api(kube::Error::Api(response)) if response.code == 404)
    }
}

impl From<kube::Error> for ApiError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(_) => ApiError::Api(err),
            kube::Error::Connection(_) => ApiError::Connection(err),
            // Everything else (hyper, serde, TLS, kubeconfig, ...) is lumped
            // together; the source chain keeps the detail.
            _ => ApiError::Rest(err),
        }
    }
}

impl Retryable for ApiError {
    fn retry(&self) -> Retry {
        match self {
            // NotFound, Conflict, and TooManyRequests resolve themselves;
            // every other 4xx means the request itself is unacceptable.
            ApiError::Api(kube::Error::Api(response)) => match response.code {
                404 | 408 | 409 | 429 => Retry::Transient,
                code if code >= 400 && code < 500 => Retry::Fatal,
                _ => Retry::Transient,
            },
            _ => Retry::Transient,
        }
    }
}

/// Returns whether the given raw kube error is a 404 from the API server. The
/// delete path cares because a NotFound on delete means the object is already
/// gone, which is the outcome the caller wanted in the first place.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16) -> ApiError {
        ApiError::from(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "nope".to_string(),
            reason: "Nope".to_string(),
            code,
        }))
    }

    #[test]
    fn rejections_are_fatal() {
        assert!(api_error(400).is_fatal());
        assert!(api_error(403).is_fatal());
        assert!(api_error(422).is_fatal());
    }

    #[test]
    fn weather_is_transient() {
        assert!(api_error(404).is_transient());
        assert!(api_error(409).is_transient());
        assert!(api_error(429).is_transient());
        assert!(api_error(500).is_transient());
        assert!(api_error(503).is_transient());
    }

    #[test]
    fn not_found_detection() {
        assert!(is_not_found(&kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        })));
    }
}
