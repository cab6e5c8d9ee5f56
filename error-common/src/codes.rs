// HTTP status classification used by the retry layer

pub mod status {
    pub const REQUEST_TIMEOUT: u16 = 408;
    pub const TOO_MANY_REQUESTS: u16 = 429;
}

/// Broad class of a failed HTTP status code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// Worth retrying: 5xx, 429, 408
    Transient,
    /// The request itself is wrong: any other 4xx
    Rejected,
    /// Not an error status
    Success,
}

/// Classify an HTTP status code
pub fn classify_status(status: u16) -> StatusClass {
    match status {
        status::REQUEST_TIMEOUT | status::TOO_MANY_REQUESTS => StatusClass::Transient,
        500..=599 => StatusClass::Transient,
        400..=499 => StatusClass::Rejected,
        _ => StatusClass::Success,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_statuses() {
        for code in [500, 502, 503, 504, 429, 408] {
            assert_eq!(classify_status(code), StatusClass::Transient, "status {}", code);
        }
    }

    #[test]
    fn test_rejected_statuses() {
        for code in [400, 401, 403, 404, 409, 422] {
            assert_eq!(classify_status(code), StatusClass::Rejected, "status {}", code);
        }
    }

    #[test]
    fn test_success_statuses() {
        assert_eq!(classify_status(200), StatusClass::Success);
        assert_eq!(classify_status(204), StatusClass::Success);
    }
}
