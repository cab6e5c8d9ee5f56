// User-facing wording for request failures
//
// Notifications shown to users never carry raw server messages or error
// chains, only a short description and whether trying again may help.

use crate::types::RequestError;

/// Short message suitable for a notification
pub fn user_message(error: &RequestError) -> String {
    match error {
        RequestError::Network(_) => "No connection to the server. Your changes are kept on this device.".to_string(),
        RequestError::Timeout(_) => "The server took too long to respond. Please try again.".to_string(),
        RequestError::Server { .. } => "The server is having trouble right now. Please try again later.".to_string(),
        RequestError::Client { status, .. } => format!("The server rejected the change (code {}).", status),
        RequestError::Cancelled => "The request was cancelled.".to_string(),
        RequestError::Decode(_) => "The server sent an unexpected response.".to_string(),
    }
}

/// Strip an error message down to something safe for log fields
pub fn sanitize_for_logging(message: &str) -> String {
    const MAX_LEN: usize = 200;
    let first_line = message.lines().next().unwrap_or_default();
    if first_line.chars().count() > MAX_LEN {
        let truncated: String = first_line.chars().take(MAX_LEN).collect();
        format!("{}…", truncated)
    } else {
        first_line.to_string()
    }
}
