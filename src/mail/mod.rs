//! Outbound mail transport and message checks.

pub mod smtp;

use async_trait::async_trait;
use lettre::Address;
use lettre::address::AddressError;

use crate::error::SendFailure;

pub use smtp::SmtpMailer;

/// Per-recipient mail transport.
///
/// Returns a delivery reference (usually the Message-ID) on success. Failures
/// should be tagged `Permanent` when the server gave a terminal reply.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, recipient: &str, subject: &str, html: &str)
    -> Result<String, SendFailure>;
}

/// Check that a string is a syntactically valid mailbox address.
pub fn validate_address(address: &str) -> Result<Address, AddressError> {
    address.trim().parse::<Address>()
}

/// Email-client compatibility lint for rendered HTML.
///
/// Returns human-readable findings; entries prefixed with `WARNING:` are
/// features known to break in common clients.
pub fn validate_html(html: &str) -> Vec<String> {
    let mut issues = Vec::new();

    if !html.to_lowercase().contains("doctype html") {
        issues.push("Missing DOCTYPE declaration".to_string());
    }
    if !html.contains("xmlns:v=\"urn:schemas-microsoft-com:vml\"") {
        issues.push("Missing VML namespace for Outlook compatibility".to_string());
    }
    if !html.contains("<!--[if mso") {
        issues.push("Missing Outlook conditional comments".to_string());
    }
    if !html.contains("border-collapse:collapse") && !html.contains("border-collapse: collapse") {
        issues.push("Missing border-collapse for table compatibility".to_string());
    }
    if html.contains("display: flex") {
        issues.push("WARNING: CSS flexbox not supported in many email clients".to_string());
    }
    if html.contains("background-image") && !html.contains("mso-hide") {
        issues.push("WARNING: Background images not supported in Outlook".to_string());
    }

    issues
}
