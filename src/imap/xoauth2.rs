//! XOAUTH2 authentication for IMAP
//!
//! async-imap drives the SASL exchange; this module only supplies the
//! initial client response.

/// Generate XOAUTH2 authentication string
///
/// Format: user={email}\x01auth=Bearer {token}\x01\x01
pub fn generate_xoauth2_string(email: &str, access_token: &str) -> String {
    format!("user={}\x01auth=Bearer {}\x01\x01", email, access_token)
}

pub struct XOAuth2 {
    user: String,
    access_token: String,
    sent: bool,
}

impl XOAuth2 {
    pub fn new(user: &str, access_token: &str) -> Self {
        Self {
            user: user.to_string(),
            access_token: access_token.to_string(),
            sent: false,
        }
    }
}

impl async_imap::Authenticator for XOAuth2 {
    type Response = String;

    // A challenge after the initial response carries the server's JSON error;
    // an empty reply lets it finish with NO.
    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        if std::mem::replace(&mut self.sent, true) {
            return String::new();
        }
        generate_xoauth2_string(&self.user, &self.access_token)
    }
}
