use async_imap::Session;
use tokio::net::TcpStream;
use tokio_native_tls::native_tls::TlsConnector;
use tokio_native_tls::TlsStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use super::xoauth2::XOAuth2;
use crate::credentials::{Credential, Secret};
use crate::error::ProviderError;

pub type ImapStream = Compat<TlsStream<TcpStream>>;
pub type ImapSession = Session<ImapStream>;

/// Implicit-TLS connect followed by LOGIN or AUTHENTICATE XOAUTH2.
pub async fn connect(host: &str, port: u16, credential: &Credential) -> Result<ImapSession, ProviderError> {
    let tcp = TcpStream::connect((host, port)).await?;
    let tls = TlsConnector::builder()
        .build()
        .map_err(|e| ProviderError::Connect(format!("tls setup: {e}")))?;
    let tls = tokio_native_tls::TlsConnector::from(tls);
    let tls_stream = tls
        .connect(host, tcp)
        .await
        .map_err(|e| ProviderError::Connect(format!("tls handshake with {host}: {e}")))?;
    let client = async_imap::Client::new(tls_stream.compat());

    let session = match &credential.secret {
        Secret::Password(password) => client
            .login(&credential.username, password)
            .await
            .map_err(|(e, _)| ProviderError::Auth(format!("login failed: {e}")))?,
        Secret::OAuthToken(token) => client
            .authenticate("XOAUTH2", XOAuth2::new(&credential.username, token))
            .await
            .map_err(|(e, _)| ProviderError::Auth(format!("xoauth2 failed: {e}")))?,
    };
    tracing::debug!(host = %host, user = %credential.username, "imap session established");
    Ok(session)
}
