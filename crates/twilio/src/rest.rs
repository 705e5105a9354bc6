use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

pub const BASE_URL: &str = "https://api.twilio.com/2010-04-01";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Twilio API error ({status}): {message}")]
    Api { status: u16, message: String },
}

#[derive(Debug, Deserialize)]
struct CallResource {
    sid: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

/// Voice call operations the assistant needs.
#[async_trait]
pub trait CallControl: Send + Sync {
    /// Places an outbound call that fetches its TwiML from `url`.
    async fn create_call(&self, to: &str, from: &str, url: &str) -> Result<String, Error>;

    async fn fetch_status(&self, call_sid: &str) -> Result<String, Error>;

    /// Hangs up a live call.
    async fn complete_call(&self, call_sid: &str) -> Result<(), Error>;

    /// Points a live call at new TwiML.
    async fn redirect_call(&self, call_sid: &str, url: &str) -> Result<(), Error>;
}

pub struct TwilioClient {
    http: reqwest::Client,
    base_url: String,
    account_sid: String,
    auth_token: SecretString,
}

impl TwilioClient {
    pub fn new(account_sid: &str, auth_token: SecretString) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: BASE_URL.to_string(),
            account_sid: account_sid.to_string(),
            auth_token,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn calls_url(&self, call_sid: Option<&str>) -> String {
        match call_sid {
            Some(sid) => format!("{}/Accounts/{}/Calls/{}.json", self.base_url, self.account_sid, sid),
            None => format!("{}/Accounts/{}/Calls.json", self.base_url, self.account_sid),
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<CallResource, Error> {
        let response = request
            .basic_auth(&self.account_sid, Some(self.auth_token.expose_secret()))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.message)
                .unwrap_or(body);
            return Err(Error::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }

    async fn update(&self, call_sid: &str, form: &[(&str, &str)]) -> Result<CallResource, Error> {
        self.send(self.http.post(self.calls_url(Some(call_sid))).form(form))
            .await
    }
}

#[async_trait]
impl CallControl for TwilioClient {
    async fn create_call(&self, to: &str, from: &str, url: &str) -> Result<String, Error> {
        tracing::info!("Initiating call to {} via {}", to, url);
        let call = self
            .send(
                self.http
                    .post(self.calls_url(None))
                    .form(&[("To", to), ("From", from), ("Url", url)]),
            )
            .await?;
        Ok(call.sid)
    }

    async fn fetch_status(&self, call_sid: &str) -> Result<String, Error> {
        let call = self.send(self.http.get(self.calls_url(Some(call_sid)))).await?;
        Ok(call.status)
    }

    async fn complete_call(&self, call_sid: &str) -> Result<(), Error> {
        let call = self.update(call_sid, &[("Status", "completed")]).await?;
        tracing::info!("call {} is now {}", call.sid, call.status);
        Ok(())
    }

    async fn redirect_call(&self, call_sid: &str, url: &str) -> Result<(), Error> {
        self.update(call_sid, &[("Url", url), ("Method", "POST")])
            .await?;
        tracing::info!("call {} redirected to {}", call_sid, url);
        Ok(())
    }
}
